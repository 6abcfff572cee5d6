//! Git-flow operations behind the request surface: branch status, push
//! and merge retries, and pull-request creation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use braid_store::PushStatus;

use crate::engine::Engine;
use crate::events::Event;
use crate::workspace::{BranchStatus, PushOutcome, WorkspaceManager};

/// Pull-request details recorded on a goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrCreated {
    pub pr_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
}

impl Engine {
    /// Resolve the (manager, strand workspace, branch, worktree path)
    /// tuple a git-flow operation needs, or explain what is missing.
    async fn goal_git_context(
        &self,
        goal_id: &str,
    ) -> Result<(WorkspaceManager, PathBuf, String, PathBuf)> {
        let Some(manager) = self.workspace.clone() else {
            bail!("git features are disabled (no workspacesDir configured)");
        };
        let data = self.store.snapshot().await;
        let goal = data
            .goal(goal_id)
            .with_context(|| format!("goal {goal_id} not found"))?;
        let worktree = goal
            .worktree
            .as_ref()
            .with_context(|| format!("goal {goal_id} has no worktree"))?;
        let ws_path = goal
            .strand_id
            .as_ref()
            .and_then(|sid| data.strand(sid))
            .and_then(|s| s.workspace.as_ref())
            .map(|ws| PathBuf::from(&ws.path))
            .with_context(|| format!("goal {goal_id} has no strand workspace"))?;
        Ok((
            manager,
            ws_path,
            worktree.branch.clone(),
            PathBuf::from(&worktree.path),
        ))
    }

    /// `goals.branchStatus`: ahead/behind counts and conflict files.
    pub async fn goal_branch_status(&self, goal_id: &str) -> Result<BranchStatus> {
        let (manager, ws, branch, _) = self.goal_git_context(goal_id).await?;
        tokio::task::spawn_blocking(move || manager.check_branch_status(&ws, &branch))
            .await
            .context("branch status task panicked")?
            .map_err(Into::into)
    }

    /// `goals.retryPush`: push the goal branch again and record the
    /// outcome.
    pub async fn goal_retry_push(&self, goal_id: &str) -> Result<PushOutcome> {
        let (manager, ws, branch, _) = self.goal_git_context(goal_id).await?;
        let push = {
            let branch = branch.clone();
            tokio::task::spawn_blocking(move || manager.push_goal_branch(&ws, &branch))
                .await
                .context("push task panicked")?
        };

        let clock = Arc::clone(&self.clock);
        let goal_id_owned = goal_id.to_owned();
        let status = match &push {
            Ok(PushOutcome::Pushed) => Some(PushStatus::Pushed),
            Ok(PushOutcome::NoRemote) => None,
            Err(_) => Some(PushStatus::Failed),
        };
        self.store
            .update(move |data| {
                let goal = data
                    .goal_mut(&goal_id_owned)
                    .with_context(|| format!("goal {goal_id_owned} not found"))?;
                goal.push_status = status;
                goal.touch(clock.as_ref());
                Ok(())
            })
            .await?;

        match push {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.events.broadcast(Event::GoalPushFailed {
                    goal_id: goal_id.to_owned(),
                    branch,
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// `goals.retryMerge`: run the auto-merge flow again after the
    /// operator resolved whatever blocked it.
    ///
    /// `complete_goal` rejects goals with open tasks, so a follow-up task
    /// added after the conflict must finish before the retry can land.
    pub async fn goal_retry_merge(self: &Arc<Self>, goal_id: &str) -> Result<()> {
        // Validates the git context up front so a goal without a worktree
        // is reported instead of silently auto-completing.
        self.goal_git_context(goal_id).await?;
        self.complete_goal(goal_id).await
    }

    /// `goals.pushMain`: push the strand's main branch.
    pub async fn goal_push_main(&self, goal_id: &str) -> Result<PushOutcome> {
        let (manager, ws, _, _) = self.goal_git_context(goal_id).await?;
        tokio::task::spawn_blocking(move || manager.push_main(&ws))
            .await
            .context("push task panicked")?
            .map_err(Into::into)
    }

    /// `goals.createPR`: push the branch and open a pull request via the
    /// hosting CLI, recording the URL and number on the goal.
    pub async fn goal_create_pr(&self, goal_id: &str) -> Result<PrCreated> {
        let (manager, ws, branch, _) = self.goal_git_context(goal_id).await?;
        let data = self.store.snapshot().await;
        let goal = data
            .goal(goal_id)
            .with_context(|| format!("goal {goal_id} not found"))?;
        let title = goal.title.clone();
        let body = if goal.description.is_empty() {
            format!("Automated PR for goal {goal_id}.")
        } else {
            goal.description.clone()
        };

        let pr = {
            let manager = manager.clone();
            let ws = ws.clone();
            let branch = branch.clone();
            tokio::task::spawn_blocking(move || {
                match manager.push_goal_branch(&ws, &branch)? {
                    PushOutcome::NoRemote => bail!("no remote configured; cannot open a PR"),
                    PushOutcome::Pushed => {}
                }
                manager
                    .create_pull_request(&ws, &branch, &title, &body)
                    .map_err(Into::into)
            })
            .await
            .context("PR task panicked")??
        };

        let clock = Arc::clone(&self.clock);
        let goal_id_owned = goal_id.to_owned();
        let url = pr.url.clone();
        let number = pr.number;
        self.store
            .update(move |data| {
                let goal = data
                    .goal_mut(&goal_id_owned)
                    .with_context(|| format!("goal {goal_id_owned} not found"))?;
                goal.pr_url = Some(url);
                goal.pr_number = number;
                goal.push_status = Some(PushStatus::Pushed);
                goal.touch(clock.as_ref());
                Ok(())
            })
            .await?;

        Ok(PrCreated {
            pr_url: pr.url,
            pr_number: pr.number,
        })
    }
}
