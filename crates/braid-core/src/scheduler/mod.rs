//! The kickoff engine: computes which tasks are unblocked, assigns them
//! sessions, and cascades kickoffs across goal dependencies.
//!
//! `internal_kickoff` does all store mutation in a single update; the
//! gateway sends happen after the lock is released. Two concurrent
//! kickoffs of the same goal serialize through the store lock: the second
//! observes the session keys the first wrote and spawns nothing.

pub mod context;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};

use braid_store::{GoalStatus, SessionRef, TaskStatus};

use crate::engine::Engine;
use crate::events::Event;
use crate::roles::{resolve_agent, worker_session_key};

/// Grace period between a completion and the follow-up kickoff, so the
/// completion's store commit settles before the next one starts.
pub const KICKOFF_GRACE: Duration = Duration::from_millis(1_500);
/// Grace period before cascading to dependent goals after a merge.
pub const UNBLOCK_GRACE: Duration = Duration::from_secs(2);

/// One session the kickoff assigned to a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnedSession {
    pub task_id: String,
    pub session_key: String,
    pub agent_id: String,
    /// Resolved model override: the task's own, else the configured
    /// default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub task_context: String,
    /// Whether the gateway accepted the start request.
    pub headless_started: bool,
}

/// Result of a kickoff pass over one goal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kickoff {
    pub spawned_sessions: Vec<SpawnedSession>,
    pub errors: Vec<String>,
    pub message: String,
}

impl Engine {
    /// Compute and assign sessions for every unblocked task of a goal.
    ///
    /// Store-only: the caller is responsible for actually starting the
    /// agents (see [`Engine::kickoff_goal`]).
    pub async fn internal_kickoff(&self, goal_id: &str) -> Result<Kickoff> {
        let clock = Arc::clone(&self.clock);
        let config = self.config.clone();
        let goal_id_owned = goal_id.to_owned();

        self.store
            .update(move |data| {
                let goal = data
                    .goal(&goal_id_owned)
                    .with_context(|| format!("goal {goal_id_owned} not found"))?
                    .clone();

                // Goal-level dependency gate.
                if !goal.depends_on.is_empty() {
                    let blocked = goal.depends_on.iter().any(|dep| {
                        data.goal(dep).map(|g| g.status != GoalStatus::Done).unwrap_or(true)
                    });
                    if blocked {
                        return Ok(Kickoff {
                            spawned_sessions: Vec::new(),
                            errors: Vec::new(),
                            message: "blocked by dependencies".into(),
                        });
                    }
                }

                let strand = goal.strand_id.as_ref().and_then(|sid| data.strand(sid)).cloned();

                let done: HashSet<&str> = goal
                    .tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Done)
                    .map(|t| t.id.as_str())
                    .collect();

                // Spawnable: unassigned, not done, all prerequisites done.
                let spawnable: Vec<String> = goal
                    .tasks
                    .iter()
                    .filter(|t| {
                        t.session_key.is_none()
                            && t.status != TaskStatus::Done
                            && t.depends_on.iter().all(|d| done.contains(d.as_str()))
                    })
                    .map(|t| t.id.clone())
                    .collect();

                if spawnable.is_empty() {
                    return Ok(Kickoff {
                        spawned_sessions: Vec::new(),
                        errors: Vec::new(),
                        message: "no spawnable tasks".into(),
                    });
                }

                let working_dir = goal
                    .worktree
                    .as_ref()
                    .map(|wt| wt.path.clone())
                    .or_else(|| strand.as_ref().and_then(|s| s.workspace.as_ref()).map(|ws| ws.path.clone()));

                let mut spawned = Vec::new();
                for task_id in spawnable {
                    let task = goal.task(&task_id).expect("spawnable task exists").clone();

                    let agent_id = resolve_agent(data, &config, &task.assigned_agent);
                    let session_key = worker_session_key(&agent_id, &task.id);
                    let autonomy = task
                        .autonomy_mode
                        .or(goal.autonomy_mode)
                        .or(strand.as_ref().map(|s| s.autonomy_mode))
                        .unwrap_or(config.default_autonomy);
                    let plan_file = working_dir
                        .as_ref()
                        .map(|dir| format!("{dir}/.braid/plan-{}.md", task.id));

                    let task_context = context::build_task_context(
                        data,
                        strand.as_ref(),
                        &goal,
                        &task,
                        autonomy,
                        working_dir.as_deref(),
                        plan_file.as_deref(),
                    );

                    let goal_mut = data.goal_mut(&goal_id_owned).expect("goal exists");
                    let task_mut = goal_mut.task_mut(&task.id).expect("task exists");
                    task_mut.set_status(TaskStatus::InProgress, clock.as_ref());
                    task_mut.session_key = Some(session_key.clone());
                    task_mut.autonomy_mode = Some(autonomy);
                    task_mut.plan.expected_file_path = plan_file;
                    goal_mut.sessions.push(session_key.clone());
                    data.session_index.insert(
                        session_key.clone(),
                        SessionRef {
                            goal_id: goal_id_owned.clone(),
                        },
                    );

                    spawned.push(SpawnedSession {
                        model: task.model.clone().or_else(|| config.default_model.clone()),
                        task_id: task.id,
                        session_key,
                        agent_id,
                        task_context,
                        headless_started: false,
                    });
                }

                let goal_mut = data.goal_mut(&goal_id_owned).expect("goal exists");
                if !spawned.is_empty() && goal_mut.status != GoalStatus::Done {
                    goal_mut.set_status(GoalStatus::Active, clock.as_ref());
                }

                Ok(Kickoff {
                    message: format!("spawned {} session(s)", spawned.len()),
                    spawned_sessions: spawned,
                    errors: Vec::new(),
                })
            })
            .await
    }

    /// Kick off a goal and start the assigned agents.
    ///
    /// Gateway sends run after the store commit; a send failure leaves
    /// `headlessStarted: false` on that entry and is recorded in `errors`.
    /// Emits `goal.kickoff` when anything was spawned.
    pub async fn kickoff_goal(&self, goal_id: &str) -> Result<Kickoff> {
        let mut kickoff = self.internal_kickoff(goal_id).await?;
        if kickoff.spawned_sessions.is_empty() {
            return Ok(kickoff);
        }

        for session in &mut kickoff.spawned_sessions {
            match self
                .gateway
                .chat_send(&session.session_key, &session.task_context)
                .await
            {
                Ok(()) => session.headless_started = true,
                Err(e) => {
                    tracing::warn!(
                        session_key = %session.session_key,
                        task_id = %session.task_id,
                        error = %e,
                        "failed to start agent"
                    );
                    kickoff
                        .errors
                        .push(format!("{}: {e}", session.task_id));
                }
            }
        }

        self.events.broadcast(Event::GoalKickoff {
            goal_id: goal_id.to_owned(),
            spawned_count: kickoff.spawned_sessions.len(),
            spawned_sessions: kickoff.spawned_sessions.clone(),
        });

        Ok(kickoff)
    }

    /// Kick off every goal in a strand that is waiting on dependencies and
    /// has not started yet: not done, has tasks, no sessions, and a
    /// non-empty `dependsOn`. Advances a strand from one phase to the
    /// next once the blocking goals are done.
    pub async fn kickoff_unblocked_goals(&self, strand_id: &str) -> Result<Vec<(String, Kickoff)>> {
        let data = self.store.snapshot().await;
        if data.strand(strand_id).is_none() {
            bail!("strand {strand_id} not found");
        }

        let candidates: Vec<String> = data
            .goals_for_strand(strand_id)
            .into_iter()
            .filter(|g| {
                g.status != GoalStatus::Done
                    && !g.tasks.is_empty()
                    && g.sessions.is_empty()
                    && !g.depends_on.is_empty()
            })
            .map(|g| g.id.clone())
            .collect();

        let mut results = Vec::new();
        for goal_id in candidates {
            let kickoff = self.kickoff_goal(&goal_id).await?;
            results.push((goal_id, kickoff));
        }
        Ok(results)
    }

    /// Run a kickoff after a short grace period. Cancelled by engine
    /// shutdown.
    pub(crate) fn schedule_kickoff(self: &Arc<Self>, goal_id: String, delay: Duration) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = engine.kickoff_goal(&goal_id).await {
                        tracing::warn!(goal_id = %goal_id, error = %e, "delayed kickoff failed");
                    }
                }
                _ = engine.shutdown.cancelled() => {}
            }
        });
    }

    /// Run `kickoff_unblocked_goals` after a grace period. Cancelled by
    /// engine shutdown.
    pub(crate) fn schedule_unblocked_kickoff(self: &Arc<Self>, strand_id: String, delay: Duration) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = engine.kickoff_unblocked_goals(&strand_id).await {
                        tracing::warn!(strand_id = %strand_id, error = %e, "delayed unblock failed");
                    }
                }
                _ = engine.shutdown.cancelled() => {}
            }
        });
    }
}
