//! Orchestrator hooks: the callbacks that compose the engine with the LLM
//! runtime.
//!
//! `before_agent_start` injects context for sessions the engine knows
//! about (and classifies the ones it does not). `agent_end` drives the
//! completion/retry/cascade machinery. `agent_stream` extracts plan-log
//! entries from the live stream. None of these are allowed to crash the
//! runtime: gateway failures degrade into cascade states or warnings, and
//! only store I/O errors propagate.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use braid_store::{
    CascadeMode, CascadeState, GoalStatus, MergeStatus, PlanStepStatus, PushStatus, TaskStatus,
};

use crate::engine::{Engine, PLAN_LOG_CAP};
use crate::events::Event;
use crate::roles::is_pm_session_key;
use crate::scheduler::context::{
    build_goal_context, build_project_summary, build_strand_context, build_strand_menu,
};
use crate::scheduler::{KICKOFF_GRACE, UNBLOCK_GRACE};
use crate::workspace::{MergeOutcome, PushOutcome};
use crate::{classify, gateway::ChatTurn};

/// Context injected ahead of an agent's first turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrependContext {
    pub prepend_context: String,
}

/// One chunk of an agent's output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub session_key: String,
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    ToolCall,
    ToolResult,
    Text,
}

impl Engine {
    /// Build the context to prepend for a starting agent, if any.
    ///
    /// PM sessions get nothing (their prompts are fully enriched by the
    /// cascade producers; injecting again would double the context).
    pub async fn before_agent_start(
        &self,
        session_key: &str,
        messages: &[ChatTurn],
    ) -> Result<Option<PrependContext>> {
        if is_pm_session_key(session_key) {
            return Ok(None);
        }

        let data = self.store.snapshot().await;

        if let Some(strand_id) = data.session_strand_index.get(session_key) {
            let strand = data
                .strand(strand_id)
                .with_context(|| format!("strand {strand_id} not found"))?;
            return Ok(Some(PrependContext {
                prepend_context: build_strand_context(&data, strand, session_key),
            }));
        }

        if let Some(entry) = data.session_index.get(session_key) {
            let goal = data
                .goal(&entry.goal_id)
                .with_context(|| format!("goal {} not found", entry.goal_id))?;
            let task_id = goal
                .tasks
                .iter()
                .find(|t| t.session_key.as_deref() == Some(session_key))
                .map(|t| t.id.clone());
            let mut context = String::new();
            if let Some(strand) = goal.strand_id.as_ref().and_then(|sid| data.strand(sid)) {
                context.push_str(&build_project_summary(&data, strand, Some(&goal.id)));
                context.push('\n');
            }
            context.push_str(&build_goal_context(goal, task_id.as_deref()));
            return Ok(Some(PrependContext {
                prepend_context: context,
            }));
        }

        // Unknown session: delegate to the classifier.
        let text = messages
            .iter()
            .rev()
            .find(|t| t.role == "user")
            .map(|t| t.content.text())
            .unwrap_or_default();
        let verdict = self.classifier.classify(&data, &text).await;
        classify::append_audit(
            self.store.data_dir(),
            &classify::AuditEntry {
                timestamp: self.clock.now_ms(),
                session_key: session_key.to_owned(),
                strand_id: verdict.strand_id.clone(),
                confidence: verdict.confidence,
            },
        );

        if verdict.is_confident() {
            let strand_id = verdict.strand_id.expect("confident verdict has strand");
            if let Some(strand) = data.strand(&strand_id) {
                return Ok(Some(PrependContext {
                    prepend_context: build_strand_context(&data, strand, session_key),
                }));
            }
        }
        if !data.strands.is_empty() {
            return Ok(Some(PrependContext {
                prepend_context: build_strand_menu(&data),
            }));
        }
        Ok(None)
    }

    /// React to an agent session ending.
    pub async fn agent_end(self: &Arc<Self>, session_key: &str, success: bool) -> Result<()> {
        let data = self.store.snapshot().await;

        // Strand-bound sessions: non-PM ones just refresh the strand;
        // strand-PM replies are consumed by the pm_chat polling loop.
        if let Some(strand_id) = data.session_strand_index.get(session_key).cloned() {
            if !is_pm_session_key(session_key) {
                let clock = Arc::clone(&self.clock);
                self.store
                    .update(move |data| {
                        if let Some(strand) = data.strand_mut(&strand_id) {
                            strand.touch(clock.as_ref());
                        }
                        Ok(())
                    })
                    .await?;
            }
            self.clear_plan_log(session_key);
            return Ok(());
        }

        // Goal-PM cascade completion.
        if let Some(goal) = data.goal_for_pm_session(session_key) {
            if goal.cascade_state == Some(CascadeState::AwaitingPlan) {
                let goal_id = goal.id.clone();
                let strand_id = goal.strand_id.clone();
                let mode = goal.cascade_mode;
                self.finish_pm_cascade(&goal_id, strand_id, session_key, mode)
                    .await?;
            }
            self.clear_plan_log(session_key);
            return Ok(());
        }

        // Worker sessions.
        if let Some((goal, task)) = data.task_for_session(session_key) {
            if task.status == TaskStatus::InProgress {
                let goal_id = goal.id.clone();
                let task_id = task.id.clone();
                if success {
                    self.finish_worker_success(&goal_id, &task_id).await?;
                } else {
                    self.finish_worker_failure(&goal_id, &task_id, session_key)
                        .await?;
                }
            }
        }

        self.clear_plan_log(session_key);
        Ok(())
    }

    /// Goal-PM ended while the goal awaited its plan: fetch the reply and
    /// run the goal-level cascade on it.
    async fn finish_pm_cascade(
        self: &Arc<Self>,
        goal_id: &str,
        strand_id: Option<String>,
        session_key: &str,
        mode: CascadeMode,
    ) -> Result<()> {
        let reply = match self.gateway.chat_history(session_key, 50).await {
            Ok(turns) => turns
                .iter()
                .rev()
                .find(|t| t.role == "assistant")
                .map(|t| t.content.text()),
            Err(e) => {
                tracing::warn!(goal_id = %goal_id, error = %e, "PM history fetch failed");
                None
            }
        };

        match reply {
            None => {
                let clock = Arc::clone(&self.clock);
                let goal_id_owned = goal_id.to_owned();
                self.store
                    .update(move |data| {
                        let goal = data
                            .goal_mut(&goal_id_owned)
                            .with_context(|| format!("goal {goal_id_owned} not found"))?;
                        goal.cascade_state = Some(CascadeState::PlanFetchFailed);
                        goal.touch(clock.as_ref());
                        Ok(())
                    })
                    .await?;
                self.events.broadcast(Event::GoalCascadePlanReady {
                    goal_id: goal_id.to_owned(),
                    strand_id: strand_id.clone(),
                    has_plan: false,
                    cascade_state: CascadeState::PlanFetchFailed.to_string(),
                });
            }
            Some(content) => {
                let outcome = self.create_tasks_from_plan(goal_id, &content, mode).await?;
                if outcome.cascade_state == CascadeState::TasksCreated && mode == CascadeMode::Full
                {
                    let clock = Arc::clone(&self.clock);
                    let goal_id_owned = goal_id.to_owned();
                    self.store
                        .update(move |data| {
                            let goal = data
                                .goal_mut(&goal_id_owned)
                                .with_context(|| format!("goal {goal_id_owned} not found"))?;
                            goal.autonomy_mode = Some(braid_store::AutonomyMode::Full);
                            goal.touch(clock.as_ref());
                            Ok(())
                        })
                        .await?;
                    self.events.broadcast(Event::GoalCascadeTasksCreated {
                        goal_id: goal_id.to_owned(),
                        strand_id: strand_id.clone(),
                        tasks_created: outcome.tasks_created,
                    });
                    self.schedule_kickoff(goal_id.to_owned(), KICKOFF_GRACE);
                } else {
                    self.events.broadcast(Event::GoalCascadePlanReady {
                        goal_id: goal_id.to_owned(),
                        strand_id: strand_id.clone(),
                        has_plan: outcome.has_plan,
                        cascade_state: outcome.cascade_state.to_string(),
                    });
                }
            }
        }

        // Retire the goal from the strand's pending-cascade list.
        if let Some(strand_id) = strand_id {
            let clock = Arc::clone(&self.clock);
            let goal_id_owned = goal_id.to_owned();
            let strand_id_owned = strand_id.clone();
            let emptied = self
                .store
                .update(move |data| {
                    let strand = data
                        .strand_mut(&strand_id_owned)
                        .with_context(|| format!("strand {strand_id_owned} not found"))?;
                    let Some(pending) = strand.cascade_pending_goals.as_mut() else {
                        return Ok(false);
                    };
                    pending.retain(|g| *g != goal_id_owned);
                    let emptied = pending.is_empty();
                    if emptied {
                        strand.cascade_pending_goals = None;
                    }
                    strand.touch(clock.as_ref());
                    Ok(emptied)
                })
                .await?;
            if emptied {
                self.events
                    .broadcast(Event::StrandCascadeComplete { strand_id });
            }
        }

        Ok(())
    }

    /// Worker ended normally without reporting: auto-mark its task done
    /// and advance the goal.
    async fn finish_worker_success(self: &Arc<Self>, goal_id: &str, task_id: &str) -> Result<()> {
        let clock = Arc::clone(&self.clock);
        let goal_id_owned = goal_id.to_owned();
        let task_id_owned = task_id.to_owned();
        let all_done = self
            .store
            .update(move |data| {
                let goal = data
                    .goal_mut(&goal_id_owned)
                    .with_context(|| format!("goal {goal_id_owned} not found"))?;
                let task = goal
                    .task_mut(&task_id_owned)
                    .with_context(|| format!("task {task_id_owned} not found"))?;
                task.set_status(TaskStatus::Done, clock.as_ref());
                task.summary = Some("(auto-marked on session end)".into());
                goal.touch(clock.as_ref());
                Ok(goal.all_tasks_done())
            })
            .await?;

        self.events.broadcast(Event::GoalTaskCompleted {
            goal_id: goal_id.to_owned(),
            task_id: task_id.to_owned(),
            all_tasks_done: all_done,
            auto_completed: true,
        });

        if all_done {
            self.complete_goal(goal_id).await?;
        } else {
            self.schedule_kickoff(goal_id.to_owned(), KICKOFF_GRACE);
        }
        Ok(())
    }

    /// Worker ended with failure: retry while the budget allows, then
    /// fail the task for good.
    async fn finish_worker_failure(
        self: &Arc<Self>,
        goal_id: &str,
        task_id: &str,
        session_key: &str,
    ) -> Result<()> {
        let clock = Arc::clone(&self.clock);
        let goal_id_owned = goal_id.to_owned();
        let task_id_owned = task_id.to_owned();
        let session_key_owned = session_key.to_owned();

        enum FailureOutcome {
            Retry { retry_count: u32, max_retries: u32 },
            Failed { retry_count: u32 },
        }

        let outcome = self
            .store
            .update(move |data| {
                let goal = data
                    .goal_mut(&goal_id_owned)
                    .with_context(|| format!("goal {goal_id_owned} not found"))?;
                let max_retries = goal.max_retries;
                let task = goal
                    .task_mut(&task_id_owned)
                    .with_context(|| format!("task {task_id_owned} not found"))?;

                if task.retry_count < max_retries {
                    task.session_key = None;
                    task.retry_count += 1;
                    task.last_error = Some("agent session ended with failure".into());
                    task.set_status(TaskStatus::Pending, clock.as_ref());
                    let retry_count = task.retry_count;
                    goal.sessions.retain(|s| *s != session_key_owned);
                    goal.touch(clock.as_ref());
                    data.session_index.remove(&session_key_owned);
                    Ok(FailureOutcome::Retry {
                        retry_count,
                        max_retries,
                    })
                } else {
                    task.last_error = Some("agent session ended with failure".into());
                    task.set_status(TaskStatus::Failed, clock.as_ref());
                    let retry_count = task.retry_count;
                    goal.touch(clock.as_ref());
                    Ok(FailureOutcome::Failed { retry_count })
                }
            })
            .await?;

        match outcome {
            FailureOutcome::Retry {
                retry_count,
                max_retries,
            } => {
                self.events.broadcast(Event::GoalTaskRetry {
                    goal_id: goal_id.to_owned(),
                    task_id: task_id.to_owned(),
                    retry_count,
                    max_retries,
                });
                self.schedule_kickoff(goal_id.to_owned(), KICKOFF_GRACE);
            }
            FailureOutcome::Failed { retry_count } => {
                self.events.broadcast(Event::GoalTaskFailed {
                    goal_id: goal_id.to_owned(),
                    task_id: task_id.to_owned(),
                    retry_count,
                });
            }
        }
        Ok(())
    }

    /// Complete a goal once every task is settled.
    ///
    /// Refuses goals that still have open tasks, so a merge retry on a
    /// goal that grew a follow-up task cannot discard that work. Without
    /// a worktree this just marks the goal done. With one, the worktree's
    /// outstanding changes are auto-committed, the branch is pushed and
    /// merged `--no-ff` into main, and only a clean merge completes the
    /// goal. Conflicts leave the goal `active` with `mergeStatus:
    /// conflict` for the operator.
    pub async fn complete_goal(self: &Arc<Self>, goal_id: &str) -> Result<()> {
        let data = self.store.snapshot().await;
        let goal = data
            .goal(goal_id)
            .with_context(|| format!("goal {goal_id} not found"))?;
        if goal.status == GoalStatus::Done {
            return Ok(());
        }
        let open: Vec<&str> = goal
            .tasks
            .iter()
            .filter(|t| !matches!(t.status, TaskStatus::Done | TaskStatus::Failed))
            .map(|t| t.id.as_str())
            .collect();
        if !open.is_empty() {
            anyhow::bail!(
                "goal {goal_id} still has open tasks ({}); finish or close them first",
                open.join(", ")
            );
        }
        let strand = goal.strand_id.as_ref().and_then(|sid| data.strand(sid));
        let strand_id = strand.map(|s| s.id.clone());
        let phase = goal.phase;

        let git = self.workspace.clone().zip(goal.worktree.clone()).zip(
            strand
                .and_then(|s| s.workspace.as_ref())
                .map(|ws| ws.path.clone()),
        );

        let Some(((manager, worktree), ws_path)) = git else {
            let clock = Arc::clone(&self.clock);
            let goal_id_owned = goal_id.to_owned();
            self.store
                .update(move |data| {
                    let goal = data
                        .goal_mut(&goal_id_owned)
                        .with_context(|| format!("goal {goal_id_owned} not found"))?;
                    goal.set_status(GoalStatus::Done, clock.as_ref());
                    Ok(())
                })
                .await?;
            self.events.broadcast(Event::GoalCompleted {
                goal_id: goal_id.to_owned(),
                strand_id: strand_id.clone(),
                phase,
            });
            if let Some(sid) = strand_id {
                self.schedule_unblocked_kickoff(sid, UNBLOCK_GRACE);
            }
            return Ok(());
        };

        let title = goal.title.clone();
        let branch = worktree.branch.clone();
        let wt_path = std::path::PathBuf::from(&worktree.path);
        let ws = std::path::PathBuf::from(&ws_path);

        let (push, merge) = {
            let manager = manager.clone();
            let branch = branch.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = manager.commit_all(&wt_path, &format!("Goal complete: {title}")) {
                    tracing::warn!(error = %e, "auto-commit failed");
                }
                let push = manager.push_goal_branch(&ws, &branch);
                let merge = manager.merge_goal_branch(&ws, &branch);
                (push, merge)
            })
            .await
            .context("merge task panicked")?
        };

        let clock = Arc::clone(&self.clock);
        let goal_id_owned = goal_id.to_owned();
        let push_status = match &push {
            Ok(PushOutcome::Pushed) => Some(PushStatus::Pushed),
            Ok(PushOutcome::NoRemote) => None,
            Err(_) => Some(PushStatus::Failed),
        };
        let (merge_status, merge_error) = match &merge {
            Ok(MergeOutcome::Merged) => (MergeStatus::Merged, None),
            Ok(MergeOutcome::Conflict { details }) => {
                (MergeStatus::Conflict, Some(details.clone()))
            }
            Err(e) => (MergeStatus::Error, Some(e.to_string())),
        };

        self.store
            .update(move |data| {
                let goal = data
                    .goal_mut(&goal_id_owned)
                    .with_context(|| format!("goal {goal_id_owned} not found"))?;
                goal.push_status = push_status;
                goal.merge_status = Some(merge_status);
                goal.merge_error = merge_error;
                if merge_status == MergeStatus::Merged {
                    goal.merged_at_ms = Some(clock.now_ms());
                    goal.set_status(GoalStatus::Done, clock.as_ref());
                } else {
                    goal.touch(clock.as_ref());
                }
                Ok(())
            })
            .await?;

        if let Err(e) = &push {
            self.events.broadcast(Event::GoalPushFailed {
                goal_id: goal_id.to_owned(),
                branch: branch.clone(),
                error: e.to_string(),
            });
        }

        if merge_status == MergeStatus::Merged {
            let manager = manager.clone();
            let ws = std::path::PathBuf::from(&ws_path);
            let main_push = tokio::task::spawn_blocking(move || manager.push_main(&ws))
                .await
                .context("push task panicked")?;
            if let Err(e) = main_push {
                tracing::warn!(goal_id = %goal_id, error = %e, "push of main failed");
            }
        }

        self.events.broadcast(Event::GoalMerged {
            goal_id: goal_id.to_owned(),
            merge_status: merge_status.to_string(),
            branch,
        });
        if merge_status == MergeStatus::Merged {
            self.events.broadcast(Event::GoalCompleted {
                goal_id: goal_id.to_owned(),
                strand_id: strand_id.clone(),
                phase,
            });
            if let Some(sid) = strand_id {
                self.schedule_unblocked_kickoff(sid, UNBLOCK_GRACE);
            }
        }
        Ok(())
    }

    /// Extract plan-log entries from a streamed chunk.
    ///
    /// Tool calls/results always land in the ring buffer; text chunks only
    /// when they look like status markers. When the owning task has a
    /// parsed plan, the entry is matched against its steps.
    pub async fn agent_stream(&self, chunk: &StreamChunk) -> Result<()> {
        let interesting = match chunk.kind {
            ChunkKind::ToolCall | ChunkKind::ToolResult => true,
            ChunkKind::Text => looks_like_status_marker(&chunk.text),
        };
        if !interesting {
            return Ok(());
        }

        let entry = chunk.text.trim().to_owned();
        {
            let mut logs = self.plan_logs.lock().unwrap_or_else(|e| e.into_inner());
            let buffer = logs.entry(chunk.session_key.clone()).or_default();
            buffer.push_back(entry.clone());
            while buffer.len() > PLAN_LOG_CAP {
                buffer.pop_front();
            }
        }

        let data = self.store.snapshot().await;
        let Some((goal, task)) = data.task_for_session(&chunk.session_key) else {
            return Ok(());
        };
        let goal_id = goal.id.clone();
        let task_id = task.id.clone();

        if let Some((step_index, step_status)) = match_plan_step(task, &entry) {
            let clock = Arc::clone(&self.clock);
            let goal_id_owned = goal_id.clone();
            let task_id_owned = task_id.clone();
            self.store
                .update(move |data| {
                    let goal = data
                        .goal_mut(&goal_id_owned)
                        .with_context(|| format!("goal {goal_id_owned} not found"))?;
                    let task = goal
                        .task_mut(&task_id_owned)
                        .with_context(|| format!("task {task_id_owned} not found"))?;
                    if let Some(step) = task.plan.steps.get_mut(step_index) {
                        step.status = step_status;
                        task.touch(clock.as_ref());
                    }
                    Ok(())
                })
                .await?;
        }

        self.events.broadcast(Event::PlanLog {
            session_key: chunk.session_key.clone(),
            goal_id,
            task_id,
            entry,
        });
        Ok(())
    }

    /// The external file watcher saw the plan file change.
    pub fn plan_file_changed(&self, session_key: &str, file_path: &str) {
        self.events.broadcast(Event::PlanFileChanged {
            session_key: session_key.to_owned(),
            file_path: file_path.to_owned(),
        });
    }

    /// Read back a session's buffered plan log (most recent last).
    pub fn plan_log(&self, session_key: &str) -> Vec<String> {
        let logs = self.plan_logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.get(session_key)
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn clear_plan_log(&self, session_key: &str) {
        let mut logs = self.plan_logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.remove(session_key);
    }
}

/// Text chunks count as plan-log entries only when they carry a status
/// marker: `#` headings, check/cross marks, or progress phrases.
fn looks_like_status_marker(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('#')
        || trimmed.starts_with('\u{2713}')
        || trimmed.starts_with('\u{2717}')
        || trimmed.contains("Starting")
        || trimmed.contains("Completed")
        || trimmed.contains("Error:")
        || trimmed.contains("Step ")
}

/// Match a log entry to a plan step by case-insensitive containment in
/// either direction. The marker decides the new step status.
fn match_plan_step(task: &braid_store::Task, entry: &str) -> Option<(usize, PlanStepStatus)> {
    let entry_lower = entry.to_lowercase();
    let status = if entry.trim_start().starts_with('\u{2713}') {
        PlanStepStatus::Done
    } else if entry.trim_start().starts_with('\u{2717}') || entry.contains("Error:") {
        PlanStepStatus::Error
    } else {
        PlanStepStatus::Active
    };

    for (index, step) in task.plan.steps.iter().enumerate() {
        let step_lower = step.text.to_lowercase();
        if step_lower.is_empty() {
            continue;
        }
        if entry_lower.contains(&step_lower) || step_lower.contains(&entry_lower) {
            return Some((index, status));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_store::{ManualClock, PlanStep, Task};

    #[test]
    fn status_marker_detection() {
        assert!(looks_like_status_marker("# Setting up"));
        assert!(looks_like_status_marker("\u{2713} tests pass"));
        assert!(looks_like_status_marker("\u{2717} build broke"));
        assert!(looks_like_status_marker("Starting the build"));
        assert!(looks_like_status_marker("Completed step 2"));
        assert!(looks_like_status_marker("Error: no such file"));
        assert!(looks_like_status_marker("Step 3 of 5"));
        assert!(!looks_like_status_marker("just some narration"));
    }

    #[test]
    fn plan_step_matching() {
        let clock = ManualClock::new(0);
        let mut task = Task::new("task_1".into(), "t", &clock);
        task.plan.steps = vec![
            PlanStep {
                text: "write the parser".into(),
                status: PlanStepStatus::Pending,
            },
            PlanStep {
                text: "add tests".into(),
                status: PlanStepStatus::Pending,
            },
        ];

        let (idx, status) = match_plan_step(&task, "Starting: write the parser").unwrap();
        assert_eq!(idx, 0);
        assert_eq!(status, PlanStepStatus::Active);

        let (idx, status) = match_plan_step(&task, "\u{2713} add tests").unwrap();
        assert_eq!(idx, 1);
        assert_eq!(status, PlanStepStatus::Done);

        assert!(match_plan_step(&task, "unrelated noise").is_none());
    }
}
