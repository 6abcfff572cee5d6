//! Session lifecycle: creating is the scheduler's job; this module kills,
//! garbage-collects, and reports sessions.
//!
//! The store is always updated first and is the source of truth; the
//! gateway teardown (`sessions.delete` then `chat.abort`) is issued
//! afterwards and tolerated to fail silently. A stale agent whose
//! teardown never arrived eventually emits `agent_end` with
//! `success=false`, which the retry logic ignores because the session key
//! is no longer owned.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use braid_store::TaskStatus;

use crate::engine::Engine;

/// What a session is attached to, for reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_key: String,
    /// `strand-pm`, `goal-pm`, or `worker`.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strand_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Engine {
    /// Kill every session attached to a goal: workers, attached sessions,
    /// and the goal PM. Non-done tasks are reset to `pending` with their
    /// session key cleared, so a later kickoff re-spawns them.
    ///
    /// Returns the killed session keys.
    pub async fn kill_for_goal(&self, goal_id: &str) -> Result<Vec<String>> {
        let clock = Arc::clone(&self.clock);
        let goal_id_owned = goal_id.to_owned();
        let keys = self
            .store
            .update(move |data| {
                let goal = data
                    .goal_mut(&goal_id_owned)
                    .with_context(|| format!("goal {goal_id_owned} not found"))?;

                let mut keys: BTreeSet<String> = goal.sessions.drain(..).collect();
                if let Some(pm) = goal.pm_session_key.take() {
                    keys.insert(pm);
                }
                for task in &mut goal.tasks {
                    if let Some(key) = task.session_key.take() {
                        keys.insert(key);
                    }
                    if !matches!(task.status, TaskStatus::Done | TaskStatus::Failed) {
                        task.set_status(TaskStatus::Pending, clock.as_ref());
                    }
                }
                goal.touch(clock.as_ref());
                for key in &keys {
                    data.session_index.remove(key);
                    data.session_strand_index.remove(key);
                }
                Ok(keys.into_iter().collect::<Vec<_>>())
            })
            .await?;

        self.teardown_sessions(&keys).await;
        Ok(keys)
    }

    /// Kill every session in a strand: all goal sessions plus the strand
    /// PM and any other strand-bound sessions.
    pub async fn kill_for_strand(&self, strand_id: &str) -> Result<Vec<String>> {
        let data = self.store.snapshot().await;
        if data.strand(strand_id).is_none() {
            anyhow::bail!("strand {strand_id} not found");
        }
        let goal_ids: Vec<String> = data
            .goals_for_strand(strand_id)
            .into_iter()
            .map(|g| g.id.clone())
            .collect();

        let mut keys: Vec<String> = Vec::new();
        for goal_id in goal_ids {
            keys.extend(self.kill_for_goal(&goal_id).await?);
        }

        let clock = Arc::clone(&self.clock);
        let strand_id_owned = strand_id.to_owned();
        let strand_keys = self
            .store
            .update(move |data| {
                let mut keys: BTreeSet<String> = data
                    .session_strand_index
                    .iter()
                    .filter(|(_, sid)| **sid == strand_id_owned)
                    .map(|(key, _)| key.clone())
                    .collect();
                let strand = data
                    .strand_mut(&strand_id_owned)
                    .with_context(|| format!("strand {strand_id_owned} not found"))?;
                if let Some(pm) = strand.pm_strand_session_key.take() {
                    keys.insert(pm);
                }
                strand.touch(clock.as_ref());
                for key in &keys {
                    data.session_strand_index.remove(key);
                }
                Ok(keys.into_iter().collect::<Vec<_>>())
            })
            .await?;

        self.teardown_sessions(&strand_keys).await;
        keys.extend(strand_keys);
        Ok(keys)
    }

    /// Abort sessions attached to tasks that are neither `in-progress`
    /// nor `done`. Optionally limited to one strand.
    pub async fn cleanup_stale(&self, strand_id: Option<&str>) -> Result<Vec<String>> {
        let clock = Arc::clone(&self.clock);
        let strand_filter = strand_id.map(str::to_owned);
        let keys = self
            .store
            .update(move |data| {
                if let Some(sid) = &strand_filter {
                    if data.strand(sid).is_none() {
                        anyhow::bail!("strand {sid} not found");
                    }
                }
                let mut stale = Vec::new();
                for goal in &mut data.goals {
                    if let Some(sid) = &strand_filter {
                        if goal.strand_id.as_deref() != Some(sid.as_str()) {
                            continue;
                        }
                    }
                    for task in &mut goal.tasks {
                        let is_live = matches!(task.status, TaskStatus::InProgress | TaskStatus::Done);
                        if !is_live {
                            if let Some(key) = task.session_key.take() {
                                goal.sessions.retain(|s| *s != key);
                                stale.push(key);
                                task.touch(clock.as_ref());
                            }
                        }
                    }
                }
                for key in &stale {
                    data.session_index.remove(key);
                }
                Ok(stale)
            })
            .await?;

        for key in &keys {
            if let Err(e) = self.gateway.chat_abort(key).await {
                tracing::warn!(session_key = %key, error = %e, "stale-session abort failed");
            }
        }
        Ok(keys)
    }

    /// Report every session in a strand with its attribution.
    pub async fn list_for_strand(&self, strand_id: &str) -> Result<Vec<SessionInfo>> {
        let data = self.store.snapshot().await;
        let strand = data
            .strand(strand_id)
            .with_context(|| format!("strand {strand_id} not found"))?;

        let mut out = Vec::new();
        if let Some(pm) = &strand.pm_strand_session_key {
            out.push(SessionInfo {
                session_key: pm.clone(),
                kind: "strand-pm".into(),
                strand_id: Some(strand.id.clone()),
                goal_id: None,
                task_id: None,
            });
        }
        for (key, sid) in &data.session_strand_index {
            if sid == strand_id && strand.pm_strand_session_key.as_deref() != Some(key.as_str()) {
                out.push(SessionInfo {
                    session_key: key.clone(),
                    kind: "strand-bound".into(),
                    strand_id: Some(strand_id.to_owned()),
                    goal_id: None,
                    task_id: None,
                });
            }
        }
        for goal in data.goals_for_strand(strand_id) {
            if let Some(pm) = &goal.pm_session_key {
                out.push(SessionInfo {
                    session_key: pm.clone(),
                    kind: "goal-pm".into(),
                    strand_id: Some(strand_id.to_owned()),
                    goal_id: Some(goal.id.clone()),
                    task_id: None,
                });
            }
            for task in &goal.tasks {
                if let Some(key) = &task.session_key {
                    out.push(SessionInfo {
                        session_key: key.clone(),
                        kind: "worker".into(),
                        strand_id: Some(strand_id.to_owned()),
                        goal_id: Some(goal.id.clone()),
                        task_id: Some(task.id.clone()),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Best-effort gateway teardown: `sessions.delete` then `chat.abort`.
    pub(crate) async fn teardown_sessions(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.gateway.session_delete(key).await {
                tracing::warn!(session_key = %key, error = %e, "session delete failed");
            }
            if let Err(e) = self.gateway.chat_abort(key).await {
                tracing::warn!(session_key = %key, error = %e, "chat abort failed");
            }
        }
    }
}
