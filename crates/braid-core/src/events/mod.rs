//! Append-only outbound event stream.
//!
//! One emit point: [`EventBus::broadcast`]. Events go to an in-process
//! broadcast channel for live subscribers, and `goal.*` events are also
//! appended as newline-delimited JSON to `kickoff-events.json` so an
//! out-of-process relay can replay them. Best-effort on both paths; no
//! ordering guarantee across goals.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use braid_store::Clock;

use crate::scheduler::SpawnedSession;

pub const EVENT_LOG_FILE: &str = "kickoff-events.json";

/// One broadcast event. The `event` tag carries the dotted name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum Event {
    #[serde(rename = "goal.kickoff", rename_all = "camelCase")]
    GoalKickoff {
        goal_id: String,
        spawned_count: usize,
        spawned_sessions: Vec<SpawnedSession>,
    },
    #[serde(rename = "goal.task_completed", rename_all = "camelCase")]
    GoalTaskCompleted {
        goal_id: String,
        task_id: String,
        all_tasks_done: bool,
        auto_completed: bool,
    },
    #[serde(rename = "goal.task_retry", rename_all = "camelCase")]
    GoalTaskRetry {
        goal_id: String,
        task_id: String,
        retry_count: u32,
        max_retries: u32,
    },
    #[serde(rename = "goal.task_failed", rename_all = "camelCase")]
    GoalTaskFailed {
        goal_id: String,
        task_id: String,
        retry_count: u32,
    },
    #[serde(rename = "goal.cascade_tasks_created", rename_all = "camelCase")]
    GoalCascadeTasksCreated {
        goal_id: String,
        strand_id: Option<String>,
        tasks_created: usize,
    },
    #[serde(rename = "goal.cascade_plan_ready", rename_all = "camelCase")]
    GoalCascadePlanReady {
        goal_id: String,
        strand_id: Option<String>,
        has_plan: bool,
        cascade_state: String,
    },
    #[serde(rename = "goal.merged", rename_all = "camelCase")]
    GoalMerged {
        goal_id: String,
        merge_status: String,
        branch: String,
    },
    #[serde(rename = "goal.completed", rename_all = "camelCase")]
    GoalCompleted {
        goal_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        strand_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<u32>,
    },
    #[serde(rename = "goal.push_failed", rename_all = "camelCase")]
    GoalPushFailed {
        goal_id: String,
        branch: String,
        error: String,
    },
    #[serde(rename = "goal.closed", rename_all = "camelCase")]
    GoalClosed { goal_id: String },
    #[serde(rename = "goal.deleted", rename_all = "camelCase")]
    GoalDeleted { goal_id: String },
    #[serde(rename = "goal.plan_updated", rename_all = "camelCase")]
    GoalPlanUpdated {
        goal_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    #[serde(rename = "strand.cascade_complete", rename_all = "camelCase")]
    StrandCascadeComplete { strand_id: String },
    #[serde(rename = "plan.log", rename_all = "camelCase")]
    PlanLog {
        session_key: String,
        goal_id: String,
        task_id: String,
        entry: String,
    },
    #[serde(rename = "plan.file_changed", rename_all = "camelCase")]
    PlanFileChanged {
        session_key: String,
        file_path: String,
    },
}

impl Event {
    /// The dotted event name (the serde tag).
    pub fn name(&self) -> &'static str {
        match self {
            Self::GoalKickoff { .. } => "goal.kickoff",
            Self::GoalTaskCompleted { .. } => "goal.task_completed",
            Self::GoalTaskRetry { .. } => "goal.task_retry",
            Self::GoalTaskFailed { .. } => "goal.task_failed",
            Self::GoalCascadeTasksCreated { .. } => "goal.cascade_tasks_created",
            Self::GoalCascadePlanReady { .. } => "goal.cascade_plan_ready",
            Self::GoalMerged { .. } => "goal.merged",
            Self::GoalCompleted { .. } => "goal.completed",
            Self::GoalPushFailed { .. } => "goal.push_failed",
            Self::GoalClosed { .. } => "goal.closed",
            Self::GoalDeleted { .. } => "goal.deleted",
            Self::GoalPlanUpdated { .. } => "goal.plan_updated",
            Self::StrandCascadeComplete { .. } => "strand.cascade_complete",
            Self::PlanLog { .. } => "plan.log",
            Self::PlanFileChanged { .. } => "plan.file_changed",
        }
    }

    fn is_goal_event(&self) -> bool {
        self.name().starts_with("goal.")
    }
}

/// A broadcast event plus its emission timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: Event,
}

/// The in-process event bus plus the disk-backed `goal.*` log.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
    log_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl EventBus {
    pub fn new(log_dir: Option<&Path>, clock: Arc<dyn Clock>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            log_path: log_dir.map(|d| d.join(EVENT_LOG_FILE)),
            clock,
        }
    }

    /// Emit an event to live subscribers and, for `goal.*` events, append
    /// it to the disk log. Both paths are best-effort.
    pub fn broadcast(&self, event: Event) -> Envelope {
        let envelope = Envelope {
            timestamp: self.clock.now_ms(),
            event,
        };

        if envelope.event.is_goal_event() {
            if let Some(path) = &self.log_path {
                if let Err(e) = append_log_line(path, &envelope) {
                    tracing::warn!(
                        event = envelope.event.name(),
                        error = %e,
                        "failed to append event to disk log"
                    );
                }
            }
        }

        // No live subscribers is not an error.
        let _ = self.tx.send(envelope.clone());
        envelope
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Subscribe as a `futures::Stream`. Lagged receivers skip ahead;
    /// subscribers must tolerate gaps and duplicates on replay.
    pub fn stream(&self) -> impl Stream<Item = Envelope> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| item.ok())
    }
}

fn append_log_line(path: &Path, envelope: &Envelope) -> std::io::Result<()> {
    use std::io::Write;
    let mut line = serde_json::to_vec(envelope).expect("event serializes");
    line.push(b'\n');
    // Open-append-close per write so concurrent readers see whole lines.
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(&line)
}

/// Replay the disk log. Truncated or garbled trailing lines are skipped.
pub fn read_event_log(path: &Path) -> std::io::Result<Vec<Envelope>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(contents
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
