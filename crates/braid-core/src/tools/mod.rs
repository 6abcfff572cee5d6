//! Tools exposed to agent sessions.
//!
//! Which tools a session sees depends on runtime state, so the registry is
//! a factory evaluated per agent start, not a static table: worker
//! sessions get `goal_update`, strand-bound non-PM sessions get the
//! `strand_*` family, unbound sessions get `strand_bind`, PM sessions get
//! nothing (PMs plan; they never mutate state directly).

mod strand;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use braid_store::{Data, GoalStatus, PlanStep, PlanStepStatus, TaskStatus};

use crate::engine::Engine;
use crate::events::Event;
use crate::roles::is_pm_session_key;
use crate::scheduler::KICKOFF_GRACE;

pub use strand::handle_strand_tool;

/// A tool made available to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Result of a tool invocation: confirmation text plus machine-readable
/// metadata for the runtime's post-tool cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    pub text: String,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Parameters of the `goal_update` tool. All optional; the session's own
/// bindings fill the gaps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalUpdateParams {
    pub goal_id: Option<String>,
    pub task_id: Option<String>,
    pub status: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub add_tasks: Vec<NewTaskParams>,
    pub next_task: Option<NewTaskParams>,
    pub goal_status: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    pub plan_file: Option<String>,
    pub plan_status: Option<String>,
    pub step_index: Option<usize>,
    pub step_status: Option<String>,
}

/// A task specification accepted by `addTasks`/`nextTask`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTaskParams {
    pub text: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
}

/// Build the tool list for a session.
pub fn tools_for_session(data: &Data, session_key: &str) -> Vec<ToolSpec> {
    if is_pm_session_key(session_key) {
        return Vec::new();
    }
    if data.session_index.contains_key(session_key) {
        return vec![goal_update_spec()];
    }
    if data.session_strand_index.contains_key(session_key) {
        return strand::strand_tool_specs();
    }
    vec![strand::strand_bind_spec()]
}

fn goal_update_spec() -> ToolSpec {
    ToolSpec {
        name: "goal_update".into(),
        description: "Report progress on your assigned task: update status, record a summary, \
                      add follow-up tasks, or advance the plan log."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "goalId": {"type": "string"},
                "taskId": {"type": "string"},
                "status": {"type": "string", "enum": ["pending", "in-progress", "blocked", "waiting", "done", "failed"]},
                "summary": {"type": "string"},
                "addTasks": {"type": "array", "items": {"type": "object", "properties": {
                    "text": {"type": "string"},
                    "description": {"type": "string"},
                    "agent": {"type": "string"}
                }, "required": ["text"]}},
                "nextTask": {"type": "object", "properties": {
                    "text": {"type": "string"},
                    "description": {"type": "string"},
                    "agent": {"type": "string"}
                }, "required": ["text"]},
                "goalStatus": {"type": "string", "enum": ["active", "done", "failed"]},
                "notes": {"type": "string"},
                "files": {"type": "array", "items": {"type": "string"}},
                "planFile": {"type": "string"},
                "planStatus": {"type": "string"},
                "stepIndex": {"type": "integer"},
                "stepStatus": {"type": "string", "enum": ["pending", "active", "done", "error"]}
            }
        }),
    }
}

impl Engine {
    /// Handle a `goal_update` call from a worker session.
    ///
    /// Returns the confirmation text plus `_meta {goalId,
    /// taskCompletedId?, allTasksDone?}`, and drives the post-tool
    /// cascade: a completed task emits `goal.task_completed` and either
    /// schedules the next kickoff or auto-merges the goal.
    pub async fn handle_goal_update(
        self: &Arc<Self>,
        session_key: &str,
        params: GoalUpdateParams,
    ) -> Result<ToolOutcome> {
        let status = params
            .status
            .as_deref()
            .map(|s| s.parse::<TaskStatus>())
            .transpose()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let goal_status = params
            .goal_status
            .as_deref()
            .map(|s| s.parse::<GoalStatus>())
            .transpose()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let step_status = params
            .step_status
            .as_deref()
            .map(|s| s.parse::<PlanStepStatus>())
            .transpose()
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let clock = Arc::clone(&self.clock);
        let session_key_owned = session_key.to_owned();
        let new_task_ids: Vec<String> = params
            .add_tasks
            .iter()
            .chain(params.next_task.iter())
            .map(|_| self.store.new_id("task"))
            .collect();

        struct Applied {
            goal_id: String,
            task_id: Option<String>,
            task_completed: bool,
            all_tasks_done: bool,
            goal_marked_done: bool,
            plan_updated: bool,
            lines: Vec<String>,
        }

        let applied = self
            .store
            .update(move |data| {
                let goal_id = match &params.goal_id {
                    Some(id) => id.clone(),
                    None => data
                        .session_index
                        .get(&session_key_owned)
                        .map(|r| r.goal_id.clone())
                        .context("session is not bound to a goal; pass goalId")?,
                };
                let goal = data
                    .goal_mut(&goal_id)
                    .with_context(|| format!("goal {goal_id} not found"))?;

                let task_id = match &params.task_id {
                    Some(id) => {
                        if goal.task(id).is_none() {
                            bail!("task {id} not found in goal {goal_id}");
                        }
                        Some(id.clone())
                    }
                    None => goal
                        .tasks
                        .iter()
                        .find(|t| t.session_key.as_deref() == Some(session_key_owned.as_str()))
                        .map(|t| t.id.clone()),
                };

                let mut lines = Vec::new();
                let mut task_completed = false;
                let mut plan_updated = false;

                if let Some(task_id) = &task_id {
                    let task = goal.task_mut(task_id).expect("validated above");

                    if let Some(status) = status {
                        let was_done = task.status == TaskStatus::Done;
                        task.set_status(status, clock.as_ref());
                        task_completed = status == TaskStatus::Done && !was_done;
                        lines.push(format!("status set to {status}"));
                    }
                    if let Some(summary) = &params.summary {
                        task.summary = Some(summary.clone());
                        lines.push("summary recorded".into());
                    }
                    if let Some(notes) = &params.notes {
                        let summary = task.summary.get_or_insert_with(String::new);
                        if !summary.is_empty() {
                            summary.push('\n');
                        }
                        summary.push_str(notes);
                        lines.push("notes recorded".into());
                    }
                    if !params.files.is_empty() {
                        let summary = task.summary.get_or_insert_with(String::new);
                        if !summary.is_empty() {
                            summary.push('\n');
                        }
                        summary.push_str(&format!("Files: {}", params.files.join(", ")));
                        lines.push(format!("{} file(s) recorded", params.files.len()));
                    }
                    if let Some(plan_file) = &params.plan_file {
                        task.plan.expected_file_path = Some(plan_file.clone());
                        task.touch(clock.as_ref());
                        plan_updated = true;
                        lines.push("plan file recorded".into());
                    }
                    if let Some(plan_status) = &params.plan_status {
                        task.plan.status = Some(plan_status.clone());
                        task.touch(clock.as_ref());
                        plan_updated = true;
                    }
                    if let (Some(index), Some(step_status)) = (params.step_index, step_status) {
                        if task.plan.steps.len() <= index {
                            task.plan.steps.resize_with(index + 1, || PlanStep {
                                text: String::new(),
                                status: PlanStepStatus::Pending,
                            });
                        }
                        task.plan.steps[index].status = step_status;
                        task.touch(clock.as_ref());
                        plan_updated = true;
                        lines.push(format!("step {index} set to {step_status}"));
                    }
                } else if status.is_some() || params.summary.is_some() {
                    bail!("no task bound to this session; pass taskId");
                }

                // Follow-up tasks. `nextTask` depends on the current task.
                let mut id_iter = new_task_ids.into_iter();
                for spec in &params.add_tasks {
                    let id = id_iter.next().expect("id per task");
                    let mut task = braid_store::Task::new(id, spec.text.clone(), clock.as_ref());
                    task.description = spec.description.clone().unwrap_or_default();
                    if let Some(agent) = &spec.agent {
                        task.assigned_agent = agent.clone();
                    }
                    goal.tasks.push(task);
                    lines.push(format!("added task: {}", spec.text));
                }
                if let Some(spec) = &params.next_task {
                    let id = id_iter.next().expect("id per task");
                    let mut task = braid_store::Task::new(id, spec.text.clone(), clock.as_ref());
                    task.description = spec.description.clone().unwrap_or_default();
                    if let Some(agent) = &spec.agent {
                        task.assigned_agent = agent.clone();
                    }
                    if let Some(current) = &task_id {
                        task.depends_on = vec![current.clone()];
                    }
                    goal.tasks.push(task);
                    lines.push(format!("queued next task: {}", spec.text));
                }

                let mut goal_marked_done = false;
                if let Some(goal_status) = goal_status {
                    if goal_status == GoalStatus::Done {
                        let open = goal
                            .tasks
                            .iter()
                            .any(|t| !matches!(t.status, TaskStatus::Done | TaskStatus::Failed));
                        if open {
                            bail!("cannot complete goal {goal_id}: tasks are still open");
                        }
                        // The auto-merge path owns the done transition.
                        goal_marked_done = true;
                        lines.push("goal completion requested".into());
                    } else {
                        goal.set_status(goal_status, clock.as_ref());
                        lines.push(format!("goal status set to {goal_status}"));
                    }
                }

                // Reopening work reopens a finished goal.
                let reopened = matches!(
                    status,
                    Some(s) if !matches!(s, TaskStatus::Done | TaskStatus::Failed)
                ) || !params.add_tasks.is_empty()
                    || params.next_task.is_some();
                if reopened && goal.status == GoalStatus::Done {
                    goal.set_status(GoalStatus::Active, clock.as_ref());
                }

                goal.touch(clock.as_ref());
                let all_tasks_done = goal.all_tasks_done();
                Ok(Applied {
                    goal_id,
                    task_id,
                    task_completed,
                    all_tasks_done,
                    goal_marked_done,
                    plan_updated,
                    lines,
                })
            })
            .await?;

        if applied.plan_updated {
            self.events.broadcast(Event::GoalPlanUpdated {
                goal_id: applied.goal_id.clone(),
                task_id: applied.task_id.clone(),
            });
        }

        if applied.task_completed {
            self.events.broadcast(Event::GoalTaskCompleted {
                goal_id: applied.goal_id.clone(),
                task_id: applied.task_id.clone().expect("completed task exists"),
                all_tasks_done: applied.all_tasks_done,
                auto_completed: false,
            });
        }

        if (applied.task_completed && applied.all_tasks_done) || applied.goal_marked_done {
            self.complete_goal(&applied.goal_id).await?;
        } else if applied.task_completed {
            self.schedule_kickoff(applied.goal_id.clone(), KICKOFF_GRACE);
        }

        let text = if applied.lines.is_empty() {
            format!("No changes applied to goal {}.", applied.goal_id)
        } else {
            format!(
                "Updated goal {}: {}.",
                applied.goal_id,
                applied.lines.join(", ")
            )
        };

        let meta = json!({
            "goalId": applied.goal_id,
            "taskCompletedId": if applied.task_completed { applied.task_id.clone() } else { None },
            "allTasksDone": applied.all_tasks_done,
        });

        Ok(ToolOutcome {
            text,
            meta: Some(meta),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_store::{ManualClock, SessionRef, Strand};

    #[test]
    fn pm_sessions_get_no_tools() {
        let data = Data::default();
        let tools = tools_for_session(&data, "agent:main:webchat:pm-goal_1");
        assert!(tools.is_empty());
    }

    #[test]
    fn worker_sessions_get_goal_update() {
        let mut data = Data::default();
        data.session_index.insert(
            "agent:main:webchat:task-1".into(),
            SessionRef {
                goal_id: "goal_1".into(),
            },
        );
        let tools = tools_for_session(&data, "agent:main:webchat:task-1");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "goal_update");
    }

    #[test]
    fn strand_bound_sessions_get_strand_family() {
        let clock = ManualClock::new(0);
        let mut data = Data::default();
        data.strands.push(Strand::new("strand_1".into(), "s", &clock));
        data.session_strand_index
            .insert("agent:main:webchat:ops".into(), "strand_1".into());
        let tools = tools_for_session(&data, "agent:main:webchat:ops");
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"strand_create_goal"));
        assert!(names.contains(&"strand_pm_kickoff"));
        assert!(!names.contains(&"goal_update"));
    }

    #[test]
    fn unbound_sessions_get_strand_bind_only() {
        let data = Data::default();
        let tools = tools_for_session(&data, "agent:main:webchat");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "strand_bind");
    }

    #[test]
    fn goal_update_params_deserialize_camel_case() {
        let params: GoalUpdateParams = serde_json::from_value(json!({
            "goalId": "goal_1",
            "status": "done",
            "addTasks": [{"text": "follow up"}],
            "stepIndex": 2,
            "stepStatus": "done"
        }))
        .unwrap();
        assert_eq!(params.goal_id.as_deref(), Some("goal_1"));
        assert_eq!(params.add_tasks.len(), 1);
        assert_eq!(params.step_index, Some(2));
    }
}
