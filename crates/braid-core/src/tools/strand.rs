//! The `strand_*` tool family for strand-bound (non-PM) sessions.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::engine::{Engine, NewGoal, NewTask};

use super::{ToolOutcome, ToolSpec};

pub(super) fn strand_bind_spec() -> ToolSpec {
    ToolSpec {
        name: "strand_bind".into(),
        description: "Bind this session to a project strand.".into(),
        parameters: json!({
            "type": "object",
            "properties": {"strandId": {"type": "string"}},
            "required": ["strandId"]
        }),
    }
}

pub(super) fn strand_tool_specs() -> Vec<ToolSpec> {
    let obj = |props: Value, required: Value| {
        json!({"type": "object", "properties": props, "required": required})
    };
    vec![
        strand_bind_spec(),
        ToolSpec {
            name: "strand_create_goal".into(),
            description: "Create a goal in the bound strand.".into(),
            parameters: obj(
                json!({"title": {"type": "string"}, "description": {"type": "string"}}),
                json!(["title"]),
            ),
        },
        ToolSpec {
            name: "strand_add_task".into(),
            description: "Add a task to a goal in the bound strand.".into(),
            parameters: obj(
                json!({"goalId": {"type": "string"}, "text": {"type": "string"},
                       "description": {"type": "string"}, "agent": {"type": "string"}}),
                json!(["goalId", "text"]),
            ),
        },
        ToolSpec {
            name: "strand_spawn_task".into(),
            description: "Kick off a goal, spawning sessions for its unblocked tasks.".into(),
            parameters: obj(json!({"goalId": {"type": "string"}}), json!(["goalId"])),
        },
        ToolSpec {
            name: "strand_list".into(),
            description: "List all known strands.".into(),
            parameters: obj(json!({}), json!([])),
        },
        ToolSpec {
            name: "strand_status".into(),
            description: "Show the bound strand's goals and task progress.".into(),
            parameters: obj(json!({}), json!([])),
        },
        ToolSpec {
            name: "strand_pm_chat".into(),
            description: "Send a message to the strand's PM and wait for the reply.".into(),
            parameters: obj(json!({"message": {"type": "string"}}), json!(["message"])),
        },
        ToolSpec {
            name: "strand_pm_kickoff".into(),
            description: "Start the PM cascade for every goal in the bound strand that has no \
                          tasks yet."
                .into(),
            parameters: obj(json!({}), json!([])),
        },
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindParams {
    strand_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateGoalParams {
    title: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddTaskParams {
    goal_id: String,
    text: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    agent: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnTaskParams {
    goal_id: String,
}

#[derive(Debug, Deserialize)]
struct PmChatParams {
    message: String,
}

/// Dispatch one `strand_*` tool call for a session.
pub async fn handle_strand_tool(
    engine: &Arc<Engine>,
    name: &str,
    session_key: &str,
    params: Value,
) -> Result<ToolOutcome> {
    match name {
        "strand_bind" => {
            let params: BindParams = parse(params)?;
            let session_key = session_key.to_owned();
            let strand_id = params.strand_id.clone();
            engine
                .store()
                .update(move |data| {
                    if data.strand(&strand_id).is_none() {
                        bail!("strand {strand_id} not found");
                    }
                    if data.session_index.contains_key(&session_key) {
                        bail!("session {session_key} is already bound to a goal");
                    }
                    data.session_strand_index.insert(session_key, strand_id);
                    Ok(())
                })
                .await?;
            Ok(ToolOutcome {
                text: format!("Bound this session to strand {}.", params.strand_id),
                meta: Some(json!({"strandId": params.strand_id})),
            })
        }
        "strand_list" => {
            let data = engine.store().snapshot().await;
            let mut lines = Vec::new();
            for strand in &data.strands {
                lines.push(format!("- {} ({})", strand.name, strand.id));
            }
            Ok(ToolOutcome {
                text: if lines.is_empty() {
                    "No strands exist yet.".into()
                } else {
                    format!("Known strands:\n{}", lines.join("\n"))
                },
                meta: None,
            })
        }
        other => {
            // Everything else needs the session to be strand-bound.
            let data = engine.store().snapshot().await;
            let strand_id = data
                .session_strand_index
                .get(session_key)
                .cloned()
                .context("this session is not bound to a strand; call strand_bind first")?;

            match other {
                "strand_create_goal" => {
                    let params: CreateGoalParams = parse(params)?;
                    let goal = engine
                        .create_goal(NewGoal {
                            title: params.title,
                            description: params.description,
                            strand_id: Some(strand_id),
                            ..NewGoal::default()
                        })
                        .await?;
                    Ok(ToolOutcome {
                        text: format!("Created goal {} ({}).", goal.title, goal.id),
                        meta: Some(json!({"goalId": goal.id})),
                    })
                }
                "strand_add_task" => {
                    let params: AddTaskParams = parse(params)?;
                    ensure_goal_in_strand(&data, &params.goal_id, &strand_id)?;
                    let task = engine
                        .add_task(
                            &params.goal_id,
                            NewTask {
                                text: params.text,
                                description: params.description,
                                agent: params.agent,
                                ..NewTask::default()
                            },
                        )
                        .await?;
                    Ok(ToolOutcome {
                        text: format!("Added task {} to goal {}.", task.id, params.goal_id),
                        meta: Some(json!({"goalId": params.goal_id, "taskId": task.id})),
                    })
                }
                "strand_spawn_task" => {
                    let params: SpawnTaskParams = parse(params)?;
                    ensure_goal_in_strand(&data, &params.goal_id, &strand_id)?;
                    let kickoff = engine.kickoff_goal(&params.goal_id).await?;
                    Ok(ToolOutcome {
                        text: format!(
                            "Kickoff of {}: {} ({} session(s) spawned).",
                            params.goal_id,
                            kickoff.message,
                            kickoff.spawned_sessions.len()
                        ),
                        meta: Some(json!({
                            "goalId": params.goal_id,
                            "spawnedCount": kickoff.spawned_sessions.len(),
                        })),
                    })
                }
                "strand_status" => {
                    let strand = data
                        .strand(&strand_id)
                        .with_context(|| format!("strand {strand_id} not found"))?;
                    let mut out = format!("Strand {} ({})\n", strand.name, strand.id);
                    for goal in data.goals_for_strand(&strand_id) {
                        let done = goal
                            .tasks
                            .iter()
                            .filter(|t| t.status == braid_store::TaskStatus::Done)
                            .count();
                        out.push_str(&format!(
                            "- [{}] {} ({}): {}/{} tasks done\n",
                            goal.status,
                            goal.title,
                            goal.id,
                            done,
                            goal.tasks.len()
                        ));
                    }
                    Ok(ToolOutcome {
                        text: out,
                        meta: None,
                    })
                }
                "strand_pm_chat" => {
                    let params: PmChatParams = parse(params)?;
                    let outcome = engine.pm_chat(&strand_id, &params.message).await?;
                    Ok(ToolOutcome {
                        text: outcome
                            .reply
                            .unwrap_or_else(|| outcome.message.clone()),
                        meta: Some(json!({"sessionKey": outcome.session_key})),
                    })
                }
                "strand_pm_kickoff" => {
                    let cascades = engine.pm_strand_cascade(&strand_id, true).await?;
                    Ok(ToolOutcome {
                        text: format!(
                            "Started the PM cascade for {} goal(s).",
                            cascades.len()
                        ),
                        meta: Some(json!({
                            "strandId": strand_id,
                            "goals": cascades.iter().filter_map(|c| c.goal_id.clone()).collect::<Vec<_>>(),
                        })),
                    })
                }
                unknown => bail!("unknown tool: {unknown}"),
            }
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).context("invalid tool parameters")
}

fn ensure_goal_in_strand(
    data: &braid_store::Data,
    goal_id: &str,
    strand_id: &str,
) -> Result<()> {
    let goal = data
        .goal(goal_id)
        .with_context(|| format!("goal {goal_id} not found"))?;
    if goal.strand_id.as_deref() != Some(strand_id) {
        bail!("goal {goal_id} is not in strand {strand_id}");
    }
    Ok(())
}
