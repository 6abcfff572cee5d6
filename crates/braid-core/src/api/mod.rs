//! The request surface: the operation catalogue outside callers invoke.
//!
//! Each operation is a thin adapter: validate params, call into the
//! engine, respond. Requests are a typed sum keyed by the `op` tag, so
//! the surface is testable without any transport. The response shape is
//! uniform: `ok`, optional `payload`, optional `error`.
//!
//! Validation and not-found failures report `ok: false` with no state
//! change. Store I/O failures are the only fatal class and also surface
//! as `ok: false` here; the transport layer decides how to escalate them.

pub mod gitflow;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use braid_store::{AutonomyMode, CascadeMode, GoalStatus, TaskStatus};

use crate::engine::{Engine, GoalPatch, NewGoal, NewStrand, NewTask, StrandPatch, TaskPatch};

/// Uniform operation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(payload: Value) -> Self {
        Self {
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: None,
            error: Some(error.into()),
        }
    }
}

/// The operation catalogue.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", content = "params")]
pub enum Request {
    // Strand CRUD.
    #[serde(rename = "strands.create")]
    StrandsCreate(StrandsCreateParams),
    #[serde(rename = "strands.list")]
    StrandsList,
    #[serde(rename = "strands.get")]
    StrandsGet(StrandIdParams),
    #[serde(rename = "strands.update")]
    StrandsUpdate(StrandsUpdateParams),
    #[serde(rename = "strands.delete")]
    StrandsDelete(StrandIdParams),

    // Goal CRUD and session attachment.
    #[serde(rename = "goals.create")]
    GoalsCreate(GoalsCreateParams),
    #[serde(rename = "goals.list")]
    GoalsList(GoalsListParams),
    #[serde(rename = "goals.get")]
    GoalsGet(GoalIdParams),
    #[serde(rename = "goals.update")]
    GoalsUpdate(GoalsUpdateParams),
    #[serde(rename = "goals.delete")]
    GoalsDelete(GoalIdParams),
    #[serde(rename = "goals.attachSession")]
    GoalsAttachSession(AttachSessionParams),

    // Task CRUD.
    #[serde(rename = "tasks.create")]
    TasksCreate(TasksCreateParams),
    #[serde(rename = "tasks.update")]
    TasksUpdate(TasksUpdateParams),
    #[serde(rename = "tasks.delete")]
    TasksDelete(TaskIdParams),

    // Scheduling and git flow.
    #[serde(rename = "goals.kickoff")]
    GoalsKickoff(GoalIdParams),
    #[serde(rename = "goals.close")]
    GoalsClose(GoalIdParams),
    #[serde(rename = "goals.branchStatus")]
    GoalsBranchStatus(GoalIdParams),
    #[serde(rename = "goals.createPR")]
    GoalsCreatePr(GoalIdParams),
    #[serde(rename = "goals.retryPush")]
    GoalsRetryPush(GoalIdParams),
    #[serde(rename = "goals.retryMerge")]
    GoalsRetryMerge(GoalIdParams),
    #[serde(rename = "goals.pushMain")]
    GoalsPushMain(GoalIdParams),

    // PM cascade.
    #[serde(rename = "pm.chat")]
    PmChat(PmChatParams),
    #[serde(rename = "pm.strandChat")]
    PmStrandChat(PmStrandChatParams),
    #[serde(rename = "pm.goalCascade")]
    PmGoalCascade(PmGoalCascadeParams),
    #[serde(rename = "pm.strandCascade")]
    PmStrandCascade(PmStrandCascadeParams),
    #[serde(rename = "pm.saveResponse")]
    PmSaveResponse(PmSaveResponseParams),
    #[serde(rename = "pm.createTasksFromPlan")]
    PmCreateTasksFromPlan(PmCreateTasksParams),
    #[serde(rename = "pm.strandCreateGoals")]
    PmStrandCreateGoals(PmStrandCreateGoalsParams),

    // Session lifecycle.
    #[serde(rename = "sessions.killForGoal")]
    SessionsKillForGoal(GoalIdParams),
    #[serde(rename = "sessions.killForStrand")]
    SessionsKillForStrand(StrandIdParams),
    #[serde(rename = "sessions.cleanupStale")]
    SessionsCleanupStale(CleanupStaleParams),
    #[serde(rename = "sessions.listForStrand")]
    SessionsListForStrand(StrandIdParams),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrandsCreateParams {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub topic_ids: Vec<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub cascade_mode: Option<CascadeMode>,
    #[serde(default)]
    pub autonomy_mode: Option<AutonomyMode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrandIdParams {
    pub strand_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrandsUpdateParams {
    pub strand_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
    #[serde(default)]
    pub cascade_mode: Option<CascadeMode>,
    #[serde(default)]
    pub autonomy_mode: Option<AutonomyMode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalsCreateParams {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub strand_id: Option<String>,
    #[serde(default)]
    pub phase: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub cascade_mode: Option<CascadeMode>,
    #[serde(default)]
    pub autonomy_mode: Option<AutonomyMode>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalsListParams {
    #[serde(default)]
    pub strand_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalIdParams {
    pub goal_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalsUpdateParams {
    pub goal_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<GoalStatus>,
    #[serde(default)]
    pub autonomy_mode: Option<AutonomyMode>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachSessionParams {
    pub goal_id: String,
    pub session_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksCreateParams {
    pub goal_id: String,
    pub text: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub estimated_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksUpdateParams {
    pub goal_id: String,
    pub task_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdParams {
    pub goal_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmChatParams {
    pub strand_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmStrandChatParams {
    pub strand_id: String,
    pub message: String,
    #[serde(default = "default_true")]
    pub send: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmGoalCascadeParams {
    pub goal_id: String,
    #[serde(default)]
    pub mode: Option<CascadeMode>,
    #[serde(default = "default_true")]
    pub send: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmStrandCascadeParams {
    pub strand_id: String,
    #[serde(default = "default_true")]
    pub send: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmSaveResponseParams {
    pub goal_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmCreateTasksParams {
    pub goal_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub mode: Option<CascadeMode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmStrandCreateGoalsParams {
    pub strand_id: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupStaleParams {
    #[serde(default)]
    pub strand_id: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Dispatch one request against the engine.
pub async fn dispatch(engine: &Arc<Engine>, request: Request) -> Response {
    match handle(engine, request).await {
        Ok(payload) => Response::success(payload),
        Err(e) => Response::failure(format!("{e:#}")),
    }
}

async fn handle(engine: &Arc<Engine>, request: Request) -> anyhow::Result<Value> {
    match request {
        Request::StrandsCreate(p) => {
            let strand = engine
                .create_strand(NewStrand {
                    name: p.name,
                    description: p.description,
                    color: p.color,
                    keywords: p.keywords,
                    topic_ids: p.topic_ids,
                    repo_url: p.repo_url,
                    cascade_mode: p.cascade_mode,
                    autonomy_mode: p.autonomy_mode,
                })
                .await?;
            Ok(serde_json::to_value(strand)?)
        }
        Request::StrandsList => {
            let data = engine.store().snapshot().await;
            Ok(serde_json::to_value(&data.strands)?)
        }
        Request::StrandsGet(p) => {
            let data = engine.store().snapshot().await;
            let strand = data
                .strand(&p.strand_id)
                .ok_or_else(|| anyhow::anyhow!("strand {} not found", p.strand_id))?;
            let goals = data.goals_for_strand(&p.strand_id);
            Ok(json!({
                "strand": strand,
                "goals": goals,
            }))
        }
        Request::StrandsUpdate(p) => {
            let strand = engine
                .update_strand(
                    &p.strand_id,
                    StrandPatch {
                        name: p.name,
                        description: p.description,
                        color: p.color,
                        keywords: p.keywords,
                        cascade_mode: p.cascade_mode,
                        autonomy_mode: p.autonomy_mode,
                    },
                )
                .await?;
            Ok(serde_json::to_value(strand)?)
        }
        Request::StrandsDelete(p) => {
            let killed = engine.delete_strand(&p.strand_id).await?;
            Ok(json!({"killedSessions": killed}))
        }

        Request::GoalsCreate(p) => {
            let goal = engine
                .create_goal(NewGoal {
                    title: p.title,
                    description: p.description,
                    strand_id: p.strand_id,
                    phase: p.phase,
                    depends_on: p.depends_on,
                    cascade_mode: p.cascade_mode,
                    autonomy_mode: p.autonomy_mode,
                    max_retries: p.max_retries,
                })
                .await?;
            Ok(serde_json::to_value(goal)?)
        }
        Request::GoalsList(p) => {
            let data = engine.store().snapshot().await;
            match p.strand_id {
                Some(strand_id) => {
                    if data.strand(&strand_id).is_none() {
                        anyhow::bail!("strand {strand_id} not found");
                    }
                    Ok(serde_json::to_value(data.goals_for_strand(&strand_id))?)
                }
                None => Ok(serde_json::to_value(&data.goals)?),
            }
        }
        Request::GoalsGet(p) => {
            let data = engine.store().snapshot().await;
            let goal = data
                .goal(&p.goal_id)
                .ok_or_else(|| anyhow::anyhow!("goal {} not found", p.goal_id))?;
            Ok(serde_json::to_value(goal)?)
        }
        Request::GoalsUpdate(p) => {
            let goal = engine
                .update_goal(
                    &p.goal_id,
                    GoalPatch {
                        title: p.title,
                        description: p.description,
                        status: p.status,
                        autonomy_mode: p.autonomy_mode,
                        max_retries: p.max_retries,
                    },
                )
                .await?;
            Ok(serde_json::to_value(goal)?)
        }
        Request::GoalsDelete(p) => {
            let killed = engine.delete_goal(&p.goal_id).await?;
            Ok(json!({"killedSessions": killed}))
        }
        Request::GoalsAttachSession(p) => {
            engine.attach_session(&p.goal_id, &p.session_key).await?;
            Ok(json!({"goalId": p.goal_id, "sessionKey": p.session_key}))
        }

        Request::TasksCreate(p) => {
            let task = engine
                .add_task(
                    &p.goal_id,
                    NewTask {
                        text: p.text,
                        description: p.description,
                        agent: p.agent,
                        model: p.model,
                        priority: p.priority,
                        depends_on: p.depends_on,
                        estimated_time: p.estimated_time,
                    },
                )
                .await?;
            Ok(serde_json::to_value(task)?)
        }
        Request::TasksUpdate(p) => {
            let task = engine
                .update_task(
                    &p.goal_id,
                    &p.task_id,
                    TaskPatch {
                        text: p.text,
                        description: p.description,
                        status: p.status,
                        summary: p.summary,
                        agent: p.agent,
                        priority: p.priority,
                    },
                )
                .await?;
            Ok(serde_json::to_value(task)?)
        }
        Request::TasksDelete(p) => {
            engine.delete_task(&p.goal_id, &p.task_id).await?;
            Ok(json!({"goalId": p.goal_id, "taskId": p.task_id}))
        }

        Request::GoalsKickoff(p) => {
            let kickoff = engine.kickoff_goal(&p.goal_id).await?;
            Ok(serde_json::to_value(kickoff)?)
        }
        Request::GoalsClose(p) => {
            let killed = engine.close_goal(&p.goal_id).await?;
            Ok(json!({"goalId": p.goal_id, "killedSessions": killed}))
        }
        Request::GoalsBranchStatus(p) => {
            let status = engine.goal_branch_status(&p.goal_id).await?;
            Ok(json!({
                "ahead": status.ahead,
                "behind": status.behind,
                "conflictFiles": status.conflict_files,
            }))
        }
        Request::GoalsCreatePr(p) => {
            let pr = engine.goal_create_pr(&p.goal_id).await?;
            Ok(serde_json::to_value(pr)?)
        }
        Request::GoalsRetryPush(p) => {
            let outcome = engine.goal_retry_push(&p.goal_id).await?;
            Ok(json!({"pushed": outcome == crate::workspace::PushOutcome::Pushed}))
        }
        Request::GoalsRetryMerge(p) => {
            engine.goal_retry_merge(&p.goal_id).await?;
            let data = engine.store().snapshot().await;
            let goal = data
                .goal(&p.goal_id)
                .ok_or_else(|| anyhow::anyhow!("goal {} not found", p.goal_id))?;
            Ok(json!({
                "mergeStatus": goal.merge_status,
                "mergeError": goal.merge_error,
            }))
        }
        Request::GoalsPushMain(p) => {
            let outcome = engine.goal_push_main(&p.goal_id).await?;
            Ok(json!({"pushed": outcome == crate::workspace::PushOutcome::Pushed}))
        }

        Request::PmChat(p) => {
            let outcome = engine.pm_chat(&p.strand_id, &p.message).await?;
            Ok(serde_json::to_value(outcome)?)
        }
        Request::PmStrandChat(p) => {
            let prepared = engine.pm_strand_chat(&p.strand_id, &p.message, p.send).await?;
            Ok(serde_json::to_value(prepared)?)
        }
        Request::PmGoalCascade(p) => {
            let cascade = engine.pm_goal_cascade(&p.goal_id, p.mode, p.send).await?;
            Ok(serde_json::to_value(cascade)?)
        }
        Request::PmStrandCascade(p) => {
            let cascades = engine.pm_strand_cascade(&p.strand_id, p.send).await?;
            Ok(serde_json::to_value(cascades)?)
        }
        Request::PmSaveResponse(p) => {
            let outcome = engine.pm_save_response(&p.goal_id, &p.content).await?;
            Ok(serde_json::to_value(outcome)?)
        }
        Request::PmCreateTasksFromPlan(p) => {
            let outcome = engine.pm_create_tasks(&p.goal_id, p.content, p.mode).await?;
            Ok(serde_json::to_value(outcome)?)
        }
        Request::PmStrandCreateGoals(p) => {
            let outcome = engine.pm_strand_create_goals(&p.strand_id, p.content).await?;
            Ok(serde_json::to_value(outcome)?)
        }

        Request::SessionsKillForGoal(p) => {
            let killed = engine.kill_for_goal(&p.goal_id).await?;
            Ok(json!({"killedSessions": killed}))
        }
        Request::SessionsKillForStrand(p) => {
            let killed = engine.kill_for_strand(&p.strand_id).await?;
            Ok(json!({"killedSessions": killed}))
        }
        Request::SessionsCleanupStale(p) => {
            let aborted = engine.cleanup_stale(p.strand_id.as_deref()).await?;
            Ok(json!({"abortedSessions": aborted}))
        }
        Request::SessionsListForStrand(p) => {
            let sessions = engine.list_for_strand(&p.strand_id).await?;
            Ok(serde_json::to_value(sessions)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_deserialize_from_tagged_json() {
        let request: Request = serde_json::from_value(json!({
            "op": "strands.create",
            "params": {"name": "App", "keywords": ["web"]}
        }))
        .unwrap();
        assert!(matches!(request, Request::StrandsCreate(ref p) if p.name == "App"));

        let request: Request = serde_json::from_value(json!({"op": "strands.list"})).unwrap();
        assert!(matches!(request, Request::StrandsList));

        let request: Request = serde_json::from_value(json!({
            "op": "goals.kickoff",
            "params": {"goalId": "goal_3"}
        }))
        .unwrap();
        assert!(matches!(request, Request::GoalsKickoff(ref p) if p.goal_id == "goal_3"));
    }

    #[test]
    fn missing_params_fail_deserialization() {
        let result: Result<Request, _> =
            serde_json::from_value(json!({"op": "goals.kickoff", "params": {}}));
        assert!(result.is_err());

        let result: Result<Request, _> = serde_json::from_value(json!({"op": "nope.nope"}));
        assert!(result.is_err());
    }

    #[test]
    fn response_shape() {
        let ok = Response::success(json!({"x": 1}));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["ok"], true);
        assert!(value.get("error").is_none());

        let err = Response::failure("strand strand_9 not found");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["ok"], false);
        assert!(value.get("payload").is_none());
    }
}
