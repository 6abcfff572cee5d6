//! The cascade processor: turns a PM assistant response into goals or
//! tasks on an entity, advancing its cascade state.
//!
//! Strand-level: "create goals from plan" materializes one goal per plan
//! entry, converting phases into goal dependencies. Goal-level: "create
//! tasks from plan" materializes tasks with sequential dependencies in
//! `full` mode, or stops at `plan_ready` in `plan` mode.

pub mod pm;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use braid_store::{CascadeMode, CascadeState, ChatMessage, Goal, Task};

use crate::engine::Engine;
use crate::plan::{ParsedPlan, parse_plan};

/// Header under which per-goal task suggestions from a project plan are
/// stored on the goal description.
const SUGGESTED_TASKS_HEADER: &str = "Suggested tasks from project plan:";

/// Outcome of a strand-level cascade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrandCascadeOutcome {
    pub has_plan: bool,
    pub goal_ids: Vec<String>,
}

/// Outcome of a goal-level cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalCascadeOutcome {
    pub cascade_state: CascadeState,
    pub has_plan: bool,
    pub tasks_created: usize,
}

impl Engine {
    /// Strand-level cascade: save the plan markdown on the strand and
    /// create one goal per parsed entry, preserving order.
    ///
    /// Goals carrying `phase` values get `dependsOn` pointing at every
    /// goal with a smaller phase (the smallest positive phase gets none);
    /// phase-less goals get no dependencies. Embedded task suggestions are
    /// stored verbatim on the goal description, not materialized.
    pub async fn create_goals_from_plan(
        &self,
        strand_id: &str,
        content: &str,
    ) -> Result<StrandCascadeOutcome> {
        let parsed = parse_plan(content);
        let clock = Arc::clone(&self.clock);
        let content_owned = content.to_owned();
        let strand_id_owned = strand_id.to_owned();

        // Mint ids up front; the store is the only id authority.
        let ids: Vec<String> = parsed.goals.iter().map(|_| self.store.new_id("goal")).collect();

        let outcome = self
            .store
            .update(move |data| {
                let strand = data
                    .strand_mut(&strand_id_owned)
                    .with_context(|| format!("strand {strand_id_owned} not found"))?;
                strand.pm_plan_content = Some(content_owned);
                strand.touch(clock.as_ref());
                let strand_cascade_mode = strand.cascade_mode;
                let strand_autonomy = strand.autonomy_mode;

                if !parsed.has_plan || parsed.goals.is_empty() {
                    return Ok(StrandCascadeOutcome {
                        has_plan: parsed.has_plan,
                        goal_ids: Vec::new(),
                    });
                }

                let mut created: Vec<Goal> = Vec::new();
                for (entry, id) in parsed.goals.iter().zip(ids) {
                    let mut goal = Goal::new(id, entry.title.clone(), clock.as_ref());
                    goal.strand_id = Some(strand_id_owned.clone());
                    goal.phase = entry.phase;
                    goal.cascade_mode = strand_cascade_mode;
                    goal.autonomy_mode = Some(strand_autonomy);
                    goal.description = entry.description.clone();
                    if !entry.suggested_tasks.is_empty() {
                        if !goal.description.is_empty() {
                            goal.description.push_str("\n\n");
                        }
                        goal.description.push_str(SUGGESTED_TASKS_HEADER);
                        for task in &entry.suggested_tasks {
                            goal.description.push_str(&format!("\n- {task}"));
                        }
                    }

                    // Phase N depends on all goals with phase < N.
                    if let Some(phase) = entry.phase {
                        goal.depends_on = created
                            .iter()
                            .filter(|g| g.phase.map(|p| p < phase).unwrap_or(false))
                            .map(|g| g.id.clone())
                            .collect();
                    }

                    created.push(goal);
                }

                let goal_ids: Vec<String> = created.iter().map(|g| g.id.clone()).collect();
                data.goals.extend(created);
                Ok(StrandCascadeOutcome {
                    has_plan: true,
                    goal_ids,
                })
            })
            .await?;

        // Provision worktrees outside the store lock.
        for goal_id in &outcome.goal_ids {
            self.provision_goal_worktree(goal_id).await;
        }

        Ok(outcome)
    }

    /// Goal-level cascade: append the assistant response to the goal's PM
    /// history and materialize tasks (or just a plan state) from it.
    pub async fn create_tasks_from_plan(
        &self,
        goal_id: &str,
        content: &str,
        mode: CascadeMode,
    ) -> Result<GoalCascadeOutcome> {
        self.create_tasks_from_plan_inner(goal_id, content, mode, true)
            .await
    }

    /// As [`Self::create_tasks_from_plan`], but with control over whether
    /// the content is appended to the goal's PM history (it is skipped
    /// when the content was read back out of that history).
    pub(crate) async fn create_tasks_from_plan_inner(
        &self,
        goal_id: &str,
        content: &str,
        mode: CascadeMode,
        append_history: bool,
    ) -> Result<GoalCascadeOutcome> {
        let parsed = parse_plan(content);
        let clock = Arc::clone(&self.clock);
        let max_history = self.config.max_history;
        let goal_id_owned = goal_id.to_owned();
        let content_owned = content.to_owned();

        let task_ids: Vec<String> = parsed.tasks.iter().map(|_| self.store.new_id("task")).collect();

        self.store
            .update(move |data| {
                let goal = data
                    .goal_mut(&goal_id_owned)
                    .with_context(|| format!("goal {goal_id_owned} not found"))?;
                if append_history {
                    goal.push_history(ChatMessage::assistant(content_owned), max_history);
                }

                let outcome = apply_parsed_plan(goal, &parsed, mode, task_ids, clock.as_ref());
                goal.cascade_state = Some(outcome.cascade_state);
                goal.touch(clock.as_ref());
                Ok(outcome)
            })
            .await
    }
}

/// Advance a goal's cascade from a parsed PM response.
///
/// State table:
/// - no plan detected               -> `response_saved`
/// - plan detected, `plan` mode     -> `plan_ready` (no tasks)
/// - plan + tasks, `full` mode      -> `tasks_created` (sequential deps)
/// - plan but no tasks, `full` mode -> `plan_parse_failed`
fn apply_parsed_plan(
    goal: &mut Goal,
    parsed: &ParsedPlan,
    mode: CascadeMode,
    task_ids: Vec<String>,
    clock: &dyn braid_store::Clock,
) -> GoalCascadeOutcome {
    if !parsed.has_plan {
        return GoalCascadeOutcome {
            cascade_state: CascadeState::ResponseSaved,
            has_plan: false,
            tasks_created: 0,
        };
    }

    match mode {
        CascadeMode::Plan => GoalCascadeOutcome {
            cascade_state: CascadeState::PlanReady,
            has_plan: true,
            tasks_created: 0,
        },
        CascadeMode::Full => {
            if parsed.tasks.is_empty() {
                return GoalCascadeOutcome {
                    cascade_state: CascadeState::PlanParseFailed,
                    has_plan: true,
                    tasks_created: 0,
                };
            }

            let mut previous: Option<String> = None;
            for (entry, id) in parsed.tasks.iter().zip(task_ids) {
                let mut task = Task::new(id, entry.text.clone(), clock);
                task.description = entry.description.clone();
                if let Some(agent) = &entry.agent {
                    task.assigned_agent = agent.clone();
                }
                task.estimated_time = entry.time.clone();
                if let Some(prev) = &previous {
                    task.depends_on = vec![prev.clone()];
                }
                previous = Some(task.id.clone());
                goal.tasks.push(task);
            }

            GoalCascadeOutcome {
                cascade_state: CascadeState::TasksCreated,
                has_plan: true,
                tasks_created: parsed.tasks.len(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_store::ManualClock;

    fn goal() -> Goal {
        let clock = ManualClock::new(0);
        Goal::new("goal_1".into(), "Backend", &clock)
    }

    #[test]
    fn no_plan_saves_response() {
        let clock = ManualClock::new(0);
        let mut g = goal();
        let parsed = parse_plan("let's discuss requirements first");
        let outcome = apply_parsed_plan(&mut g, &parsed, CascadeMode::Full, Vec::new(), &clock);
        assert_eq!(outcome.cascade_state, CascadeState::ResponseSaved);
        assert!(g.tasks.is_empty());
    }

    #[test]
    fn plan_mode_stops_at_plan_ready() {
        let clock = ManualClock::new(0);
        let mut g = goal();
        let parsed = parse_plan("## Tasks\n- do a thing\n- do another\n");
        let ids = vec!["task_1".into(), "task_2".into()];
        let outcome = apply_parsed_plan(&mut g, &parsed, CascadeMode::Plan, ids, &clock);
        assert_eq!(outcome.cascade_state, CascadeState::PlanReady);
        assert!(g.tasks.is_empty(), "plan mode creates no tasks");
    }

    #[test]
    fn full_mode_creates_sequential_dependencies() {
        let clock = ManualClock::new(0);
        let mut g = goal();
        let parsed = parse_plan("## Tasks\n- first\n- second\n- third\n");
        let ids = vec!["task_1".into(), "task_2".into(), "task_3".into()];
        let outcome = apply_parsed_plan(&mut g, &parsed, CascadeMode::Full, ids, &clock);

        assert_eq!(outcome.cascade_state, CascadeState::TasksCreated);
        assert_eq!(outcome.tasks_created, 3);
        assert!(g.tasks[0].depends_on.is_empty());
        assert_eq!(g.tasks[1].depends_on, vec!["task_1".to_owned()]);
        assert_eq!(g.tasks[2].depends_on, vec!["task_2".to_owned()]);
    }

    #[test]
    fn full_mode_with_plan_but_no_tasks_fails_parse() {
        let clock = ManualClock::new(0);
        let mut g = goal();
        let parsed = parse_plan("# Plan\nwe will figure out tasks later");
        let outcome = apply_parsed_plan(&mut g, &parsed, CascadeMode::Full, Vec::new(), &clock);
        assert_eq!(outcome.cascade_state, CascadeState::PlanParseFailed);
    }
}
