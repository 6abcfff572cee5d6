//! Context assembly for spawned sessions.
//!
//! Builds the prompt blocks injected into worker and strand-bound
//! sessions: the project summary (sibling goals, with the current goal
//! marked), the goal context (sibling tasks, with the spawning task
//! marked), and the strand menu shown to unclassified sessions.

use braid_store::{AutonomyMode, Data, Goal, Strand, Task};
use braid_store::models::short_id;

/// Marker appended to the goal the session is working inside.
const THIS_GOAL: &str = " \u{2190} this goal";
/// Marker appended to the task the session owns.
const YOU: &str = " \u{2190} you";

/// Project summary: the strand's goals with `← this goal` on the current
/// one.
pub fn build_project_summary(data: &Data, strand: &Strand, current_goal: Option<&str>) -> String {
    let mut out = format!("# Project: {}\n", strand.name);
    if !strand.description.is_empty() {
        out.push_str(&strand.description);
        out.push('\n');
    }
    let goals = data.goals_for_strand(&strand.id);
    if !goals.is_empty() {
        out.push_str("\nGoals:\n");
        for goal in goals {
            let marker = if Some(goal.id.as_str()) == current_goal {
                THIS_GOAL
            } else {
                ""
            };
            out.push_str(&format!(
                "- [{}] {} ({}){}\n",
                goal.status, goal.title, goal.id, marker
            ));
        }
    }
    out
}

/// Goal context: the goal's tasks with `← you` on the spawning task.
pub fn build_goal_context(goal: &Goal, current_task: Option<&str>) -> String {
    let mut out = format!("# Goal: {} ({})\n", goal.title, goal.id);
    if !goal.description.is_empty() {
        out.push_str(&goal.description);
        out.push('\n');
    }
    if !goal.tasks.is_empty() {
        out.push_str("\nTasks:\n");
        for task in &goal.tasks {
            let marker = if Some(task.id.as_str()) == current_task {
                YOU
            } else {
                ""
            };
            let deps = if task.depends_on.is_empty() {
                String::new()
            } else {
                format!(" (after {})", task.depends_on.join(", "))
            };
            out.push_str(&format!(
                "- [{}] {} ({}){}{}\n",
                task.status, task.text, task.id, deps, marker
            ));
        }
    }
    out
}

/// Full context for a spawned worker session.
#[allow(clippy::too_many_arguments)]
pub fn build_task_context(
    data: &Data,
    strand: Option<&Strand>,
    goal: &Goal,
    task: &Task,
    autonomy: AutonomyMode,
    working_dir: Option<&str>,
    plan_file: Option<&str>,
) -> String {
    let mut out = String::new();

    if let Some(strand) = strand {
        out.push_str(&build_project_summary(data, strand, Some(&goal.id)));
        out.push('\n');
        if !strand.keywords.is_empty() {
            out.push_str(&format!("Project keywords: {}\n\n", strand.keywords.join(", ")));
        }
    }

    out.push_str(&build_goal_context(goal, Some(&task.id)));
    out.push('\n');

    if let Some(plan) = strand.and_then(|s| s.pm_plan_content.as_deref()) {
        out.push_str("## Project plan\n");
        out.push_str(plan);
        out.push_str("\n\n");
    }

    out.push_str("## Your assignment\n");
    out.push_str(&format!("Task {}: {}\n", task.id, task.text));
    if !task.description.is_empty() {
        out.push_str(&task.description);
        out.push('\n');
    }
    if let Some(time) = &task.estimated_time {
        out.push_str(&format!("Estimated time: {time}\n"));
    }
    out.push('\n');

    if let Some(dir) = working_dir {
        out.push_str(&format!("Work in this directory:\n\ncd {dir}\n\n"));
    }

    match autonomy {
        AutonomyMode::Plan => {
            out.push_str("Propose a plan and wait for approval before making changes.\n");
        }
        AutonomyMode::Full => {
            out.push_str(
                "You have full autonomy: execute the task end to end without waiting for approval.\n",
            );
        }
    }

    if let Some(path) = plan_file {
        out.push_str(&format!(
            "Keep a step-by-step plan of your work in {path} and update it as you go.\n"
        ));
    }

    out.push_str(&format!(
        "Report progress with the goal_update tool: set status=\"in-progress\" when you start, \
         status=\"done\" with a short summary when task {} is complete, and record any files \
         you changed.\n",
        short_id(&task.id)
    ));

    out
}

/// Strand context for a strand-bound (non-PM) session: every goal as a
/// nested block, with the session's task marked.
pub fn build_strand_context(data: &Data, strand: &Strand, session_key: &str) -> String {
    let mut out = format!("# Project: {}\n", strand.name);
    if !strand.description.is_empty() {
        out.push_str(&strand.description);
        out.push('\n');
    }
    if let Some(ws) = &strand.workspace {
        out.push_str(&format!("Workspace: {}\n", ws.path));
    }
    for goal in data.goals_for_strand(&strand.id) {
        out.push_str(&format!("\n<goal id=\"{}\" status=\"{}\">\n", goal.id, goal.status));
        out.push_str(&format!("{}\n", goal.title));
        for task in &goal.tasks {
            let marker = if task.session_key.as_deref() == Some(session_key) {
                YOU
            } else {
                ""
            };
            out.push_str(&format!("- [{}] {} ({}){}\n", task.status, task.text, task.id, marker));
        }
        out.push_str("</goal>\n");
    }
    out
}

/// Menu of known strands, shown when classification is inconclusive.
pub fn build_strand_menu(data: &Data) -> String {
    let mut out = String::from(
        "This session is not bound to a project yet. Known projects (bind with strand_bind):\n",
    );
    for strand in &data.strands {
        let keywords = if strand.keywords.is_empty() {
            String::new()
        } else {
            format!(" (keywords: {})", strand.keywords.join(", "))
        };
        out.push_str(&format!("- {} ({}){}\n", strand.name, strand.id, keywords));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_store::{ManualClock, TaskStatus};

    fn sample_data() -> Data {
        let clock = ManualClock::new(0);
        let mut data = Data::default();
        let mut strand = Strand::new("strand_1".into(), "App", &clock);
        strand.description = "A web app.".into();
        strand.keywords = vec!["web".into(), "api".into()];
        data.strands.push(strand);

        let mut g1 = Goal::new("goal_1".into(), "Backend", &clock);
        g1.strand_id = Some("strand_1".into());
        let mut t1 = Task::new("task_1".into(), "Set up routes", &clock);
        t1.set_status(TaskStatus::Done, &clock);
        let mut t2 = Task::new("task_2".into(), "Add auth", &clock);
        t2.depends_on = vec!["task_1".into()];
        g1.tasks.push(t1);
        g1.tasks.push(t2);
        data.goals.push(g1);

        let mut g2 = Goal::new("goal_2".into(), "Frontend", &clock);
        g2.strand_id = Some("strand_1".into());
        data.goals.push(g2);

        data
    }

    #[test]
    fn project_summary_marks_current_goal() {
        let data = sample_data();
        let strand = data.strand("strand_1").unwrap();
        let summary = build_project_summary(&data, strand, Some("goal_1"));
        assert!(summary.contains("Backend (goal_1) \u{2190} this goal"));
        assert!(summary.contains("Frontend (goal_2)\n"));
        assert!(!summary.contains("Frontend (goal_2) \u{2190}"));
    }

    #[test]
    fn goal_context_marks_current_task_and_deps() {
        let data = sample_data();
        let goal = data.goal("goal_1").unwrap();
        let ctx = build_goal_context(goal, Some("task_2"));
        assert!(ctx.contains("Add auth (task_2) (after task_1) \u{2190} you"));
        assert!(ctx.contains("[done] Set up routes"));
    }

    #[test]
    fn task_context_includes_cd_and_autonomy() {
        let data = sample_data();
        let strand = data.strand("strand_1").unwrap();
        let goal = data.goal("goal_1").unwrap();
        let task = goal.task("task_2").unwrap();

        let ctx = build_task_context(
            &data,
            Some(strand),
            goal,
            task,
            AutonomyMode::Full,
            Some("/ws/app/goals/goal_1"),
            Some("/ws/app/goals/goal_1/.braid/plan-task_2.md"),
        );
        assert!(ctx.contains("cd /ws/app/goals/goal_1"));
        assert!(ctx.contains("full autonomy"));
        assert!(ctx.contains("goal_update"));
        assert!(ctx.contains("## Your assignment"));
        assert!(ctx.contains("plan-task_2.md"));
    }

    #[test]
    fn plan_autonomy_directive() {
        let data = sample_data();
        let goal = data.goal("goal_1").unwrap();
        let task = goal.task("task_2").unwrap();
        let ctx = build_task_context(&data, None, goal, task, AutonomyMode::Plan, None, None);
        assert!(ctx.contains("wait for approval"));
        assert!(!ctx.contains("cd "));
    }

    #[test]
    fn strand_context_nests_goals() {
        let data = sample_data();
        let strand = data.strand("strand_1").unwrap();
        let ctx = build_strand_context(&data, strand, "agent:main:webchat:task-2");
        assert!(ctx.contains("<goal id=\"goal_1\" status=\"active\">"));
        assert!(ctx.contains("</goal>"));
    }

    #[test]
    fn strand_menu_lists_keywords() {
        let data = sample_data();
        let menu = build_strand_menu(&data);
        assert!(menu.contains("App (strand_1) (keywords: web, api)"));
    }
}
