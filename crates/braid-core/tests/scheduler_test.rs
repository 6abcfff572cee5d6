//! Kickoff engine tests: sequential task cascades, phase fan-out, and
//! kickoff idempotence.

use std::time::Duration;

use braid_core::engine::{NewGoal, NewStrand, NewTask};
use braid_core::events::Event;
use braid_core::tools::GoalUpdateParams;
use braid_store::{CascadeMode, GoalStatus, TaskStatus};
use braid_test_utils::{TestRig, wait_for};

/// Scenario: one goal whose cascade yields T1 -> T2 -> T3. Kickoff spawns
/// exactly T1; completing T1 via `goal_update` unblocks exactly T2.
#[tokio::test(start_paused = true)]
async fn sequential_task_cascade() {
    let rig = TestRig::new();
    let engine = &rig.engine;

    let strand = engine
        .create_strand(NewStrand {
            name: "App".into(),
            ..NewStrand::default()
        })
        .await
        .unwrap();
    let goal = engine
        .create_goal(NewGoal {
            title: "Backend".into(),
            strand_id: Some(strand.id.clone()),
            ..NewGoal::default()
        })
        .await
        .unwrap();

    let outcome = engine
        .create_tasks_from_plan(
            &goal.id,
            "## Tasks\n- first step\n- second step\n- third step\n",
            CascadeMode::Full,
        )
        .await
        .unwrap();
    assert_eq!(outcome.tasks_created, 3);

    let mut events = engine.events().subscribe();

    // Kickoff spawns exactly the first task.
    let kickoff = engine.kickoff_goal(&goal.id).await.unwrap();
    assert_eq!(kickoff.spawned_sessions.len(), 1);
    let t1_session = kickoff.spawned_sessions[0].session_key.clone();
    assert!(kickoff.spawned_sessions[0].headless_started);
    assert!(
        kickoff.spawned_sessions[0]
            .task_context
            .contains("## Your assignment")
    );

    let data = engine.store().snapshot().await;
    let goal_state = data.goal(&goal.id).unwrap();
    assert_eq!(goal_state.tasks[0].status, TaskStatus::InProgress);
    assert_eq!(goal_state.tasks[1].status, TaskStatus::Pending);
    assert_eq!(goal_state.tasks[1].session_key, None);
    assert_eq!(goal_state.status, GoalStatus::Active);
    let t1_id = goal_state.tasks[0].id.clone();
    let t2_id = goal_state.tasks[1].id.clone();
    let t3_id = goal_state.tasks[2].id.clone();

    // The kickoff event carries the spawned session.
    let envelope = events.recv().await.unwrap();
    match envelope.event {
        Event::GoalKickoff {
            spawned_count,
            spawned_sessions,
            ..
        } => {
            assert_eq!(spawned_count, 1);
            assert_eq!(spawned_sessions[0].task_id, t1_id);
        }
        other => panic!("expected goal.kickoff, got {other:?}"),
    }

    // T1 reports done through the goal_update tool.
    engine
        .handle_goal_update(
            &t1_session,
            GoalUpdateParams {
                status: Some("done".into()),
                summary: Some("did the first step".into()),
                ..GoalUpdateParams::default()
            },
        )
        .await
        .unwrap();

    let envelope = events.recv().await.unwrap();
    match envelope.event {
        Event::GoalTaskCompleted {
            task_id,
            all_tasks_done,
            auto_completed,
            ..
        } => {
            assert_eq!(task_id, t1_id);
            assert!(!all_tasks_done);
            assert!(!auto_completed);
        }
        other => panic!("expected goal.task_completed, got {other:?}"),
    }

    // The delayed kickoff spawns T2 (and only T2).
    let goal_id = goal.id.clone();
    let t2_id_check = t2_id.clone();
    assert!(
        wait_for(engine, Duration::from_secs(10), move |data| {
            data.goal(&goal_id)
                .and_then(|g| g.task(&t2_id_check))
                .map(|t| t.session_key.is_some() && t.status == TaskStatus::InProgress)
                .unwrap_or(false)
        })
        .await,
        "T2 was never spawned"
    );

    let data = engine.store().snapshot().await;
    let goal_state = data.goal(&goal.id).unwrap();
    assert_eq!(goal_state.task(&t3_id).unwrap().status, TaskStatus::Pending);
    assert_eq!(goal_state.task(&t3_id).unwrap().session_key, None);

    // The second kickoff event references T2.
    loop {
        let envelope = events.recv().await.unwrap();
        if let Event::GoalKickoff {
            spawned_sessions, ..
        } = envelope.event
        {
            assert_eq!(spawned_sessions.len(), 1);
            assert_eq!(spawned_sessions[0].task_id, t2_id);
            break;
        }
    }

    engine.shutdown();
}

/// Scenario: G1 in phase 1; G2/G3/G4 in phase 2 depending on it. Kickoff
/// of a phase-2 goal is blocked until G1 completes, then all three spawn.
#[tokio::test(start_paused = true)]
async fn phase_fan_out() {
    let rig = TestRig::new();
    let engine = &rig.engine;

    let strand = engine
        .create_strand(NewStrand {
            name: "Fanout".into(),
            ..NewStrand::default()
        })
        .await
        .unwrap();

    let plan = "\
## Goals
1. Foundation - shared plumbing (phase 1)
2. API - endpoints (phase 2)
3. UI - screens (phase 2)
4. Docs - guides (phase 2)
";
    let outcome = engine
        .create_goals_from_plan(&strand.id, plan)
        .await
        .unwrap();
    assert_eq!(outcome.goal_ids.len(), 4);
    let g1 = outcome.goal_ids[0].clone();

    let data = engine.store().snapshot().await;
    for later in &outcome.goal_ids[1..] {
        assert_eq!(
            data.goal(later).unwrap().depends_on,
            vec![g1.clone()],
            "phase-2 goals depend on the phase-1 goal"
        );
    }
    assert!(data.goal(&g1).unwrap().depends_on.is_empty());
    assert_eq!(
        data.strand(&strand.id).unwrap().pm_plan_content.as_deref(),
        Some(plan)
    );

    // Give every goal one task.
    for goal_id in &outcome.goal_ids {
        engine
            .add_task(
                goal_id,
                NewTask {
                    text: format!("work on {goal_id}"),
                    ..NewTask::default()
                },
            )
            .await
            .unwrap();
    }

    // Phase-2 kickoff is blocked while G1 is not done.
    let blocked = engine.kickoff_goal(&outcome.goal_ids[1]).await.unwrap();
    assert!(blocked.spawned_sessions.is_empty());
    assert_eq!(blocked.message, "blocked by dependencies");

    // Run G1 to completion.
    let kickoff = engine.kickoff_goal(&g1).await.unwrap();
    assert_eq!(kickoff.spawned_sessions.len(), 1);
    engine
        .handle_goal_update(
            &kickoff.spawned_sessions[0].session_key,
            GoalUpdateParams {
                status: Some("done".into()),
                ..GoalUpdateParams::default()
            },
        )
        .await
        .unwrap();

    let data = engine.store().snapshot().await;
    assert_eq!(data.goal(&g1).unwrap().status, GoalStatus::Done);

    // The unblock cascade spawns the first task of each phase-2 goal.
    let later_ids: Vec<String> = outcome.goal_ids[1..].to_vec();
    assert!(
        wait_for(engine, Duration::from_secs(10), move |data| {
            later_ids.iter().all(|id| {
                data.goal(id)
                    .map(|g| g.tasks[0].session_key.is_some())
                    .unwrap_or(false)
            })
        })
        .await,
        "phase-2 goals were never kicked off"
    );

    engine.shutdown();
}

/// Two kickoffs in immediate succession spawn sessions exactly once.
#[tokio::test]
async fn double_kickoff_is_idempotent() {
    let rig = TestRig::new();
    let engine = &rig.engine;

    let goal = engine
        .create_goal(NewGoal {
            title: "Solo".into(),
            ..NewGoal::default()
        })
        .await
        .unwrap();
    engine
        .add_task(
            &goal.id,
            NewTask {
                text: "only task".into(),
                ..NewTask::default()
            },
        )
        .await
        .unwrap();

    let first = engine.kickoff_goal(&goal.id).await.unwrap();
    let second = engine.kickoff_goal(&goal.id).await.unwrap();

    assert_eq!(first.spawned_sessions.len(), 1);
    assert!(second.spawned_sessions.is_empty());

    // Only one send reached the gateway.
    assert_eq!(rig.gateway.sent().len(), 1);
    engine.shutdown();
}

/// Tasks assigned to roles resolve through the configured role map.
#[tokio::test]
async fn kickoff_resolves_agent_roles() {
    let rig = TestRig::new();
    let engine = &rig.engine;

    engine
        .store()
        .update(|data| {
            data.agent_roles.insert("backend".into(), "be-agent-7".into());
            Ok(())
        })
        .await
        .unwrap();

    let goal = engine
        .create_goal(NewGoal {
            title: "Roles".into(),
            ..NewGoal::default()
        })
        .await
        .unwrap();
    engine
        .add_task(
            &goal.id,
            NewTask {
                text: "backend work".into(),
                agent: Some("backend".into()),
                ..NewTask::default()
            },
        )
        .await
        .unwrap();

    let kickoff = engine.kickoff_goal(&goal.id).await.unwrap();
    assert_eq!(kickoff.spawned_sessions[0].agent_id, "be-agent-7");
    assert!(
        kickoff.spawned_sessions[0]
            .session_key
            .starts_with("agent:be-agent-7:webchat:task-")
    );
    engine.shutdown();
}
