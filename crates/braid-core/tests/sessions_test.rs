//! Session lifecycle tests: kill cascades, stale cleanup, reporting, and
//! the index invariants.

use braid_core::engine::{NewGoal, NewStrand, NewTask};
use braid_store::TaskStatus;
use braid_test_utils::TestRig;

/// Scenario: deleting a strand kills worker sessions and the strand PM,
/// removes its goals, and clears both indices.
#[tokio::test]
async fn strand_delete_cascades() {
    let rig = TestRig::new();
    let engine = &rig.engine;

    let strand = engine
        .create_strand(NewStrand {
            name: "Doomed".into(),
            ..NewStrand::default()
        })
        .await
        .unwrap();
    let g1 = engine
        .create_goal(NewGoal {
            title: "G1".into(),
            strand_id: Some(strand.id.clone()),
            ..NewGoal::default()
        })
        .await
        .unwrap();
    let g2 = engine
        .create_goal(NewGoal {
            title: "G2".into(),
            strand_id: Some(strand.id.clone()),
            ..NewGoal::default()
        })
        .await
        .unwrap();

    // Two independent live worker sessions on G1.
    for text in ["a", "b"] {
        engine
            .add_task(
                &g1.id,
                NewTask {
                    text: text.into(),
                    ..NewTask::default()
                },
            )
            .await
            .unwrap();
    }
    let kickoff = engine.kickoff_goal(&g1.id).await.unwrap();
    assert_eq!(kickoff.spawned_sessions.len(), 2);
    let sk1 = kickoff.spawned_sessions[0].session_key.clone();
    let sk2 = kickoff.spawned_sessions[1].session_key.clone();

    // A strand PM session.
    let chat = engine.pm_strand_chat(&strand.id, "plan this", true).await.unwrap();
    let skp = chat.session_key.clone();

    // Live worker keys are in exactly one index.
    let data = engine.store().snapshot().await;
    data.check_invariants().expect("invariants hold before delete");
    assert!(data.session_index.contains_key(&sk1));
    assert!(!data.session_strand_index.contains_key(&sk1));

    let killed = engine.delete_strand(&strand.id).await.unwrap();
    assert!(killed.contains(&sk1));
    assert!(killed.contains(&sk2));
    assert!(killed.contains(&skp));

    // No goal with this strandId survives, and no index entry points
    // at the strand.
    let data = engine.store().snapshot().await;
    assert!(data.goal(&g1.id).is_none());
    assert!(data.goal(&g2.id).is_none());
    assert!(data.strand(&strand.id).is_none());
    assert!(!data.session_index.contains_key(&sk1));
    assert!(!data.session_index.contains_key(&sk2));
    assert!(!data.session_strand_index.contains_key(&skp));
    data.check_invariants().expect("invariants hold after delete");

    // The gateway teardown was issued for each key.
    let deleted = rig.gateway.deleted();
    assert!(deleted.contains(&sk1));
    assert!(deleted.contains(&sk2));
    engine.shutdown();
}

/// Killing a goal's sessions resets non-done tasks to pending so a later
/// kickoff respawns them.
#[tokio::test]
async fn kill_for_goal_resets_open_tasks() {
    let rig = TestRig::new();
    let engine = &rig.engine;

    let goal = engine
        .create_goal(NewGoal {
            title: "Restartable".into(),
            ..NewGoal::default()
        })
        .await
        .unwrap();
    engine
        .add_task(
            &goal.id,
            NewTask {
                text: "work".into(),
                ..NewTask::default()
            },
        )
        .await
        .unwrap();
    let kickoff = engine.kickoff_goal(&goal.id).await.unwrap();
    let sk = kickoff.spawned_sessions[0].session_key.clone();

    let killed = engine.kill_for_goal(&goal.id).await.unwrap();
    assert_eq!(killed, vec![sk.clone()]);

    let data = engine.store().snapshot().await;
    let task = &data.goal(&goal.id).unwrap().tasks[0];
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.session_key, None);
    data.check_invariants().unwrap();

    // A later kickoff spawns it again under a fresh session.
    let again = engine.kickoff_goal(&goal.id).await.unwrap();
    assert_eq!(again.spawned_sessions.len(), 1);
    engine.shutdown();
}

/// Gateway failures during teardown do not roll back the store change.
#[tokio::test]
async fn kill_survives_unreachable_gateway() {
    let rig = TestRig::new();
    let engine = &rig.engine;

    let goal = engine
        .create_goal(NewGoal {
            title: "Orphan".into(),
            ..NewGoal::default()
        })
        .await
        .unwrap();
    engine
        .add_task(
            &goal.id,
            NewTask {
                text: "work".into(),
                ..NewTask::default()
            },
        )
        .await
        .unwrap();
    engine.kickoff_goal(&goal.id).await.unwrap();

    rig.gateway.set_unreachable(true);
    let killed = engine.kill_for_goal(&goal.id).await.unwrap();
    assert_eq!(killed.len(), 1);

    let data = engine.store().snapshot().await;
    assert!(data.session_index.is_empty());
    assert_eq!(data.goal(&goal.id).unwrap().tasks[0].session_key, None);
    engine.shutdown();
}

/// `cleanupStale` aborts sessions attached to tasks that are neither
/// in-progress nor done.
#[tokio::test]
async fn cleanup_stale_aborts_limbo_sessions() {
    let rig = TestRig::new();
    let engine = &rig.engine;

    let goal = engine
        .create_goal(NewGoal {
            title: "Limbo".into(),
            ..NewGoal::default()
        })
        .await
        .unwrap();
    let task = engine
        .add_task(
            &goal.id,
            NewTask {
                text: "will go stale".into(),
                ..NewTask::default()
            },
        )
        .await
        .unwrap();
    let kickoff = engine.kickoff_goal(&goal.id).await.unwrap();
    let sk = kickoff.spawned_sessions[0].session_key.clone();

    // Force the task into a limbo status while keeping its session key.
    engine
        .store()
        .update(|data| {
            let goal = data.goals.iter_mut().find(|g| !g.tasks.is_empty()).unwrap();
            let t = goal.task_mut(&task.id).unwrap();
            t.status = TaskStatus::Blocked;
            Ok(())
        })
        .await
        .unwrap();

    let aborted = engine.cleanup_stale(None).await.unwrap();
    assert_eq!(aborted, vec![sk.clone()]);
    assert!(rig.gateway.aborted().contains(&sk));

    let data = engine.store().snapshot().await;
    assert_eq!(data.goal(&goal.id).unwrap().tasks[0].session_key, None);
    assert!(!data.session_index.contains_key(&sk));
    data.check_invariants().unwrap();

    // In-progress sessions are left alone.
    let again = engine.kickoff_goal(&goal.id).await.unwrap();
    assert_eq!(again.spawned_sessions.len(), 0, "blocked task is not spawnable");
    engine.shutdown();
}

/// `listForStrand` attributes sessions to their strand, goal, and task.
#[tokio::test]
async fn list_for_strand_reports_attribution() {
    let rig = TestRig::new();
    let engine = &rig.engine;

    let strand = engine
        .create_strand(NewStrand {
            name: "Visible".into(),
            ..NewStrand::default()
        })
        .await
        .unwrap();
    let goal = engine
        .create_goal(NewGoal {
            title: "G".into(),
            strand_id: Some(strand.id.clone()),
            ..NewGoal::default()
        })
        .await
        .unwrap();
    let task = engine
        .add_task(
            &goal.id,
            NewTask {
                text: "work".into(),
                ..NewTask::default()
            },
        )
        .await
        .unwrap();
    engine.kickoff_goal(&goal.id).await.unwrap();
    engine.pm_strand_chat(&strand.id, "hello", false).await.unwrap();

    let sessions = engine.list_for_strand(&strand.id).await.unwrap();
    let kinds: Vec<&str> = sessions.iter().map(|s| s.kind.as_str()).collect();
    assert!(kinds.contains(&"strand-pm"));
    assert!(kinds.contains(&"worker"));

    let worker = sessions.iter().find(|s| s.kind == "worker").unwrap();
    assert_eq!(worker.goal_id.as_deref(), Some(goal.id.as_str()));
    assert_eq!(worker.task_id.as_deref(), Some(task.id.as_str()));
    engine.shutdown();
}
