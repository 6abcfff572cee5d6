//! Worker failure handling: the retry loop and terminal failure.

use std::time::Duration;

use braid_core::engine::{NewGoal, NewTask};
use braid_core::events::Event;
use braid_store::TaskStatus;
use braid_test_utils::{TestRig, wait_for};

/// Scenario: a task with `maxRetries = 1` fails once (respawned), then
/// fails again (terminal).
#[tokio::test(start_paused = true)]
async fn retry_then_fail() {
    let rig = TestRig::new();
    let engine = &rig.engine;

    let goal = engine
        .create_goal(NewGoal {
            title: "Flaky".into(),
            max_retries: Some(1),
            ..NewGoal::default()
        })
        .await
        .unwrap();
    let task = engine
        .add_task(
            &goal.id,
            NewTask {
                text: "unstable work".into(),
                ..NewTask::default()
            },
        )
        .await
        .unwrap();

    let kickoff = engine.kickoff_goal(&goal.id).await.unwrap();
    let first_session = kickoff.spawned_sessions[0].session_key.clone();

    let mut events = engine.events().subscribe();

    // First failure: retried.
    engine.agent_end(&first_session, false).await.unwrap();

    let data = engine.store().snapshot().await;
    let t = data.goal(&goal.id).unwrap().task(&task.id).unwrap().clone();
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.retry_count, 1);
    assert_eq!(t.session_key, None);
    assert!(t.last_error.is_some());
    assert!(!data.session_index.contains_key(&first_session));

    let envelope = events.recv().await.unwrap();
    match envelope.event {
        Event::GoalTaskRetry {
            retry_count,
            max_retries,
            ..
        } => {
            assert_eq!(retry_count, 1);
            assert_eq!(max_retries, 1);
        }
        other => panic!("expected goal.task_retry, got {other:?}"),
    }

    // The follow-up kickoff respawns the task.
    let goal_id = goal.id.clone();
    let task_id = task.id.clone();
    assert!(
        wait_for(engine, Duration::from_secs(10), move |data| {
            data.goal(&goal_id)
                .and_then(|g| g.task(&task_id))
                .map(|t| t.status == TaskStatus::InProgress && t.session_key.is_some())
                .unwrap_or(false)
        })
        .await,
        "task was never respawned"
    );

    let data = engine.store().snapshot().await;
    let second_session = data
        .goal(&goal.id)
        .unwrap()
        .task(&task.id)
        .unwrap()
        .session_key
        .clone()
        .unwrap();

    // Second failure: retries exhausted, task fails for good.
    engine.agent_end(&second_session, false).await.unwrap();

    let data = engine.store().snapshot().await;
    let t = data.goal(&goal.id).unwrap().task(&task.id).unwrap().clone();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.retry_count, 1);

    let mut saw_failed = false;
    while let Ok(envelope) = events.try_recv() {
        if let Event::GoalTaskFailed { retry_count, .. } = envelope.event {
            assert_eq!(retry_count, 1);
            saw_failed = true;
        }
    }
    assert!(saw_failed, "goal.task_failed was not broadcast");

    // No further kickoff happens for the failed task.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let data = engine.store().snapshot().await;
    let t = data.goal(&goal.id).unwrap().task(&task.id).unwrap().clone();
    assert_eq!(t.status, TaskStatus::Failed);

    engine.shutdown();
}

/// A stale `agent_end` for a session key the store no longer owns is
/// swallowed.
#[tokio::test]
async fn agent_end_for_unknown_session_is_ignored() {
    let rig = TestRig::new();
    let engine = &rig.engine;

    engine
        .agent_end("agent:main:webchat:task-999", false)
        .await
        .unwrap();
    engine
        .agent_end("agent:main:webchat:task-999", true)
        .await
        .unwrap();
    engine.shutdown();
}

/// A worker ending normally without reporting is auto-marked done.
#[tokio::test(start_paused = true)]
async fn successful_end_auto_marks_done() {
    let rig = TestRig::new();
    let engine = &rig.engine;

    let goal = engine
        .create_goal(NewGoal {
            title: "Auto".into(),
            ..NewGoal::default()
        })
        .await
        .unwrap();
    let task = engine
        .add_task(
            &goal.id,
            NewTask {
                text: "quiet work".into(),
                ..NewTask::default()
            },
        )
        .await
        .unwrap();

    let kickoff = engine.kickoff_goal(&goal.id).await.unwrap();
    let session = kickoff.spawned_sessions[0].session_key.clone();

    let mut events = engine.events().subscribe();
    engine.agent_end(&session, true).await.unwrap();

    let data = engine.store().snapshot().await;
    let t = data.goal(&goal.id).unwrap().task(&task.id).unwrap().clone();
    assert_eq!(t.status, TaskStatus::Done);
    assert!(t.done);
    assert_eq!(t.summary.as_deref(), Some("(auto-marked on session end)"));

    let envelope = events.recv().await.unwrap();
    match envelope.event {
        Event::GoalTaskCompleted {
            all_tasks_done,
            auto_completed,
            ..
        } => {
            assert!(all_tasks_done);
            assert!(auto_completed);
        }
        other => panic!("expected goal.task_completed, got {other:?}"),
    }

    // The goal auto-completes (no worktree, so no merge).
    let goal_id = goal.id.clone();
    assert!(
        wait_for(engine, Duration::from_secs(5), move |data| {
            data.goal(&goal_id)
                .map(|g| g.completed)
                .unwrap_or(false)
        })
        .await
    );
    engine.shutdown();
}
