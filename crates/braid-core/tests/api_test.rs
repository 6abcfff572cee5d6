//! Request-surface tests: validation, not-found handling, the uniform
//! response shape, and document invariants across operation sequences.

use serde_json::json;

use braid_core::api::{self, Request};
use braid_test_utils::TestRig;

async fn dispatch_json(rig: &TestRig, value: serde_json::Value) -> api::Response {
    let request: Request = serde_json::from_value(value).expect("request deserializes");
    api::dispatch(&rig.engine, request).await
}

#[tokio::test]
async fn strand_crud_round_trip() {
    let rig = TestRig::new();

    let created = dispatch_json(
        &rig,
        json!({"op": "strands.create", "params": {"name": "App", "keywords": ["web"]}}),
    )
    .await;
    assert!(created.ok, "create failed: {:?}", created.error);
    let strand_id = created.payload.unwrap()["id"].as_str().unwrap().to_owned();

    let listed = dispatch_json(&rig, json!({"op": "strands.list"})).await;
    assert_eq!(listed.payload.unwrap().as_array().unwrap().len(), 1);

    let updated = dispatch_json(
        &rig,
        json!({"op": "strands.update", "params": {"strandId": strand_id, "description": "a web app"}}),
    )
    .await;
    assert!(updated.ok);
    assert_eq!(updated.payload.unwrap()["description"], "a web app");

    let fetched = dispatch_json(
        &rig,
        json!({"op": "strands.get", "params": {"strandId": strand_id}}),
    )
    .await;
    assert!(fetched.ok);
    assert_eq!(fetched.payload.unwrap()["strand"]["name"], "App");

    let deleted = dispatch_json(
        &rig,
        json!({"op": "strands.delete", "params": {"strandId": strand_id}}),
    )
    .await;
    assert!(deleted.ok);
    assert!(
        deleted.payload.unwrap()["killedSessions"]
            .as_array()
            .unwrap()
            .is_empty()
    );

    let data = rig.engine.store().snapshot().await;
    assert!(data.strands.is_empty());
    data.check_invariants().unwrap();
    rig.engine.shutdown();
}

#[tokio::test]
async fn not_found_reports_error_without_state_change() {
    let rig = TestRig::new();

    let response = dispatch_json(
        &rig,
        json!({"op": "goals.kickoff", "params": {"goalId": "goal_404"}}),
    )
    .await;
    assert!(!response.ok);
    assert!(response.error.unwrap().contains("not found"));

    let response = dispatch_json(
        &rig,
        json!({"op": "sessions.killForStrand", "params": {"strandId": "strand_404"}}),
    )
    .await;
    assert!(!response.ok);

    let data = rig.engine.store().snapshot().await;
    assert!(data.strands.is_empty());
    assert!(data.goals.is_empty());
    rig.engine.shutdown();
}

#[tokio::test]
async fn task_validation_rejects_foreign_dependencies() {
    let rig = TestRig::new();

    let goal = dispatch_json(
        &rig,
        json!({"op": "goals.create", "params": {"title": "Solo"}}),
    )
    .await;
    let goal_id = goal.payload.unwrap()["id"].as_str().unwrap().to_owned();

    let response = dispatch_json(
        &rig,
        json!({"op": "tasks.create", "params": {
            "goalId": goal_id,
            "text": "bad deps",
            "dependsOn": ["task_999"]
        }}),
    )
    .await;
    assert!(!response.ok);
    assert!(response.error.unwrap().contains("not a sibling"));

    let data = rig.engine.store().snapshot().await;
    assert!(data.goal(&goal_id).unwrap().tasks.is_empty());
    rig.engine.shutdown();
}

#[tokio::test]
async fn goal_dependencies_require_same_strand() {
    let rig = TestRig::new();

    let s1 = dispatch_json(&rig, json!({"op": "strands.create", "params": {"name": "A"}})).await;
    let s1_id = s1.payload.unwrap()["id"].as_str().unwrap().to_owned();
    let s2 = dispatch_json(&rig, json!({"op": "strands.create", "params": {"name": "B"}})).await;
    let s2_id = s2.payload.unwrap()["id"].as_str().unwrap().to_owned();

    let g1 = dispatch_json(
        &rig,
        json!({"op": "goals.create", "params": {"title": "G1", "strandId": s1_id}}),
    )
    .await;
    let g1_id = g1.payload.unwrap()["id"].as_str().unwrap().to_owned();

    let response = dispatch_json(
        &rig,
        json!({"op": "goals.create", "params": {
            "title": "G2", "strandId": s2_id, "dependsOn": [g1_id]
        }}),
    )
    .await;
    assert!(!response.ok);
    assert!(response.error.unwrap().contains("different strand"));
    rig.engine.shutdown();
}

#[tokio::test]
async fn kickoff_through_the_surface() {
    let rig = TestRig::new();

    let goal = dispatch_json(
        &rig,
        json!({"op": "goals.create", "params": {"title": "Surface"}}),
    )
    .await;
    let goal_id = goal.payload.unwrap()["id"].as_str().unwrap().to_owned();

    dispatch_json(
        &rig,
        json!({"op": "tasks.create", "params": {"goalId": goal_id, "text": "work"}}),
    )
    .await;

    let kickoff = dispatch_json(
        &rig,
        json!({"op": "goals.kickoff", "params": {"goalId": goal_id}}),
    )
    .await;
    assert!(kickoff.ok);
    let payload = kickoff.payload.unwrap();
    assert_eq!(payload["spawnedSessions"].as_array().unwrap().len(), 1);
    assert_eq!(payload["spawnedSessions"][0]["headlessStarted"], true);

    let data = rig.engine.store().snapshot().await;
    data.check_invariants().unwrap();
    rig.engine.shutdown();
}

/// Gateway-unreachable kickoffs still persist the assignment but report
/// `headlessStarted: false`.
#[tokio::test]
async fn kickoff_with_unreachable_gateway() {
    let rig = TestRig::new();
    rig.gateway.set_unreachable(true);

    let goal = dispatch_json(
        &rig,
        json!({"op": "goals.create", "params": {"title": "Offline"}}),
    )
    .await;
    let goal_id = goal.payload.unwrap()["id"].as_str().unwrap().to_owned();
    dispatch_json(
        &rig,
        json!({"op": "tasks.create", "params": {"goalId": goal_id, "text": "work"}}),
    )
    .await;

    let kickoff = dispatch_json(
        &rig,
        json!({"op": "goals.kickoff", "params": {"goalId": goal_id}}),
    )
    .await;
    assert!(kickoff.ok);
    let payload = kickoff.payload.unwrap();
    assert_eq!(payload["spawnedSessions"][0]["headlessStarted"], false);
    assert!(!payload["errors"].as_array().unwrap().is_empty());

    // The assignment is still the store's truth.
    let data = rig.engine.store().snapshot().await;
    assert!(data.goal(&goal_id).unwrap().tasks[0].session_key.is_some());
    rig.engine.shutdown();
}

#[tokio::test]
async fn pm_save_response_creates_tasks() {
    let rig = TestRig::new();

    let goal = dispatch_json(
        &rig,
        json!({"op": "goals.create", "params": {"title": "Saved"}}),
    )
    .await;
    let goal_id = goal.payload.unwrap()["id"].as_str().unwrap().to_owned();

    let response = dispatch_json(
        &rig,
        json!({"op": "pm.saveResponse", "params": {
            "goalId": goal_id,
            "content": "## Tasks\n- one\n- two\n"
        }}),
    )
    .await;
    assert!(response.ok);
    let payload = response.payload.unwrap();
    assert_eq!(payload["cascadeState"], "tasks_created");
    assert_eq!(payload["tasksCreated"], 2);

    // Re-materializing from the saved history does not duplicate the
    // history entry.
    let before = rig
        .engine
        .store()
        .snapshot()
        .await
        .goal(&goal_id)
        .unwrap()
        .pm_chat_history
        .len();
    let again = dispatch_json(
        &rig,
        json!({"op": "pm.createTasksFromPlan", "params": {"goalId": goal_id}}),
    )
    .await;
    assert!(again.ok);
    let after = rig
        .engine
        .store()
        .snapshot()
        .await
        .goal(&goal_id)
        .unwrap()
        .pm_chat_history
        .len();
    assert_eq!(before, after);
    rig.engine.shutdown();
}

#[tokio::test]
async fn git_ops_fail_cleanly_without_workspaces() {
    let rig = TestRig::new();

    let goal = dispatch_json(
        &rig,
        json!({"op": "goals.create", "params": {"title": "NoGit"}}),
    )
    .await;
    let goal_id = goal.payload.unwrap()["id"].as_str().unwrap().to_owned();

    for op in [
        "goals.branchStatus",
        "goals.retryPush",
        "goals.retryMerge",
        "goals.pushMain",
        "goals.createPR",
    ] {
        let response = dispatch_json(&rig, json!({"op": op, "params": {"goalId": goal_id}})).await;
        assert!(!response.ok, "{op} should fail without git");
        assert!(response.error.unwrap().contains("git features are disabled"));
    }
    rig.engine.shutdown();
}
