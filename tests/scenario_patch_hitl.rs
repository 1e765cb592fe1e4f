// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end: mid-run patching reroutes in-flight work, and a HITL node
//! suspends the run until a human decision resumes it.

mod common;

use chrono::Utc;
use common::{Kernel, scripted_node};
use serde_json::json;
use wfk_core::{HitlDecision, MediaType, RunStatus, keys};
use wfk_store::{Store, StreamBus};

#[tokio::test]
async fn mid_run_patch_extends_a_running_workflow() {
    let doc = json!({
        "nodes": [
            scripted_node("a", json!({"step": 1})),
            scripted_node("b", json!({"step": 2})),
        ],
        "edges": [{"from": "a", "to": "b"}],
    });
    let kernel = Kernel::new();
    kernel.publish_workflow(&doc, "alice", "main").await;
    let mut events = kernel.store.subscribe(&keys::events_channel("alice"));
    let run_id = kernel.submit("alice", "main").await;

    // A executes and routes to B.
    kernel.step().await;
    assert_eq!(kernel.counter(run_id).await, 1);

    // An agent proposes appending C behind B while B is still in flight.
    let ops = json!([
        {"op": "add", "path": "/nodes/-",
         "value": {"id": "c", "type": "function", "config": {"output": {"step": 3}}}},
        {"op": "add", "path": "/edges/-", "value": {"from": "b", "to": "c"}}
    ]);
    let ops_blob = kernel
        .catalog
        .put_blob(&serde_json::to_vec(&ops).unwrap(), MediaType::PatchOps)
        .await
        .unwrap();
    let patch = kernel
        .overlay
        .apply_run_patch(run_id, &ops_blob, "agent", Some("a".into()))
        .await
        .unwrap();
    assert_eq!(patch.seq, 1);

    // B completes against the rewritten IR and routes to C.
    kernel.step().await;
    assert_eq!(kernel.counter(run_id).await, 1);

    // C completes the run.
    kernel.step().await;
    assert_eq!(kernel.counter(run_id).await, 0);
    assert_eq!(kernel.status(run_id).await, RunStatus::Completed);

    // The event stream shows one node_completed for C.
    let mut c_completions = 0;
    while let Some(event) = events.try_recv() {
        if event["type"] == "node_completed" && event["node_id"] == "c" {
            c_completions += 1;
        }
    }
    assert_eq!(c_completions, 1);
}

#[tokio::test]
async fn disconnected_patch_node_never_executes() {
    let doc = json!({
        "nodes": [
            scripted_node("a", json!({"step": 1})),
            scripted_node("b", json!({"step": 2})),
        ],
        "edges": [{"from": "a", "to": "b"}],
    });
    let kernel = Kernel::new();
    kernel.publish_workflow(&doc, "alice", "main").await;
    let run_id = kernel.submit("alice", "main").await;
    kernel.step().await;

    // The patch adds an island; it is accepted by default.
    let ops = json!([
        {"op": "add", "path": "/nodes/-",
         "value": {"id": "island", "type": "function", "config": {"output": {}}}}
    ]);
    let ops_blob = kernel
        .catalog
        .put_blob(&serde_json::to_vec(&ops).unwrap(), MediaType::PatchOps)
        .await
        .unwrap();
    kernel
        .overlay
        .apply_run_patch(run_id, &ops_blob, "agent", None)
        .await
        .unwrap();

    kernel.drive().await;
    assert_eq!(kernel.status(run_id).await, RunStatus::Completed);
    // Two tokens only: the island never received one.
    assert_eq!(
        kernel.store.stream_len("wf.tasks.function").await.unwrap(),
        2
    );
}

#[tokio::test]
async fn hitl_round_trip_suspends_and_resumes() {
    let doc = json!({
        "nodes": [
            {"id": "approve", "type": "hitl", "config": {"message": "ship it?"}},
            scripted_node("deploy", json!({"deployed": true})),
        ],
        "edges": [{"from": "approve", "to": "deploy"}],
    });
    let kernel = Kernel::new();
    kernel.publish_workflow(&doc, "alice", "main").await;
    let mut events = kernel.store.subscribe(&keys::events_channel("alice"));
    let run_id = kernel.submit("alice", "main").await;

    // The request side parks the token; nothing blocks in memory.
    kernel.drive().await;
    assert_eq!(kernel.status(run_id).await, RunStatus::WaitingForApproval);
    assert_eq!(kernel.counter(run_id).await, 1);
    assert_eq!(
        kernel
            .store
            .counter_value(&keys::run_pending_approvals(run_id))
            .await
            .unwrap(),
        1
    );

    let saw_approval_event = std::iter::from_fn(|| events.try_recv())
        .any(|e| e["type"] == "approval_required");
    assert!(saw_approval_event);

    // A human approves (twice — the duplicate must be absorbed).
    for _ in 0..2 {
        let decision = HitlDecision {
            run_id,
            node_id: "approve".into(),
            approved: true,
            comment: None,
            approved_by: "bob".into(),
            approved_at: Utc::now(),
            workflow_tag: "main".into(),
        };
        kernel
            .store
            .append(
                keys::streams::HITL_RESPONSES,
                serde_json::to_value(&decision).unwrap(),
            )
            .await
            .unwrap();
        kernel.hitl_response.poll_once().await.unwrap();
    }

    // One synthetic completion, not two.
    assert_eq!(
        kernel
            .store
            .stream_len(keys::streams::COMPLETION_SIGNALS)
            .await
            .unwrap(),
        1
    );

    kernel.drive().await;
    assert_eq!(kernel.status(run_id).await, RunStatus::Completed);
    assert_eq!(
        kernel
            .store
            .counter_value(&keys::run_pending_approvals(run_id))
            .await
            .unwrap(),
        0
    );
}
