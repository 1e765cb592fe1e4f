// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end: branch routing on node results, and a loop that retries
//! until its condition clears.

mod common;

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use common::{Kernel, scripted_node};
use serde_json::{Value, json};
use wfk_core::{RunStatus, Token};
use wfk_store::StreamBus;
use wfk_worker::NodeExecutor;

#[tokio::test]
async fn branch_routes_exactly_one_path() {
    let doc = json!({
        "nodes": [
            scripted_node("score", json!({"score": 85})),
            scripted_node("high", json!({"tier": "high"})),
            scripted_node("low", json!({"tier": "low"})),
        ],
        "edges": [
            {"from": "score", "to": "high"},
            {"from": "score", "to": "low"},
        ],
    });
    // Branch rules ride on the scoring node.
    let mut doc = doc;
    doc["nodes"][0]["branch"] = json!({
        "rules": [
            {"when": "output.score >= 80", "next_nodes": ["high"]},
            {"when": "output.score < 80", "next_nodes": ["low"]},
        ],
        "default": [],
    });

    let kernel = Kernel::new();
    kernel.publish_workflow(&doc, "alice", "main").await;
    let run_id = kernel.submit("alice", "main").await;

    kernel.drive().await;
    assert_eq!(kernel.status(run_id).await, RunStatus::Completed);

    // Entry token + exactly one routed token.
    assert_eq!(
        kernel.store.stream_len("wf.tasks.function").await.unwrap(),
        2
    );
}

/// Executor that replays a scripted sequence of outputs for one node and
/// behaves like the function executor elsewhere.
struct SequenceExecutor {
    node: String,
    outputs: Mutex<Vec<Value>>,
}

#[async_trait]
impl NodeExecutor for SequenceExecutor {
    fn name(&self) -> &str {
        "sequence"
    }

    async fn execute(&self, token: &Token) -> AnyResult<Value> {
        if token.to_node == self.node {
            let mut outputs = self.outputs.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
            if !outputs.is_empty() {
                return Ok(outputs.remove(0));
            }
        }
        Ok(token
            .config
            .get("output")
            .cloned()
            .unwrap_or_else(|| json!({"status": "success"})))
    }
}

#[tokio::test]
async fn loop_retries_until_success() {
    let doc = json!({
        "nodes": [
            {
                "id": "fetch",
                "type": "loop",
                "loop": {
                    "max_iterations": 3,
                    "loop_back_to": "fetch",
                    "condition": "output.status != 'success'",
                    "break_path": ["ok"],
                    "timeout_path": ["err"],
                },
            },
            scripted_node("ok", json!({"done": true})),
            scripted_node("err", json!({"done": false})),
        ],
        "edges": [
            {"from": "fetch", "to": "ok"},
            {"from": "fetch", "to": "err"},
        ],
    });

    let kernel = Kernel::with_executor(Arc::new(SequenceExecutor {
        node: "fetch".into(),
        outputs: Mutex::new(vec![
            json!({"status": "error"}),
            json!({"status": "success"}),
        ]),
    }));
    kernel.publish_workflow(&doc, "alice", "main").await;
    let run_id = kernel.submit("alice", "main").await;

    kernel.drive().await;
    assert_eq!(kernel.status(run_id).await, RunStatus::Completed);

    // fetch ran twice (entry + one retry), then ok — and err never ran.
    assert_eq!(
        kernel.store.stream_len("wf.tasks.function").await.unwrap(),
        3
    );
}

#[tokio::test]
async fn loop_budget_exhaustion_takes_timeout_path() {
    let doc = json!({
        "nodes": [
            {
                "id": "fetch",
                "type": "loop",
                "loop": {
                    "max_iterations": 1,
                    "loop_back_to": "fetch",
                    "condition": "output.status != 'success'",
                    "break_path": ["ok"],
                    "timeout_path": ["err"],
                },
            },
            scripted_node("ok", json!({"done": true})),
            scripted_node("err", json!({"recovered": true})),
        ],
        "edges": [
            {"from": "fetch", "to": "ok"},
            {"from": "fetch", "to": "err"},
        ],
    });

    // Every iteration keeps failing.
    let kernel = Kernel::with_executor(Arc::new(SequenceExecutor {
        node: "fetch".into(),
        outputs: Mutex::new(vec![
            json!({"status": "error"}),
            json!({"status": "error"}),
        ]),
    }));
    kernel.publish_workflow(&doc, "alice", "main").await;
    let run_id = kernel.submit("alice", "main").await;

    kernel.drive().await;
    assert_eq!(kernel.status(run_id).await, RunStatus::Completed);

    // Entry + one retry + the timeout-path node.
    assert_eq!(
        kernel.store.stream_len("wf.tasks.function").await.unwrap(),
        3
    );
}
