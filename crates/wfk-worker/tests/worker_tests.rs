// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tests for the shared worker loop: signalling, failure capture,
//! deadlines, and config fallback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;
use wfk_catalog::Catalog;
use wfk_core::{CompletionSignal, NodeKind, SignalStatus, Token, keys};
use wfk_ir::{EdgeDef, IrMetadata, NodeDef, WorkflowDoc};
use wfk_store::{MemoryStore, StoreExt, StreamBus};
use wfk_worker::executors::FunctionExecutor;
use wfk_worker::{NodeExecutor, Worker, WorkerConfig};

const STREAM: &str = "wf.tasks.function";

struct Failing;

#[async_trait]
impl NodeExecutor for Failing {
    fn name(&self) -> &str {
        "failing"
    }
    async fn execute(&self, _token: &Token) -> AnyResult<Value> {
        anyhow::bail!("boom")
    }
}

struct Slow;

#[async_trait]
impl NodeExecutor for Slow {
    fn name(&self) -> &str {
        "slow"
    }
    async fn execute(&self, _token: &Token) -> AnyResult<Value> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Value::Null)
    }
}

fn worker(store: &Arc<MemoryStore>, executor: Arc<dyn NodeExecutor>, deadline: Duration) -> Worker {
    let catalog = Arc::new(Catalog::new(store.clone()));
    let mut config = WorkerConfig::for_stream(STREAM);
    config.block_timeout = Duration::from_millis(20);
    config.deadline = deadline;
    Worker::new(store.clone(), catalog, executor, config)
}

async fn push_token(store: &Arc<MemoryStore>, token: &Token) {
    store
        .append(STREAM, serde_json::to_value(token).unwrap())
        .await
        .unwrap();
}

async fn next_signal(store: &Arc<MemoryStore>) -> CompletionSignal {
    let msg = store
        .read_group(
            keys::streams::COMPLETION_SIGNALS,
            "coordinator",
            "c0",
            Duration::from_millis(100),
        )
        .await
        .unwrap()
        .expect("a completion signal");
    serde_json::from_value(msg.payload).unwrap()
}

#[tokio::test]
async fn successful_execution_signals_completed() {
    let store = Arc::new(MemoryStore::new());
    let worker = worker(&store, Arc::new(FunctionExecutor), Duration::from_secs(5));
    let catalog = Catalog::new(store.clone());

    let token = Token::new(Uuid::now_v7(), "a", "b").with_config(BTreeMap::from([(
        "output".to_string(),
        json!({"score": 91}),
    )]));
    push_token(&store, &token).await;

    assert!(worker.poll_once().await.unwrap());
    let signal = next_signal(&store).await;
    assert_eq!(signal.status, SignalStatus::Completed);
    assert_eq!(signal.job_id, token.id);
    assert_eq!(signal.node_id, "b");
    assert_eq!(signal.metadata.from_node.as_deref(), Some("a"));

    // The persisted result round-trips through the blob store.
    let result = catalog
        .blob_json(signal.result_ref.as_ref().unwrap())
        .await
        .unwrap();
    assert_eq!(result, json!({"score": 91}));
}

#[tokio::test]
async fn executor_failure_signals_failed_with_error_blob() {
    let store = Arc::new(MemoryStore::new());
    let worker = worker(&store, Arc::new(Failing), Duration::from_secs(5));
    let catalog = Catalog::new(store.clone());

    push_token(&store, &Token::new(Uuid::now_v7(), "", "n")).await;
    worker.poll_once().await.unwrap();

    let signal = next_signal(&store).await;
    assert_eq!(signal.status, SignalStatus::Failed);
    assert_eq!(signal.metadata.error_type.as_deref(), Some("worker"));
    let blob = catalog
        .blob_json(signal.result_ref.as_ref().unwrap())
        .await
        .unwrap();
    assert_eq!(blob["error"], "boom");
    assert!(blob["metrics"]["execution_time_ms"].is_u64());
}

#[tokio::test(start_paused = true)]
async fn deadline_breach_signals_timeout() {
    let store = Arc::new(MemoryStore::new());
    let worker = worker(&store, Arc::new(Slow), Duration::from_millis(50));

    push_token(&store, &Token::new(Uuid::now_v7(), "", "n")).await;
    worker.poll_once().await.unwrap();

    let signal = next_signal(&store).await;
    assert_eq!(signal.status, SignalStatus::Failed);
    assert_eq!(signal.metadata.error_type.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn empty_config_falls_back_to_ir() {
    let store = Arc::new(MemoryStore::new());
    let worker = worker(&store, Arc::new(FunctionExecutor), Duration::from_secs(5));
    let catalog = Catalog::new(store.clone());

    // IR with a scripted config for node `n`.
    let doc = WorkflowDoc {
        nodes: vec![NodeDef {
            id: "n".into(),
            kind: NodeKind::Function,
            config: json!({"output": {"from": "ir"}}),
            branch: None,
            loop_spec: None,
        }],
        edges: Vec::<EdgeDef>::new(),
    };
    let ir = wfk_ir::compile(&doc, IrMetadata::default()).unwrap();
    let run_id = Uuid::now_v7();
    store.set_json(&keys::ir(run_id), &ir, None).await.unwrap();

    // Token arrives without embedded config.
    push_token(&store, &Token::new(run_id, "", "n")).await;
    worker.poll_once().await.unwrap();

    let signal = next_signal(&store).await;
    let result = catalog
        .blob_json(signal.result_ref.as_ref().unwrap())
        .await
        .unwrap();
    assert_eq!(result, json!({"from": "ir"}));
}

#[tokio::test]
async fn malformed_token_is_acked_and_dropped() {
    let store = Arc::new(MemoryStore::new());
    let worker = worker(&store, Arc::new(FunctionExecutor), Duration::from_secs(5));

    store.append(STREAM, json!({"not": "a token"})).await.unwrap();
    assert!(worker.poll_once().await.unwrap());
    assert_eq!(store.pending_len(STREAM, "workers").await.unwrap(), 0);
    assert_eq!(
        store
            .stream_len(keys::streams::COMPLETION_SIGNALS)
            .await
            .unwrap(),
        0
    );
}
