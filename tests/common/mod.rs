// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared end-to-end harness: a full kernel over the in-memory store,
//! driven one message at a time for deterministic assertions.

// Each scenario binary compiles its own copy; not every binary uses
// every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;
use wfk_catalog::Catalog;
use wfk_coordinator::overlay::{OverlayConfig, PatchOverlay};
use wfk_coordinator::{Coordinator, CoordinatorConfig};
use wfk_core::{BaseRef, MediaType, RunRecord, RunRequest, RunStatus, keys};
use wfk_hitl::{HitlConfig, HitlRequestWorker, HitlResponseWorker};
use wfk_initializer::{Initializer, InitializerConfig};
use wfk_store::{MemoryStore, Store, StoreExt, StreamBus};
use wfk_worker::executors::FunctionExecutor;
use wfk_worker::{NodeExecutor, Worker, WorkerConfig};

const BLOCK: Duration = Duration::from_millis(20);

pub struct Kernel {
    pub store: Arc<MemoryStore>,
    pub catalog: Arc<Catalog>,
    pub initializer: Initializer,
    pub coordinator: Coordinator,
    pub worker: Worker,
    pub hitl_request: HitlRequestWorker,
    pub hitl_response: HitlResponseWorker,
    pub overlay: PatchOverlay,
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_executor(Arc::new(FunctionExecutor))
    }

    pub fn with_executor(executor: Arc<dyn NodeExecutor>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(Catalog::new(store.clone()));

        let mut init_config = InitializerConfig::default();
        init_config.block_timeout = BLOCK;
        let mut coord_config = CoordinatorConfig::default();
        coord_config.block_timeout = BLOCK;
        let mut worker_config = WorkerConfig::for_stream("wf.tasks.function");
        worker_config.block_timeout = BLOCK;
        let mut hitl_config = HitlConfig::default();
        hitl_config.block_timeout = BLOCK;

        Self {
            initializer: Initializer::new(store.clone(), catalog.clone(), init_config),
            coordinator: Coordinator::new(store.clone(), catalog.clone(), coord_config),
            worker: Worker::new(store.clone(), catalog.clone(), executor, worker_config),
            hitl_request: HitlRequestWorker::new(store.clone(), hitl_config.clone()),
            hitl_response: HitlResponseWorker::new(store.clone(), catalog.clone(), hitl_config),
            overlay: PatchOverlay::new(store.clone(), catalog.clone(), OverlayConfig::default()),
            store,
            catalog,
        }
    }

    /// Store a workflow document, record it as a dag version, and point
    /// `owner/tag` at it. Returns the artifact id.
    pub async fn publish_workflow(&self, doc: &Value, owner: &str, tag: &str) -> Uuid {
        let blob = self
            .catalog
            .put_blob(&serde_json::to_vec(doc).unwrap(), MediaType::Dag)
            .await
            .unwrap();
        let artifact = self
            .catalog
            .create_dag_version(&blob, tag, owner)
            .await
            .unwrap();
        self.catalog
            .move_tag(owner, tag, artifact.id, 0, owner)
            .await
            .unwrap();
        artifact.id
    }

    /// Submit a run against a tag and let the initializer process it.
    pub async fn submit(&self, owner: &str, tag: &str) -> Uuid {
        let request = RunRequest::new(BaseRef::Tag { name: tag.to_string() }, owner);
        let run_id = request.run_id;
        self.store
            .append(
                keys::streams::RUN_REQUESTS,
                serde_json::to_value(&request).unwrap(),
            )
            .await
            .unwrap();
        self.initializer.poll_once().await.unwrap();
        run_id
    }

    /// One worker step followed by one coordinator step.
    pub async fn step(&self) -> bool {
        let worked = self.worker.poll_once().await.unwrap();
        let coordinated = self.coordinator.poll_once().await.unwrap();
        worked || coordinated
    }

    /// Drive worker, HITL request side, and coordinator until quiescent.
    pub async fn drive(&self) {
        for _ in 0..64 {
            let mut progressed = false;
            progressed |= self.worker.poll_once().await.unwrap();
            progressed |= self.hitl_request.poll_once().await.unwrap();
            progressed |= self.coordinator.poll_once().await.unwrap();
            if !progressed {
                return;
            }
        }
        panic!("kernel did not quiesce within 64 rounds");
    }

    pub async fn run_record(&self, run_id: Uuid) -> RunRecord {
        self.store
            .get_json(&keys::run_record(run_id))
            .await
            .unwrap()
            .expect("run record")
    }

    pub async fn status(&self, run_id: Uuid) -> RunStatus {
        self.run_record(run_id).await.status
    }

    pub async fn counter(&self, run_id: Uuid) -> i64 {
        self.store.run_counter(run_id).await.unwrap()
    }
}

/// A workflow whose function nodes script their results via `config.output`.
pub fn scripted_node(id: &str, output: Value) -> Value {
    serde_json::json!({
        "id": id,
        "type": "function",
        "config": {"output": output},
    })
}
