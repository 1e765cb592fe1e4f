// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! wfk-coordinator
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Counter discipline: within one signal the coordinator appends and
//! counts every successor emission *before* applying the consume. The
//! counter therefore never dips to zero while successors are still owed,
//! and zero on the consume op is an unambiguous completion signal — also
//! under concurrent shards, since each op is atomic in the store.

/// Mid-run patch overlay.
pub mod overlay;

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wfk_catalog::{Catalog, CatalogError};
use wfk_core::error::ErrorKind;
use wfk_core::event::{WorkflowEvent, WorkflowEventKind};
use wfk_core::{
    CasId, CompletionSignal, RunRecord, RunStatus, SignalStatus, Token, keys,
};
use wfk_ir::{ConfigSource, Ir, IrNode};
use wfk_store::{Backplane, CancellationToken, StoreError, StoreExt};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The store failed; the signal stays pending for redelivery.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Catalog access failed (result blobs, patch recompilation).
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// A payload failed to (de)serialize.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The counter went negative or the applied set is inconsistent.
    /// Should be impossible under the atomic counter op.
    #[error("integrity violation on run {run_id}: {reason}")]
    Integrity {
        /// The affected run.
        run_id: Uuid,
        /// What was observed.
        reason: String,
    },

    /// A patch overlay referenced a run that does not exist.
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// The recompiled workflow failed validation.
    #[error(transparent)]
    Ir(#[from] wfk_ir::IrError),

    /// A run patch was rejected by the strict connectivity validator.
    #[error("patch rejected for run {run_id}: {reason}")]
    Rejected {
        /// The affected run.
        run_id: Uuid,
        /// Why the patch was refused.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Settings for the coordinator loop.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Consumer group on `wf.completion_signals`.
    pub group: String,

    /// Consumer name within the group.
    pub consumer: String,

    /// Stream read block timeout.
    pub block_timeout: Duration,

    /// Publish `node_failed` events for failed completions.
    pub emit_node_failed: bool,

    /// TTL applied when the patch overlay rewrites the IR.
    pub ir_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            group: "coordinator".to_string(),
            consumer: "coordinator-0".to_string(),
            block_timeout: Duration::from_secs(5),
            emit_node_failed: false,
            ir_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// The execution coordinator.
pub struct Coordinator {
    store: Arc<dyn Backplane>,
    catalog: Arc<Catalog>,
    config: CoordinatorConfig,
}

impl Coordinator {
    /// Create a coordinator over the shared backplane and catalog.
    pub fn new(store: Arc<dyn Backplane>, catalog: Arc<Catalog>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            catalog,
            config,
        }
    }

    /// Consume completion signals until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Store`] when the stream read fails.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), CoordinatorError> {
        info!(target: "wfk.coordinator", group = %self.config.group, "coordinator loop started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(target: "wfk.coordinator", "coordinator loop stopped");
                    return Ok(());
                }
                polled = self.poll_once() => {
                    polled?;
                }
            }
        }
    }

    /// Process at most one completion signal. Returns `true` when a
    /// message was handled.
    ///
    /// # Errors
    ///
    /// Transient store failures only; the message stays pending.
    pub async fn poll_once(&self) -> Result<bool, CoordinatorError> {
        let Some(message) = self
            .store
            .read_group(
                keys::streams::COMPLETION_SIGNALS,
                &self.config.group,
                &self.config.consumer,
                self.config.block_timeout,
            )
            .await?
        else {
            return Ok(false);
        };

        match serde_json::from_value::<CompletionSignal>(message.payload.clone()) {
            Ok(signal) => match self.process_signal(&signal).await {
                Ok(()) => {}
                Err(CoordinatorError::Integrity { run_id, reason }) => {
                    // Fatal for the run, not for the coordinator.
                    error!(target: "wfk.coordinator", %run_id, reason, "integrity violation");
                    self.fail_run(run_id, &format!("integrity violation: {reason}"))
                        .await?;
                }
                Err(err) => return Err(err),
            },
            Err(err) => {
                warn!(target: "wfk.coordinator", error = %err, "dropping malformed completion signal");
            }
        }

        self.store
            .ack(
                keys::streams::COMPLETION_SIGNALS,
                &self.config.group,
                message.id,
            )
            .await?;
        Ok(true)
    }

    /// Apply one completion signal to its run.
    ///
    /// Replaying a processed signal is a no-op: every counter-advancing
    /// step is guarded by the run's applied op-key set.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::Integrity`] on a negative counter; store and
    /// catalog failures otherwise.
    pub async fn process_signal(&self, signal: &CompletionSignal) -> Result<(), CoordinatorError> {
        let run_id = signal.run_id;

        let Some(mut record) = self
            .store
            .get_json::<RunRecord>(&keys::run_record(run_id))
            .await?
        else {
            warn!(target: "wfk.coordinator", %run_id, "signal for unknown run dropped");
            return Ok(());
        };

        if signal.status == SignalStatus::Cancelled {
            self.cleanup_run_keys(run_id).await?;
            debug!(target: "wfk.coordinator", %run_id, "cancel marker processed, volatile keys dropped");
            return Ok(());
        }

        if record.status.is_terminal() {
            // Cancelled/completed runs let straggler work finish, but its
            // completions are discarded.
            debug!(target: "wfk.coordinator", %run_id, status = ?record.status, "signal for terminal run discarded");
            return Ok(());
        }

        // Duplicate completion signals are filtered by the op-key set: a
        // consume key already applied means this signal fully processed.
        let from_node = signal.metadata.from_node.clone().unwrap_or_default();
        let consume_key = keys::consume_op(run_id, &from_node, &signal.node_id, &signal.job_id);
        if self.store.counter_applied(run_id, &consume_key).await? {
            debug!(target: "wfk.coordinator", %run_id, node = %signal.node_id, "duplicate completion signal filtered");
            return Ok(());
        }

        if record.status == RunStatus::Queued {
            record.status = RunStatus::Running;
        }
        record.last_event_at = Utc::now();
        self.store
            .set_json(&keys::run_record(run_id), &record, None)
            .await?;
        self.store
            .set_json(&keys::run_status(run_id), &record.status, None)
            .await?;

        // Always re-read: the IR may have been patched mid-run.
        let Some(ir) = self.store.get_json::<Ir>(&keys::ir(run_id)).await? else {
            warn!(target: "wfk.coordinator", %run_id, "signal without IR dropped");
            return Ok(());
        };

        self.store
            .set_json(
                &keys::node_status(run_id, &signal.node_id),
                &signal.status,
                None,
            )
            .await?;
        self.store
            .hash_set(
                &keys::context(run_id),
                &signal.node_id,
                signal
                    .result_ref
                    .as_ref()
                    .map_or(Value::Null, |r| json!(r.as_str())),
            )
            .await?;

        let successors = match ir.node(&signal.node_id) {
            Some(node) => self.derive_successors(node, signal).await?,
            None => {
                // Graph drift: a patch removed the node after its token was
                // emitted. Consume the token and terminate the path.
                warn!(target: "wfk.coordinator", %run_id, node = %signal.node_id, "signal for unknown node");
                Vec::new()
            }
        };

        // Emissions first; the consume comes last so the counter cannot
        // transit zero while successors are still owed.
        for successor_id in &successors {
            let Some(successor) = ir.node(successor_id) else {
                warn!(target: "wfk.coordinator", %run_id, node = %successor_id, "successor missing from IR, path terminated");
                continue;
            };
            if successor.is_join() && !self.join_ready(run_id, signal, successor).await? {
                debug!(target: "wfk.coordinator", %run_id, join = %successor_id, "join arrival buffered");
                continue;
            }
            self.emit_token(&record, signal, successor).await?;
        }

        let consume = self.store.counter_apply(run_id, &consume_key, -1).await?;
        if consume.counter < 0 {
            return Err(CoordinatorError::Integrity {
                run_id,
                reason: format!("counter {} after consume", consume.counter),
            });
        }

        self.publish_event(
            &record.owner,
            WorkflowEvent::now(
                run_id,
                WorkflowEventKind::NodeCompleted {
                    node_id: signal.node_id.clone(),
                    status: signal.status,
                    counter: consume.counter,
                },
            ),
        )
        .await?;

        if signal.status == SignalStatus::Failed && self.config.emit_node_failed {
            self.publish_event(
                &record.owner,
                WorkflowEvent::now(
                    run_id,
                    WorkflowEventKind::NodeFailed {
                        node_id: signal.node_id.clone(),
                        error_type: signal
                            .metadata
                            .error_type
                            .clone()
                            .unwrap_or_else(|| ErrorKind::Worker.as_str().to_string()),
                    },
                ),
            )
            .await?;
        }

        if consume.reached_zero && consume.applied {
            self.complete_run(&mut record).await?;
        }
        Ok(())
    }

    // -- successor derivation ---------------------------------------------

    async fn derive_successors(
        &self,
        node: &IrNode,
        signal: &CompletionSignal,
    ) -> Result<Vec<String>, CoordinatorError> {
        if signal.status == SignalStatus::Failed {
            // The path terminates on the failing node; the error already
            // lives in the result blob.
            return Ok(Vec::new());
        }

        if let Some(spec) = &node.loop_spec {
            return self.loop_successors(signal, node, spec).await;
        }

        if let Some(branch) = &node.branch {
            return self.branch_successors(signal, node, branch).await;
        }

        if node.is_terminal {
            return Ok(Vec::new());
        }

        Ok(node.dependents.clone())
    }

    async fn branch_successors(
        &self,
        signal: &CompletionSignal,
        node: &IrNode,
        branch: &wfk_ir::BranchSpec,
    ) -> Result<Vec<String>, CoordinatorError> {
        let result = self.result_document(signal).await?;
        for rule in &branch.rules {
            match wfk_expr::evaluate_str(&rule.when, &result) {
                Ok(true) => return Ok(rule.next_nodes.clone()),
                Ok(false) => {}
                Err(err) => {
                    // An evaluation error fails this path, not the run.
                    warn!(
                        target: "wfk.coordinator",
                        run_id = %signal.run_id,
                        node = %node.id,
                        rule = %rule.when,
                        error = %err,
                        "branch rule evaluation failed, path terminated"
                    );
                    return Ok(Vec::new());
                }
            }
        }
        // No match and an empty default is a path termination, not an error.
        Ok(branch.default.clone())
    }

    async fn loop_successors(
        &self,
        signal: &CompletionSignal,
        node: &IrNode,
        spec: &wfk_ir::LoopSpec,
    ) -> Result<Vec<String>, CoordinatorError> {
        let run_id = signal.run_id;
        let state_key = keys::loop_state(run_id, &node.id);
        let iteration = self
            .store
            .hash_get(&state_key, "current_iteration")
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        if self
            .store
            .hash_get(&state_key, "started_at")
            .await?
            .is_none()
        {
            self.store
                .hash_set(&state_key, "started_at", json!(Utc::now().to_rfc3339()))
                .await?;
            self.store
                .hash_set(&state_key, "max_iterations", json!(spec.max_iterations))
                .await?;
        }
        self.store
            .hash_set(
                &state_key,
                "last_output_ref",
                signal
                    .result_ref
                    .as_ref()
                    .map_or(Value::Null, |r| json!(r.as_str())),
            )
            .await?;

        if iteration >= u64::from(spec.max_iterations) {
            self.store
                .hash_set(&state_key, "status", json!("timeout"))
                .await?;
            debug!(target: "wfk.coordinator", %run_id, node = %node.id, iteration, "loop budget exhausted");
            return Ok(spec.timeout_path.clone());
        }

        let result = self.result_document(signal).await?;
        match wfk_expr::evaluate_str(&spec.condition, &result) {
            Ok(true) => {
                self.store
                    .hash_set(&state_key, "current_iteration", json!(iteration + 1))
                    .await?;
                self.store
                    .hash_set(&state_key, "status", json!("iterating"))
                    .await?;
                debug!(target: "wfk.coordinator", %run_id, node = %node.id, iteration = iteration + 1, "loop re-entry");
                Ok(vec![spec.loop_back_to.clone()])
            }
            Ok(false) => {
                self.store
                    .hash_set(&state_key, "status", json!("completed"))
                    .await?;
                Ok(spec.break_path.clone())
            }
            Err(err) => {
                warn!(
                    target: "wfk.coordinator",
                    %run_id,
                    node = %node.id,
                    error = %err,
                    "loop condition evaluation failed, path terminated"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Record this predecessor's arrival at a join and report whether the
    /// join is now complete (clearing the buffer when it is).
    async fn join_ready(
        &self,
        run_id: Uuid,
        signal: &CompletionSignal,
        join: &IrNode,
    ) -> Result<bool, CoordinatorError> {
        let key = keys::pending_tokens(run_id, &join.id);
        self.store
            .hash_set(&key, &signal.node_id, json!(signal.job_id))
            .await?;
        let arrived = self.store.hash_get_all(&key).await?;
        let complete = join
            .dependencies
            .iter()
            .all(|dep| arrived.contains_key(dep));
        if complete {
            self.store.hash_delete(&key).await?;
        }
        Ok(complete)
    }

    // -- token emission ---------------------------------------------------

    async fn emit_token(
        &self,
        record: &RunRecord,
        signal: &CompletionSignal,
        successor: &IrNode,
    ) -> Result<(), CoordinatorError> {
        let run_id = signal.run_id;
        let config = self.resolve_config(&successor.config).await?;
        let config = self.interpolate(run_id, config).await?;

        let mut metadata: BTreeMap<String, Value> = record.inputs.clone();
        if let Some(task) = config.get("task").and_then(Value::as_object) {
            for (k, v) in task {
                metadata.insert(k.clone(), v.clone());
            }
        }

        let mut token = Token::new(run_id, signal.node_id.clone(), successor.id.clone())
            .with_config(match &config {
                Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                Value::Null => BTreeMap::new(),
                other => BTreeMap::from([("value".to_string(), other.clone())]),
            })
            .with_metadata(metadata);
        // Derived, not random: a replayed signal re-emits under the same
        // emit op-keys instead of minting fresh ones.
        token.id = derived_token_id(run_id, &signal.job_id, &successor.id);

        self.store
            .append(&successor.kind.task_stream(), serde_json::to_value(&token)?)
            .await?;
        self.store
            .counter_apply(run_id, &keys::emit_op(run_id, &successor.id, &token.id), 1)
            .await?;
        debug!(
            target: "wfk.coordinator",
            %run_id,
            from = %signal.node_id,
            to = %successor.id,
            token = %token.id,
            "token emitted"
        );
        Ok(())
    }

    async fn resolve_config(&self, source: &ConfigSource) -> Result<Value, CoordinatorError> {
        match source {
            ConfigSource::Inline { value } => Ok(value.clone()),
            ConfigSource::Blob { cas_id } => Ok(self.catalog.blob_json(cas_id).await?),
        }
    }

    /// Replace `{{node.<id>}}` string placeholders in a config with that
    /// node's recorded result document.
    async fn interpolate(&self, run_id: Uuid, config: Value) -> Result<Value, CoordinatorError> {
        match config {
            Value::String(s) => {
                if let Some(node_id) = s
                    .strip_prefix("{{node.")
                    .and_then(|rest| rest.strip_suffix("}}"))
                {
                    return Ok(self
                        .node_result(run_id, node_id)
                        .await?
                        .unwrap_or(Value::Null));
                }
                Ok(Value::String(s))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Box::pin(self.interpolate(run_id, item)).await?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, Box::pin(self.interpolate(run_id, v)).await?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other),
        }
    }

    async fn node_result(
        &self,
        run_id: Uuid,
        node_id: &str,
    ) -> Result<Option<Value>, CoordinatorError> {
        let Some(result_ref) = self
            .store
            .hash_get(&keys::context(run_id), node_id)
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
        else {
            return Ok(None);
        };
        let Ok(cas) = CasId::parse(&result_ref) else {
            return Ok(None);
        };
        Ok(Some(self.catalog.blob_json(&cas).await?))
    }

    async fn result_document(&self, signal: &CompletionSignal) -> Result<Value, CoordinatorError> {
        match &signal.result_ref {
            Some(cas) => Ok(self.catalog.blob_json(cas).await?),
            None => Ok(Value::Null),
        }
    }

    // -- run lifecycle ----------------------------------------------------

    async fn complete_run(&self, record: &mut RunRecord) -> Result<(), CoordinatorError> {
        record.status = RunStatus::Completed;
        record.ended_at = Some(Utc::now());
        self.store
            .set_json(&keys::run_record(record.run_id), record, None)
            .await?;
        self.store
            .set_json(&keys::run_status(record.run_id), &record.status, None)
            .await?;
        self.publish_event(
            &record.owner,
            WorkflowEvent::now(record.run_id, WorkflowEventKind::WorkflowCompleted {}),
        )
        .await?;
        self.cleanup_run_keys(record.run_id).await?;
        info!(target: "wfk.coordinator", run_id = %record.run_id, "run completed");
        Ok(())
    }

    /// Mark a run failed and clean up, publishing `workflow_failed`.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn fail_run(&self, run_id: Uuid, reason: &str) -> Result<(), CoordinatorError> {
        let Some(mut record) = self
            .store
            .get_json::<RunRecord>(&keys::run_record(run_id))
            .await?
        else {
            return Ok(());
        };
        record.status = RunStatus::Failed;
        record.ended_at = Some(Utc::now());
        record.failure_reason = Some(reason.to_string());
        self.store
            .set_json(&keys::run_record(run_id), &record, None)
            .await?;
        self.store
            .set_json(&keys::run_status(run_id), &record.status, None)
            .await?;
        self.publish_event(
            &record.owner,
            WorkflowEvent::now(
                run_id,
                WorkflowEventKind::WorkflowFailed {
                    reason: reason.to_string(),
                },
            ),
        )
        .await?;
        self.cleanup_run_keys(run_id).await?;
        Ok(())
    }

    /// Cancel a run: flip its status and push the synthetic cancel marker
    /// so the coordinator drains and cleans up in stream order.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<(), CoordinatorError> {
        let Some(mut record) = self
            .store
            .get_json::<RunRecord>(&keys::run_record(run_id))
            .await?
        else {
            return Ok(());
        };
        if record.status.is_terminal() {
            return Ok(());
        }
        record.status = RunStatus::Cancelled;
        record.ended_at = Some(Utc::now());
        self.store
            .set_json(&keys::run_record(run_id), &record, None)
            .await?;
        self.store
            .set_json(&keys::run_status(run_id), &record.status, None)
            .await?;

        let marker = CompletionSignal {
            version: wfk_core::CONTRACT_VERSION.to_string(),
            job_id: "cancel".to_string(),
            run_id,
            node_id: String::new(),
            status: SignalStatus::Cancelled,
            result_ref: None,
            metadata: wfk_core::SignalMetadata::default(),
        };
        self.store
            .append(
                keys::streams::COMPLETION_SIGNALS,
                serde_json::to_value(&marker)?,
            )
            .await?;
        info!(target: "wfk.coordinator", %run_id, "run cancelled");
        Ok(())
    }

    /// Delete a run's volatile keys: IR, counter, applied set, loop state,
    /// pending-token hashes, and interpolation context.
    async fn cleanup_run_keys(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.store.kv_delete(&keys::ir(run_id)).await?;
        self.store.counter_clear(run_id).await?;
        self.store.hash_delete(&keys::context(run_id)).await?;
        for prefix in [
            format!("loop:{run_id}:"),
            format!("pending_tokens:{run_id}:"),
        ] {
            for key in self.store.hash_scan(&prefix).await? {
                self.store.hash_delete(&key).await?;
            }
        }
        Ok(())
    }

    async fn publish_event(&self, owner: &str, event: WorkflowEvent) -> Result<(), StoreError> {
        self.store
            .publish(
                &keys::events_channel(owner),
                serde_json::to_value(&event).map_err(StoreError::from)?,
            )
            .await
            .map(|_| ())
    }
}

/// Token id for an emission, derived from the consumed signal and the
/// successor so repeats collide on the same emit op-key.
fn derived_token_id(run_id: Uuid, job_id: &str, successor: &str) -> String {
    let digest = wfk_core::sha256_hex(format!("{run_id}:{job_id}:{successor}").as_bytes());
    digest[..wfk_core::TOKEN_ID_LEN].to_string()
}
