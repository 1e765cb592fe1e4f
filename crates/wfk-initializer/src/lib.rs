// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run initializer: turns accepted run requests into live runs.
//!
//! Consumes `wf.run.requests`, resolves the tag or artifact, materializes
//! the workflow, compiles it to the per-run IR, seeds the pending counter
//! with the entry-node count, and emits one token per entry node. Every
//! step is idempotent under redelivery: a scoped one-shot mark guards the
//! whole sequence.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use wfk_catalog::{Catalog, CatalogError};
use wfk_core::event::{WorkflowEvent, WorkflowEventKind};
use wfk_core::{BaseRef, MediaType, RunRecord, RunRequest, RunStatus, Token, keys};
use wfk_ir::{ConfigSource, Ir, IrError, IrMetadata};
use wfk_store::{Backplane, CancellationToken, StoreError, StoreExt};

/// Default TTL for the IR and the run-started mark.
const DEFAULT_IR_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default cutoff above which node configs move to the blob store.
const DEFAULT_INLINE_CONFIG_LIMIT: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from run initialization.
#[derive(Debug, thiserror::Error)]
pub enum InitializerError {
    /// Resolution or materialization failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The workflow failed structural validation.
    #[error(transparent)]
    Validation(#[from] IrError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The run request payload could not be parsed.
    #[error("malformed run request: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl InitializerError {
    /// `true` for failures redelivery cannot fix; such requests are
    /// rejected, recorded, and acknowledged.
    fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Malformed(_)
                | Self::Catalog(CatalogError::NotFound { .. })
                | Self::Catalog(CatalogError::PatchApply { .. })
        )
    }
}

// ---------------------------------------------------------------------------
// Initializer
// ---------------------------------------------------------------------------

/// Settings for the initializer loop.
#[derive(Debug, Clone)]
pub struct InitializerConfig {
    /// Consumer group on `wf.run.requests`.
    pub group: String,

    /// Consumer name within the group.
    pub consumer: String,

    /// Stream read block timeout.
    pub block_timeout: Duration,

    /// TTL for the IR and idempotency mark.
    pub ir_ttl: Duration,

    /// Configs serializing larger than this move to the blob store.
    pub inline_config_limit: usize,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            group: "initializer".to_string(),
            consumer: "initializer-0".to_string(),
            block_timeout: Duration::from_secs(5),
            ir_ttl: DEFAULT_IR_TTL,
            inline_config_limit: DEFAULT_INLINE_CONFIG_LIMIT,
        }
    }
}

/// The run initializer service.
pub struct Initializer {
    store: Arc<dyn Backplane>,
    catalog: Arc<Catalog>,
    config: InitializerConfig,
}

impl Initializer {
    /// Create an initializer over the shared backplane and catalog.
    pub fn new(
        store: Arc<dyn Backplane>,
        catalog: Arc<Catalog>,
        config: InitializerConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            config,
        }
    }

    /// Consume run requests until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`InitializerError::Store`] when the stream read fails.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), InitializerError> {
        info!(target: "wfk.initializer", group = %self.config.group, "initializer loop started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(target: "wfk.initializer", "initializer loop stopped");
                    return Ok(());
                }
                polled = self.poll_once() => {
                    polled?;
                }
            }
        }
    }

    /// Process at most one run request. Returns `true` when a message was
    /// handled (successfully or by permanent rejection).
    ///
    /// # Errors
    ///
    /// Transient store failures only; the message stays pending and is
    /// redelivered.
    pub async fn poll_once(&self) -> Result<bool, InitializerError> {
        let Some(message) = self
            .store
            .read_group(
                keys::streams::RUN_REQUESTS,
                &self.config.group,
                &self.config.consumer,
                self.config.block_timeout,
            )
            .await?
        else {
            return Ok(false);
        };

        let outcome: Result<(), InitializerError> = async {
            let request: RunRequest = serde_json::from_value(message.payload.clone())?;
            self.handle_request(&request).await
        }
        .await;

        match outcome {
            Ok(()) => {
                self.store
                    .ack(keys::streams::RUN_REQUESTS, &self.config.group, message.id)
                    .await?;
                Ok(true)
            }
            Err(err) if err.is_permanent() => {
                warn!(target: "wfk.initializer", error = %err, "run request rejected");
                self.reject(&message.payload, &err).await?;
                self.store
                    .ack(keys::streams::RUN_REQUESTS, &self.config.group, message.id)
                    .await?;
                Ok(true)
            }
            Err(err) => {
                warn!(target: "wfk.initializer", error = %err, "run request deferred for redelivery");
                Err(err)
            }
        }
    }

    /// Initialize one run end-to-end.
    ///
    /// # Errors
    ///
    /// Any resolution, validation, or store failure. Failures before the
    /// idempotency mark commits are safe to replay.
    pub async fn handle_request(&self, request: &RunRequest) -> Result<(), InitializerError> {
        // Scoped one-shot: redelivered requests drop here.
        let fresh = self
            .store
            .kv_set_nx(
                &keys::run_started(request.run_id),
                json!(true),
                Some(self.config.ir_ttl),
            )
            .await?;
        if !fresh {
            debug!(target: "wfk.initializer", run_id = %request.run_id, "duplicate run request dropped");
            return Ok(());
        }

        // Resolve the base workflow. Run-patches accumulated later are
        // applied by the coordinator's patch overlay, not here.
        let (tag_name, tag_snapshot, base, chain) = match &request.base {
            BaseRef::Tag { name } => {
                let (base, chain) = self.catalog.resolve_tag(&request.owner, name).await?;
                let tag = self.catalog.tag(&request.owner, name).await?;
                let snapshot = BTreeMap::from([(name.clone(), tag.target_id)]);
                (name.clone(), snapshot, base, chain)
            }
            BaseRef::Artifact { id } => {
                let (base, chain) = self.catalog.resolve_artifact(*id).await?;
                (String::new(), BTreeMap::new(), base, chain)
            }
        };

        let (doc, _snapshot_id) = self
            .catalog
            .materialize_cached(&base, &chain, &request.owner)
            .await?;

        let metadata = IrMetadata {
            owner: request.owner.clone(),
            tag: tag_name.clone(),
        };
        let mut ir = wfk_ir::compile_value(&doc, metadata)?;
        self.externalize_large_configs(&mut ir).await?;

        self.store
            .set_json(&keys::ir(request.run_id), &ir, Some(self.config.ir_ttl))
            .await?;

        let entries: Vec<String> = ir.entry_nodes().iter().map(|n| n.id.clone()).collect();
        self.store
            .counter_apply(
                request.run_id,
                &keys::init_op(request.run_id),
                entries.len() as i64,
            )
            .await?;

        let record = RunRecord {
            run_id: request.run_id,
            submitted_at: request.created_at,
            base: request.base.clone(),
            status: RunStatus::Queued,
            owner: request.owner.clone(),
            inputs: request.inputs.clone(),
            tag_snapshot,
            last_event_at: Utc::now(),
            ended_at: None,
            failure_reason: None,
        };
        self.store
            .set_json(&keys::run_record(request.run_id), &record, None)
            .await?;
        self.store
            .set_json(&keys::run_status(request.run_id), &record.status, None)
            .await?;

        for node_id in &entries {
            let node = ir.node(node_id).ok_or_else(|| {
                // entry_nodes() only returns existing ids
                StoreError::Backend(format!("entry node {node_id} vanished from IR"))
            })?;
            let config = self.resolve_config(&node.config).await?;
            let token = Token::new(request.run_id, "", node_id.clone())
                .with_config(as_config_map(&config))
                .with_metadata(merged_metadata(&request.inputs, &config));
            self.store
                .append(&node.kind.task_stream(), serde_json::to_value(&token)?)
                .await?;
            debug!(target: "wfk.initializer", run_id = %request.run_id, node = %node_id, token = %token.id, "entry token emitted");
        }

        self.publish_event(
            &request.owner,
            WorkflowEvent::now(
                request.run_id,
                WorkflowEventKind::WorkflowStarted { tag: tag_name },
            ),
        )
        .await?;

        info!(target: "wfk.initializer", run_id = %request.run_id, entries = entries.len(), "run initialized");
        Ok(())
    }

    /// Record a permanent rejection so the submitting surface can observe it.
    async fn reject(&self, payload: &Value, err: &InitializerError) -> Result<(), StoreError> {
        let Ok(request) = serde_json::from_value::<RunRequest>(payload.clone()) else {
            return Ok(());
        };
        let record = RunRecord {
            run_id: request.run_id,
            submitted_at: request.created_at,
            base: request.base.clone(),
            status: RunStatus::Failed,
            owner: request.owner.clone(),
            inputs: request.inputs,
            tag_snapshot: BTreeMap::new(),
            last_event_at: Utc::now(),
            ended_at: Some(Utc::now()),
            failure_reason: Some(err.to_string()),
        };
        self.store
            .set_json(&keys::run_record(request.run_id), &record, None)
            .await?;
        self.store
            .set_json(&keys::run_status(request.run_id), &record.status, None)
            .await?;
        self.publish_event(
            &request.owner,
            WorkflowEvent::now(
                request.run_id,
                WorkflowEventKind::WorkflowFailed {
                    reason: err.to_string(),
                },
            ),
        )
        .await
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

    async fn externalize_large_configs(&self, ir: &mut Ir) -> Result<(), InitializerError> {
        for node_id in ir.oversized_configs(self.config.inline_config_limit) {
            let Some(node) = ir.node(&node_id) else { continue };
            let ConfigSource::Inline { value } = &node.config else {
                continue;
            };
            let bytes = serde_json::to_vec(value)?;
            let cas = self.catalog.put_blob(&bytes, MediaType::NodeConfig).await?;
            ir.externalize_config(&node_id, cas);
        }
        Ok(())
    }

    async fn resolve_config(&self, source: &ConfigSource) -> Result<Value, InitializerError> {
        match source {
            ConfigSource::Inline { value } => Ok(value.clone()),
            ConfigSource::Blob { cas_id } => Ok(self.catalog.blob_json(cas_id).await?),
        }
    }
}

/// Flatten a config value into the token's config map.
fn as_config_map(config: &Value) -> BTreeMap<String, Value> {
    match config {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Null => BTreeMap::new(),
        other => BTreeMap::from([("value".to_string(), other.clone())]),
    }
}

/// Run inputs merged with the node config's `task` block (task wins).
fn merged_metadata(
    inputs: &BTreeMap<String, Value>,
    config: &Value,
) -> BTreeMap<String, Value> {
    let mut metadata = inputs.clone();
    if let Some(task) = config.get("task").and_then(Value::as_object) {
        for (k, v) in task {
            metadata.insert(k.clone(), v.clone());
        }
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_map_flattens_objects() {
        let map = as_config_map(&json!({"url": "https://x", "n": 2}));
        assert_eq!(map.len(), 2);
        assert_eq!(map["url"], json!("https://x"));
        assert!(as_config_map(&Value::Null).is_empty());
        assert_eq!(as_config_map(&json!(7))["value"], json!(7));
    }

    #[test]
    fn task_block_overrides_inputs() {
        let inputs = BTreeMap::from([
            ("region".to_string(), json!("eu")),
            ("attempts".to_string(), json!(1)),
        ]);
        let config = json!({"task": {"attempts": 3}});
        let merged = merged_metadata(&inputs, &config);
        assert_eq!(merged["region"], json!("eu"));
        assert_eq!(merged["attempts"], json!(3));
    }
}
