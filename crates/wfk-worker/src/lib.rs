// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared worker runtime.
//!
//! Every worker type follows the same loop: read one token with a block
//! timeout, resolve its config (embedded preferred, IR/blob fallback),
//! invoke the type-specific [`NodeExecutor`] under a wall-clock deadline,
//! persist the result as a blob, emit a completion signal, and ACK.
//! Executor failures become failed completion signals, never panics — a
//! failed node terminates its path, not the process.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Built-in executors (function/transform and HTTP).
pub mod executors;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use wfk_catalog::{Catalog, CatalogError};
use wfk_core::error::ErrorKind;
use wfk_core::{CompletionSignal, MediaType, Token, keys};
use wfk_ir::{ConfigSource, Ir};
use wfk_store::{Backplane, CancellationToken, StoreError, StoreExt};

// ---------------------------------------------------------------------------
// Executor seam
// ---------------------------------------------------------------------------

/// A type-specific node executor.
///
/// Implementations perform the node's business logic and return its result
/// document. Errors are reported as failed completion signals; the worker
/// loop never unwinds on them.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Human-readable name used in tracing output.
    fn name(&self) -> &str;

    /// Execute one token and produce the node's result document.
    async fn execute(&self, token: &Token) -> AnyResult<Value>;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the worker loop itself (not from executors).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The store failed; the message stays pending for redelivery.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Result blob persistence failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// A payload failed to (de)serialize.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Settings for one worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Task stream to consume (e.g. `wf.tasks.http`).
    pub stream: String,

    /// Consumer group name.
    pub group: String,

    /// Consumer name within the group.
    pub consumer: String,

    /// Stream read block timeout.
    pub block_timeout: Duration,

    /// Wall-clock deadline per execution; a breach produces a failed
    /// signal with `error_type: timeout`.
    pub deadline: Duration,
}

impl WorkerConfig {
    /// Defaults for a given task stream: 30 s deadline, shared group.
    #[must_use]
    pub fn for_stream(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: "workers".to_string(),
            consumer: "worker-0".to_string(),
            block_timeout: Duration::from_secs(5),
            deadline: Duration::from_secs(30),
        }
    }
}

/// The shared worker skeleton wrapping one [`NodeExecutor`].
pub struct Worker {
    store: Arc<dyn Backplane>,
    catalog: Arc<Catalog>,
    executor: Arc<dyn NodeExecutor>,
    config: WorkerConfig,
}

impl Worker {
    /// Create a worker over the shared backplane and catalog.
    pub fn new(
        store: Arc<dyn Backplane>,
        catalog: Arc<Catalog>,
        executor: Arc<dyn NodeExecutor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            executor,
            config,
        }
    }

    /// Consume tokens until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Store`] when the stream read fails.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        info!(
            target: "wfk.worker",
            stream = %self.config.stream,
            executor = %self.executor.name(),
            "worker loop started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(target: "wfk.worker", stream = %self.config.stream, "worker loop stopped");
                    return Ok(());
                }
                polled = self.poll_once() => {
                    polled?;
                }
            }
        }
    }

    /// Handle at most one token. Returns `true` when a message was handled.
    ///
    /// # Errors
    ///
    /// Transient store failures only; business failures are signalled and
    /// acknowledged.
    pub async fn poll_once(&self) -> Result<bool, WorkerError> {
        let Some(message) = self
            .store
            .read_group(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                self.config.block_timeout,
            )
            .await?
        else {
            return Ok(false);
        };

        match serde_json::from_value::<Token>(message.payload.clone()) {
            Ok(token) => self.handle_token(&token).await?,
            Err(err) => {
                warn!(target: "wfk.worker", stream = %self.config.stream, error = %err, "dropping malformed token");
            }
        }

        self.store
            .ack(&self.config.stream, &self.config.group, message.id)
            .await?;
        Ok(true)
    }

    /// Execute one token and publish its completion signal.
    ///
    /// # Errors
    ///
    /// Store/catalog failures only.
    pub async fn handle_token(&self, token: &Token) -> Result<(), WorkerError> {
        let picked_up = Utc::now();
        let queue_time_ms = (picked_up - token.sent_at).num_milliseconds().max(0) as u64;

        let token = self.with_resolved_config(token.clone()).await?;
        let started = std::time::Instant::now();

        let outcome = tokio::time::timeout(self.config.deadline, self.executor.execute(&token)).await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let mut signal = match outcome {
            Ok(Ok(result)) => {
                let blob = self
                    .catalog
                    .put_blob(&serde_json::to_vec(&result)?, MediaType::NodeResult)
                    .await?;
                debug!(
                    target: "wfk.worker",
                    run_id = %token.run_id,
                    node = %token.to_node,
                    execution_time_ms,
                    "execution completed"
                );
                CompletionSignal::completed(&token, Some(blob))
            }
            Ok(Err(err)) => {
                warn!(
                    target: "wfk.worker",
                    run_id = %token.run_id,
                    node = %token.to_node,
                    error = %err,
                    "execution failed"
                );
                let blob = self
                    .error_blob(&err.to_string(), execution_time_ms, queue_time_ms)
                    .await?;
                CompletionSignal::failed(&token, ErrorKind::Worker.as_str(), Some(blob))
            }
            Err(_) => {
                warn!(
                    target: "wfk.worker",
                    run_id = %token.run_id,
                    node = %token.to_node,
                    deadline_ms = self.config.deadline.as_millis() as u64,
                    "execution deadline breached"
                );
                let blob = self
                    .error_blob("execution deadline breached", execution_time_ms, queue_time_ms)
                    .await?;
                CompletionSignal::failed(&token, ErrorKind::Timeout.as_str(), Some(blob))
            }
        };
        signal.metadata.execution_time_ms = execution_time_ms;
        signal.metadata.queue_time_ms = queue_time_ms;

        self.store
            .append(
                keys::streams::COMPLETION_SIGNALS,
                serde_json::to_value(&signal)?,
            )
            .await?;
        Ok(())
    }

    /// Prefer the token's embedded config; fall back to the IR (and blob
    /// store) when the emitter left it empty.
    async fn with_resolved_config(&self, mut token: Token) -> Result<Token, WorkerError> {
        if !token.config.is_empty() {
            return Ok(token);
        }
        let Some(ir) = self
            .store
            .get_json::<Ir>(&keys::ir(token.run_id))
            .await?
        else {
            return Ok(token);
        };
        let Some(node) = ir.node(&token.to_node) else {
            return Ok(token);
        };
        let value = match &node.config {
            ConfigSource::Inline { value } => value.clone(),
            ConfigSource::Blob { cas_id } => match self.catalog.blob_json(cas_id).await {
                Ok(v) => v,
                Err(err) => {
                    warn!(target: "wfk.worker", error = %err, "config blob unavailable");
                    Value::Null
                }
            },
        };
        if let Value::Object(map) = value {
            token.config = map.into_iter().collect::<BTreeMap<_, _>>();
        }
        Ok(token)
    }

    async fn error_blob(
        &self,
        message: &str,
        execution_time_ms: u64,
        queue_time_ms: u64,
    ) -> Result<wfk_core::CasId, WorkerError> {
        let payload = json!({
            "error": message,
            "metrics": {
                "execution_time_ms": execution_time_ms,
                "queue_time_ms": queue_time_ms,
            },
        });
        Ok(self
            .catalog
            .put_blob(&serde_json::to_vec(&payload)?, MediaType::NodeResult)
            .await?)
    }
}
