// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! wfk-hitl
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use wfk_catalog::{Catalog, CatalogError};
use wfk_core::event::{WorkflowEvent, WorkflowEventKind};
use wfk_core::{
    CompletionSignal, HitlDecision, MediaType, RunRecord, RunStatus, SignalStatus, Token, keys,
};
use wfk_ir::Ir;
use wfk_store::{Backplane, CancellationToken, StoreError, StoreExt};

/// Default TTL on approval records.
const DEFAULT_APPROVAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Lifecycle of one approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a human decision.
    Pending,
    /// Approved.
    Approved,
    /// Rejected.
    Rejected,
}

/// Durable state of a parked HITL token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalRecord {
    /// Current lifecycle state.
    pub status: ApprovalStatus,

    /// Id of the parked token; becomes the synthetic signal's `job_id`.
    pub token_id: String,

    /// Node the parked token came from, for the consume op-key.
    #[serde(default)]
    pub from_node: String,

    /// Run owner.
    pub owner: String,

    /// Workflow tag the run executes under.
    pub tag: String,

    /// Prompt shown to the approver.
    pub message: String,

    /// When the request was parked.
    pub created_at: DateTime<Utc>,

    /// When the decision was processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,

    /// Who decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,

    /// Approver's comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the HITL workers.
#[derive(Debug, thiserror::Error)]
pub enum HitlError {
    /// The store failed; the message stays pending for redelivery.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Approval record blob persistence failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// A payload failed to (de)serialize.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Shared config
// ---------------------------------------------------------------------------

/// Settings shared by both HITL workers.
#[derive(Debug, Clone)]
pub struct HitlConfig {
    /// Consumer group name.
    pub group: String,

    /// Consumer name within the group.
    pub consumer: String,

    /// Stream read block timeout.
    pub block_timeout: Duration,

    /// TTL on approval records.
    pub approval_ttl: Duration,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            group: "hitl".to_string(),
            consumer: "hitl-0".to_string(),
            block_timeout: Duration::from_secs(5),
            approval_ttl: DEFAULT_APPROVAL_TTL,
        }
    }
}

// ---------------------------------------------------------------------------
// Request side
// ---------------------------------------------------------------------------

/// Consumer of `wf.tasks.hitl`: parks tokens as durable approval state.
pub struct HitlRequestWorker {
    store: Arc<dyn Backplane>,
    config: HitlConfig,
}

impl HitlRequestWorker {
    /// Create a request-side worker.
    pub fn new(store: Arc<dyn Backplane>, config: HitlConfig) -> Self {
        Self { store, config }
    }

    /// Consume HITL tokens until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::Store`] when the stream read fails.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), HitlError> {
        info!(target: "wfk.hitl", "request worker started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                polled = self.poll_once() => {
                    polled?;
                }
            }
        }
    }

    /// Handle at most one parked token.
    ///
    /// # Errors
    ///
    /// Transient store failures only.
    pub async fn poll_once(&self) -> Result<bool, HitlError> {
        let Some(message) = self
            .store
            .read_group(
                keys::streams::TASKS_HITL,
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
                warn!(target: "wfk.hitl", error = %err, "dropping malformed hitl token");
            }
        }

        self.store
            .ack(keys::streams::TASKS_HITL, &self.config.group, message.id)
            .await?;
        Ok(true)
    }

    /// Park one token. The token's lifecycle is owned by store state and
    /// the pending counters from here on; nothing blocks in memory.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn handle_token(&self, token: &Token) -> Result<(), HitlError> {
        let run_id = token.run_id;
        let (owner, tag) = self.run_identity(run_id).await?;

        let message_text = token
            .config
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("approval required")
            .to_string();

        let record = ApprovalRecord {
            status: ApprovalStatus::Pending,
            token_id: token.id.clone(),
            from_node: token.from_node.clone(),
            owner: owner.clone(),
            tag: tag.clone(),
            message: message_text.clone(),
            created_at: Utc::now(),
            processed_at: None,
            approved_by: None,
            comment: None,
        };

        // Counters first, SETNX second, compensate on loss — the same
        // shape a store-side transaction pipeline would use.
        let tag_key = keys::tag_pending_approvals(&owner, &tag);
        let run_key = keys::run_pending_approvals(run_id);
        self.store.incr(&tag_key, 1).await?;
        self.store.incr(&run_key, 1).await?;

        let won = self
            .store
            .kv_set_nx(
                &keys::hitl_approval(run_id, &token.to_node),
                serde_json::to_value(&record)?,
                Some(self.config.approval_ttl),
            )
            .await?;
        if !won {
            self.store.incr(&tag_key, -1).await?;
            self.store.incr(&run_key, -1).await?;
            debug!(target: "wfk.hitl", %run_id, node = %token.to_node, "duplicate approval request absorbed");
            return Ok(());
        }

        self.mark_waiting(run_id).await?;
        self.store
            .publish(
                &keys::events_channel(&owner),
                serde_json::to_value(&WorkflowEvent::now(
                    run_id,
                    WorkflowEventKind::ApprovalRequired {
                        node_id: token.to_node.clone(),
                        message: message_text,
                    },
                ))?,
            )
            .await?;
        info!(target: "wfk.hitl", %run_id, node = %token.to_node, "approval requested");
        Ok(())
    }

    async fn run_identity(&self, run_id: uuid::Uuid) -> Result<(String, String), HitlError> {
        if let Some(ir) = self.store.get_json::<Ir>(&keys::ir(run_id)).await? {
            return Ok((ir.metadata.owner, ir.metadata.tag));
        }
        if let Some(record) = self
            .store
            .get_json::<RunRecord>(&keys::run_record(run_id))
            .await?
        {
            return Ok((record.owner, String::new()));
        }
        Ok((String::new(), String::new()))
    }

    async fn mark_waiting(&self, run_id: uuid::Uuid) -> Result<(), StoreError> {
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
        record.status = RunStatus::WaitingForApproval;
        self.store
            .set_json(&keys::run_record(run_id), &record, None)
            .await?;
        self.store
            .set_json(&keys::run_status(run_id), &record.status, None)
            .await
    }
}

// ---------------------------------------------------------------------------
// Response side
// ---------------------------------------------------------------------------

/// Consumer of `wf.tasks.hitl.responses`: turns human decisions into
/// synthetic completion signals.
pub struct HitlResponseWorker {
    store: Arc<dyn Backplane>,
    catalog: Arc<Catalog>,
    config: HitlConfig,
}

impl HitlResponseWorker {
    /// Create a response-side worker.
    pub fn new(store: Arc<dyn Backplane>, catalog: Arc<Catalog>, config: HitlConfig) -> Self {
        Self {
            store,
            catalog,
            config,
        }
    }

    /// Consume decisions until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::Store`] when the stream read fails.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), HitlError> {
        info!(target: "wfk.hitl", "response worker started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                polled = self.poll_once() => {
                    polled?;
                }
            }
        }
    }

    /// Handle at most one decision.
    ///
    /// # Errors
    ///
    /// Transient store failures only.
    pub async fn poll_once(&self) -> Result<bool, HitlError> {
        let Some(message) = self
            .store
            .read_group(
                keys::streams::HITL_RESPONSES,
                &self.config.group,
                &self.config.consumer,
                self.config.block_timeout,
            )
            .await?
        else {
            return Ok(false);
        };

        match serde_json::from_value::<HitlDecision>(message.payload.clone()) {
            Ok(decision) => self.handle_decision(&decision).await?,
            Err(err) => {
                warn!(target: "wfk.hitl", error = %err, "dropping malformed decision");
            }
        }

        self.store
            .ack(keys::streams::HITL_RESPONSES, &self.config.group, message.id)
            .await?;
        Ok(true)
    }

    /// Resolve one approval.
    ///
    /// The synthetic completion publishes *before* the record update: if
    /// the update is lost, the redelivered decision finds the record still
    /// pending and replays — the coordinator's op-key set absorbs the
    /// duplicate completion, and the pending-counter decrements sit behind
    /// their own op-key so the replay cannot decrement twice.
    ///
    /// # Errors
    ///
    /// Store and blob failures only.
    pub async fn handle_decision(&self, decision: &HitlDecision) -> Result<(), HitlError> {
        let run_id = decision.run_id;
        let record_key = keys::hitl_approval(run_id, &decision.node_id);
        let Some(mut record) = self.store.get_json::<ApprovalRecord>(&record_key).await? else {
            warn!(target: "wfk.hitl", %run_id, node = %decision.node_id, "decision for unknown approval dropped");
            return Ok(());
        };
        if record.status != ApprovalStatus::Pending {
            debug!(target: "wfk.hitl", %run_id, node = %decision.node_id, "duplicate decision absorbed");
            return Ok(());
        }

        record.status = if decision.approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        record.processed_at = Some(Utc::now());
        record.approved_by = Some(decision.approved_by.clone());
        record.comment = decision.comment.clone();

        // The pending-status guard alone cannot make the decrements safe:
        // a decision redelivered after a crash (record still pending, but
        // counters already decremented) would decrement again. Gate the
        // pair on the run's applied op-key set — delta 0, membership only.
        let first_resolution = self
            .store
            .counter_apply(run_id, &keys::hitl_resolve_op(run_id, &decision.node_id), 0)
            .await?
            .applied;
        if first_resolution {
            self.store
                .incr(
                    &keys::tag_pending_approvals(&record.owner, &record.tag),
                    -1,
                )
                .await?;
            let remaining = self
                .store
                .incr(&keys::run_pending_approvals(run_id), -1)
                .await?;
            if remaining <= 0 {
                self.mark_running(run_id).await?;
            }
        }

        let result_blob = self
            .catalog
            .put_blob(&serde_json::to_vec(&record)?, MediaType::NodeResult)
            .await?;
        let mut signal = CompletionSignal {
            version: wfk_core::CONTRACT_VERSION.to_string(),
            job_id: record.token_id.clone(),
            run_id,
            node_id: decision.node_id.clone(),
            status: SignalStatus::Completed,
            result_ref: Some(result_blob),
            metadata: wfk_core::SignalMetadata {
                from_node: Some(record.from_node.clone()),
                ..wfk_core::SignalMetadata::default()
            },
        };
        signal
            .metadata
            .extra
            .insert("approved".to_string(), json!(decision.approved));

        // Publish first; only then flip the record out of pending.
        self.store
            .append(
                keys::streams::COMPLETION_SIGNALS,
                serde_json::to_value(&signal)?,
            )
            .await?;
        self.store
            .set_json(&record_key, &record, Some(self.config.approval_ttl))
            .await?;
        info!(
            target: "wfk.hitl",
            %run_id,
            node = %decision.node_id,
            approved = decision.approved,
            "approval resolved"
        );
        Ok(())
    }

    async fn mark_running(&self, run_id: uuid::Uuid) -> Result<(), StoreError> {
        let Some(mut record) = self
            .store
            .get_json::<RunRecord>(&keys::run_record(run_id))
            .await?
        else {
            return Ok(());
        };
        if record.status != RunStatus::WaitingForApproval {
            return Ok(());
        }
        record.status = RunStatus::Running;
        self.store
            .set_json(&keys::run_record(run_id), &record, None)
            .await?;
        self.store
            .set_json(&keys::run_status(run_id), &record.status, None)
            .await
    }
}
