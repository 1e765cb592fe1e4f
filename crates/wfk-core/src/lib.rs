// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! wfk-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the Workflow Kernel.
//!
//! Tokens, completion signals, run records, and fanout events are all
//! wire-stable: their serialized shape is shared by every worker process,
//! the coordinator, and external subscribers.

/// Error taxonomy shared across the kernel.
pub mod error;
/// Fanout events published on per-owner channels.
pub mod event;
/// Stream names, store key namespaces, and deterministic op-keys.
pub mod keys;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Current contract version string embedded in all wire messages.
///
/// # Examples
///
/// ```
/// assert_eq!(wfk_core::CONTRACT_VERSION, "wfk/v1");
/// ```
pub const CONTRACT_VERSION: &str = "wfk/v1";

/// Length of a token id in characters.
pub const TOKEN_ID_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Content addresses
// ---------------------------------------------------------------------------

/// A content address: `sha256:` followed by the hex digest of the payload.
///
/// Two payloads with the same bytes always share one [`CasId`]; the blob
/// layer deduplicates on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct CasId(String);

impl CasId {
    /// Compute the content address of a byte payload.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(format!("sha256:{}", sha256_hex(bytes)))
    }

    /// Parse an existing address, validating the `sha256:` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`error::ContractError::InvalidCasId`] when the prefix or
    /// digest length is wrong.
    pub fn parse(s: &str) -> Result<Self, error::ContractError> {
        let hex = s
            .strip_prefix("sha256:")
            .ok_or_else(|| error::ContractError::InvalidCasId { value: s.to_string() })?;
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(error::ContractError::InvalidCasId { value: s.to_string() });
        }
        Ok(Self(s.to_string()))
    }

    /// The full `sha256:<hex>` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tagged media type of a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    /// A base workflow definition (a DAG document).
    Dag,
    /// A JSON-Patch operation list.
    PatchOps,
    /// A run manifest.
    RunManifest,
    /// A materialized workflow snapshot.
    RunSnapshot,
    /// A persisted node execution result.
    NodeResult,
    /// An externalized node configuration.
    NodeConfig,
}

// ---------------------------------------------------------------------------
// Node kinds
// ---------------------------------------------------------------------------

/// The executable type of a workflow node.
///
/// Each kind maps to one task stream (`wf.tasks.<kind>`); routing a token
/// means appending it to the stream for the destination node's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// In-process function / transform node.
    Function,
    /// Outbound HTTP call node.
    Http,
    /// LLM agent node.
    Agent,
    /// Human-in-the-loop approval node.
    Hitl,
    /// Branching node routed by rule evaluation.
    #[serde(alias = "branch")]
    Conditional,
    /// Looping node with bounded iteration.
    Loop,
}

impl NodeKind {
    /// The wire name used in stream names and workflow documents.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Http => "http",
            Self::Agent => "agent",
            Self::Hitl => "hitl",
            Self::Conditional => "conditional",
            Self::Loop => "loop",
        }
    }

    /// The task stream this kind of node consumes from.
    ///
    /// Conditional and loop nodes execute as functions; their branch/loop
    /// behavior lives in the coordinator, not the worker.
    #[must_use]
    pub fn task_stream(&self) -> String {
        match self {
            Self::Hitl => keys::streams::TASKS_HITL.to_string(),
            Self::Http => format!("{}{}", keys::streams::TASK_PREFIX, "http"),
            Self::Agent => format!("{}{}", keys::streams::TASK_PREFIX, "agent"),
            Self::Function | Self::Conditional | Self::Loop => {
                format!("{}{}", keys::streams::TASK_PREFIX, "function")
            }
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// A durable in-flight work item: "run this node next".
///
/// Config is pre-resolved by the emitter so workers do not need to re-read
/// the IR for the common case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Token {
    /// Short unique id (12 characters).
    pub id: String,

    /// The run this token belongs to.
    pub run_id: Uuid,

    /// Node the token was emitted from (empty for entry tokens).
    #[serde(default)]
    pub from_node: String,

    /// Node the token is addressed to.
    pub to_node: String,

    /// Pre-resolved node configuration.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, serde_json::Value>,

    /// Carried metadata (run inputs merged with per-node task data).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Emission timestamp (RFC3339 with nanoseconds on the wire).
    pub sent_at: DateTime<Utc>,
}

impl Token {
    /// Construct a token addressed to `to_node`, stamped now.
    #[must_use]
    pub fn new(run_id: Uuid, from_node: impl Into<String>, to_node: impl Into<String>) -> Self {
        Self {
            id: token_id(),
            run_id,
            from_node: from_node.into(),
            to_node: to_node.into(),
            config: BTreeMap::new(),
            metadata: BTreeMap::new(),
            sent_at: Utc::now(),
        }
    }

    /// Replace the pre-resolved config (builder style).
    #[must_use]
    pub fn with_config(mut self, config: BTreeMap<String, serde_json::Value>) -> Self {
        self.config = config;
        self
    }

    /// Replace the carried metadata (builder style).
    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Generate a fresh 12-character token id.
#[must_use]
pub fn token_id() -> String {
    let full = Uuid::new_v4().simple().to_string();
    full[..TOKEN_ID_LEN].to_string()
}

// ---------------------------------------------------------------------------
// Completion signals
// ---------------------------------------------------------------------------

/// Outcome of a node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    /// The node executed and produced a result.
    Completed,
    /// The node executor failed; the path terminates at this node.
    Failed,
    /// Synthetic marker pushed on cancel. Never produced by workers.
    Cancelled,
}

/// Timing and error metadata attached to a [`CompletionSignal`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SignalMetadata {
    /// Wall-clock execution time in milliseconds.
    #[serde(default)]
    pub execution_time_ms: u64,

    /// Time the token spent queued before pickup, in milliseconds.
    #[serde(default)]
    pub queue_time_ms: u64,

    /// Error kind label when `status` is failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    /// Node the consumed token was emitted from. Needed for the consume
    /// op-key; entry tokens carry the empty string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_node: Option<String>,

    /// Additional signal-specific fields (e.g. `approved` for HITL).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Published by workers on `wf.completion_signals` after handling a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompletionSignal {
    /// Contract version of the producing worker.
    pub version: String,

    /// Id of the consumed token.
    pub job_id: String,

    /// The run the signal belongs to.
    pub run_id: Uuid,

    /// The node that finished executing.
    pub node_id: String,

    /// Completed or failed.
    pub status: SignalStatus,

    /// Blob id of the persisted result, when one was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<CasId>,

    /// Timing, error, and routing metadata.
    #[serde(default)]
    pub metadata: SignalMetadata,
}

impl CompletionSignal {
    /// Build a completed signal for the given token.
    #[must_use]
    pub fn completed(token: &Token, result_ref: Option<CasId>) -> Self {
        Self {
            version: CONTRACT_VERSION.to_string(),
            job_id: token.id.clone(),
            run_id: token.run_id,
            node_id: token.to_node.clone(),
            status: SignalStatus::Completed,
            result_ref,
            metadata: SignalMetadata {
                from_node: Some(token.from_node.clone()),
                ..SignalMetadata::default()
            },
        }
    }

    /// Build a failed signal for the given token.
    #[must_use]
    pub fn failed(token: &Token, error_type: impl Into<String>, result_ref: Option<CasId>) -> Self {
        let mut signal = Self::completed(token, result_ref);
        signal.status = SignalStatus::Failed;
        signal.metadata.error_type = Some(error_type.into());
        signal
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Accepted, not yet processed by the coordinator.
    Queued,
    /// At least one completion signal has been processed.
    Running,
    /// One or more HITL approvals are pending.
    WaitingForApproval,
    /// Counter reached zero with no pending work.
    Completed,
    /// Unrecoverable fatal signal or supervisor timeout.
    Failed,
    /// Externally cancelled.
    Cancelled,
}

impl RunStatus {
    /// `true` once the run can no longer make progress.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// What a run was submitted against: a tag or a concrete artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BaseRef {
    /// A user-namespaced tag, resolved at submission time.
    Tag {
        /// Tag name within the owner's namespace.
        name: String,
    },
    /// A pinned artifact id.
    Artifact {
        /// The artifact to materialize from.
        id: Uuid,
    },
}

/// A run submission consumed by the initializer from `wf.run.requests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunRequest {
    /// Sortable run id (UUIDv7), allocated by the submitting surface.
    pub run_id: Uuid,

    /// Tag or artifact to execute.
    pub base: BaseRef,

    /// Submitting user; namespaces tags and the event channel.
    pub owner: String,

    /// Submission inputs merged into every entry token's metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, serde_json::Value>,

    /// Submission timestamp.
    pub created_at: DateTime<Utc>,
}

impl RunRequest {
    /// Build a request with a freshly allocated sortable run id.
    #[must_use]
    pub fn new(base: BaseRef, owner: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            base,
            owner: owner.into(),
            inputs: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// The durable record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunRecord {
    /// Sortable run id.
    pub run_id: Uuid,

    /// Submission timestamp (partition key in durable deployments).
    pub submitted_at: DateTime<Utc>,

    /// Tag or artifact the run was submitted against.
    pub base: BaseRef,

    /// Current lifecycle state.
    pub status: RunStatus,

    /// Owning username.
    pub owner: String,

    /// Submission inputs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, serde_json::Value>,

    /// Tag positions observed at submission time, for reproducibility.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tag_snapshot: BTreeMap<String, Uuid>,

    /// Last time the coordinator processed a signal for this run.
    pub last_event_at: DateTime<Utc>,

    /// Completion timestamp, set on any terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Failure reason, set when `status` is failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// A patch produced during a run by a node (typically an agent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunPatch {
    /// The run the patch applies to.
    pub run_id: Uuid,

    /// Monotonic per-run sequence number; patches apply in this order.
    pub seq: u64,

    /// The `patch_set` artifact holding the operations.
    pub artifact_id: Uuid,

    /// Who produced the patch.
    pub created_by: String,

    /// Node that emitted the patch proposal, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_node: Option<String>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// HITL wire shapes
// ---------------------------------------------------------------------------

/// A human decision pushed on `wf.tasks.hitl.responses`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HitlDecision {
    /// Run awaiting the decision.
    pub run_id: Uuid,

    /// The HITL node the decision resolves.
    pub node_id: String,

    /// The verdict.
    pub approved: bool,

    /// Optional free-form comment from the approver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Who decided.
    pub approved_by: String,

    /// When the decision was made.
    pub approved_at: DateTime<Utc>,

    /// Tag the workflow was running under, for the per-tag pending counter.
    pub workflow_tag: String,
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Hex-encoded SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    use fmt::Write;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// SHA-256 over the canonical JSON encoding of a value.
///
/// serde_json serializes object keys in sorted order (its map is a BTreeMap
/// under the default feature set), so encoding a `Value` directly is
/// canonical: identical values always hash identically.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized (non-string map keys
/// or non-finite floats introduced via `Number::from_f64` cannot occur for
/// values parsed from JSON).
pub fn canonical_json_hash(value: &serde_json::Value) -> Result<String, error::ContractError> {
    let json = serde_json::to_string(value)?;
    Ok(sha256_hex(json.as_bytes()))
}
