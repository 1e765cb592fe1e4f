// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! wfk-store
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Contract notes:
//!
//! - Streams are FIFO per stream; delivery is at-least-once within a
//!   consumer group, so consumers must be idempotent on message id.
//! - [`Store::counter_apply`] is the *only* operation that advances a run's
//!   progress. Implementations must apply it atomically per run: check the
//!   applied set, mutate, and report in one serialized step.

/// Cancellation primitive shared by the kernel's service loops.
pub mod cancel;
/// In-memory implementation of the store contract.
pub mod memory;

pub use cancel::CancellationToken;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store failed (connection loss, I/O, …).
    #[error("store backend failure: {0}")]
    Backend(String),

    /// A value could not be serialized or deserialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A consumer group was used before being implicitly created by a read.
    #[error("unknown consumer group {group} on stream {stream}")]
    UnknownGroup {
        /// Stream name.
        stream: String,
        /// Group name.
        group: String,
    },
}

// ---------------------------------------------------------------------------
// Counter outcome
// ---------------------------------------------------------------------------

/// Result of one atomic counter op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    /// Counter value after the op (unchanged when `applied` is false).
    pub counter: i64,

    /// `false` when the op-key was already in the applied set (no-op).
    pub applied: bool,

    /// `true` when *this* op moved the counter to zero.
    pub reached_zero: bool,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Key-value, hash, set, counter, blob, and pub/sub operations.
///
/// Keys are opaque strings; the kernel's namespace lives in
/// `wfk_core::keys`. TTLs are advisory precision — implementations may
/// expire lazily on read.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a key. Expired entries read as absent.
    async fn kv_get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write a key, replacing any prior value.
    async fn kv_set(&self, key: &str, value: Value, ttl: Option<Duration>)
    -> Result<(), StoreError>;

    /// Write a key only if absent. Returns `true` when the write won.
    async fn kv_set_nx(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Delete a key. Returns `true` when something was removed.
    async fn kv_delete(&self, key: &str) -> Result<bool, StoreError>;

    /// List live keys starting with `prefix`.
    async fn kv_scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Set one field in a hash, creating the hash if needed.
    async fn hash_set(&self, key: &str, field: &str, value: Value) -> Result<(), StoreError>;

    /// Read one field from a hash.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>, StoreError>;

    /// Read an entire hash (empty map when absent).
    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, Value>, StoreError>;

    /// Number of fields in a hash (0 when absent).
    async fn hash_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Delete a whole hash. Returns `true` when it existed.
    async fn hash_delete(&self, key: &str) -> Result<bool, StoreError>;

    /// List hash keys starting with `prefix`.
    async fn hash_scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Add a member to a set. Returns `true` when newly added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Membership test.
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// All members of a set (empty when absent).
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Adjust a plain counter by `delta`, returning the new value.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Read a plain counter (0 when absent).
    async fn counter_value(&self, key: &str) -> Result<i64, StoreError>;

    /// Current value of a run's pending counter.
    async fn run_counter(&self, run_id: Uuid) -> Result<i64, StoreError>;

    /// Whether an op-key is already in the run's applied set.
    async fn counter_applied(&self, run_id: Uuid, op_key: &str) -> Result<bool, StoreError>;

    /// The atomic counter op.
    ///
    /// Per `(run_id, op_key)`: if the key is already in the run's applied
    /// set, return the current counter with `applied: false`. Otherwise add
    /// the key, apply `delta`, and report whether the counter reached zero.
    /// Implementations must serialize this per run — no lost updates under
    /// concurrent coordinator shards.
    async fn counter_apply(
        &self,
        run_id: Uuid,
        op_key: &str,
        delta: i64,
    ) -> Result<CounterOutcome, StoreError>;

    /// Drop a run's counter and applied set (post-completion cleanup).
    async fn counter_clear(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Store a binary payload under `key` (idempotent for equal bytes).
    async fn blob_put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Read a binary payload.
    async fn blob_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete a binary payload. Returns `true` when it existed.
    async fn blob_delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Publish on a channel, returning the number of live subscribers.
    async fn publish(&self, channel: &str, payload: Value) -> Result<usize, StoreError>;

    /// Subscribe to a channel. Only messages published after the call are
    /// delivered; subscribers that lag may drop messages.
    fn subscribe(&self, channel: &str) -> ChannelSubscription;
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// A message delivered from a stream to a consumer group member.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Monotonically increasing per-stream id.
    pub id: u64,

    /// Stream the message came from.
    pub stream: String,

    /// Message payload.
    pub payload: Value,

    /// 1 on first delivery, incremented on each redelivery.
    pub delivery_count: u32,
}

/// Durable ordered streams with consumer groups.
#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Append a payload, returning its message id.
    async fn append(&self, stream: &str, payload: Value) -> Result<u64, StoreError>;

    /// Read the next message for `group`, blocking up to `block`.
    ///
    /// Un-ACKed messages whose redelivery deadline has passed are handed
    /// out before new ones. Returns `None` on block timeout.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamMessage>, StoreError>;

    /// Acknowledge a delivered message. Returns `true` when it was pending.
    async fn ack(&self, stream: &str, group: &str, id: u64) -> Result<bool, StoreError>;

    /// Number of delivered-but-unacknowledged messages for `group`.
    async fn pending_len(&self, stream: &str, group: &str) -> Result<usize, StoreError>;

    /// Total number of messages ever appended to `stream`.
    async fn stream_len(&self, stream: &str) -> Result<usize, StoreError>;
}

/// The full backplane a kernel component needs: store + streams.
pub trait Backplane: Store + StreamBus {}

impl<T: Store + StreamBus> Backplane for T {}

// ---------------------------------------------------------------------------
// Pub/sub subscription
// ---------------------------------------------------------------------------

/// A handle for receiving published channel messages.
pub struct ChannelSubscription {
    rx: tokio::sync::broadcast::Receiver<Value>,
}

impl ChannelSubscription {
    pub(crate) fn new(rx: tokio::sync::broadcast::Receiver<Value>) -> Self {
        Self { rx }
    }

    /// Receive the next message, waiting asynchronously.
    ///
    /// Returns `None` when the channel is closed. Lagged messages are
    /// skipped and the next available one is returned.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(v) => return Some(v),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive without blocking.
    pub fn try_recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.try_recv() {
                Ok(v) => return Some(v),
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Typed helpers
// ---------------------------------------------------------------------------

/// Typed JSON convenience layer over [`Store`].
#[async_trait]
pub trait StoreExt: Store {
    /// Read a key and deserialize it.
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.kv_get(key).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Serialize and write a key.
    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.kv_set(key, serde_json::to_value(value)?, ttl).await
    }
}

impl<S: Store + ?Sized> StoreExt for S {}
