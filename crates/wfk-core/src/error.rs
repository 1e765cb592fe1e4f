// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error taxonomy shared across the kernel.
//!
//! Crate-level errors (catalog, store, IR, …) are typed `thiserror` enums
//! local to their crates; [`ErrorKind`] is the flat, wire-stable label set
//! carried in completion-signal metadata and logged by the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire-stable error kind labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Optimistic CAS loss on a tag move.
    Conflict,
    /// Missing artifact, tag, run, or approval.
    NotFound,
    /// Malformed patch operation during materialization.
    PatchApply,
    /// Workflow fails structural invariants.
    Validation,
    /// Executor failure inside a worker; non-fatal to the run.
    Worker,
    /// Per-worker or per-run deadline breach.
    Timeout,
    /// Run cancellation observed.
    Cancelled,
    /// Counter went negative or the idempotency set is inconsistent.
    Integrity,
}

impl ErrorKind {
    /// The `snake_case` wire label (what lands in `metadata.error_type`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::PatchApply => "patch_apply",
            Self::Validation => "validation",
            Self::Worker => "worker",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Integrity => "integrity",
        }
    }

    /// `true` for conditions that fail the whole run, not just one path.
    ///
    /// Integrity faults should be impossible under the atomic counter op;
    /// observing one means the store contract was violated.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Integrity)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors arising inside the contract crate itself.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// A content address failed to parse.
    #[error("invalid content address: {value}")]
    InvalidCasId {
        /// The rejected input.
        value: String,
    },

    /// JSON serialization failed while hashing.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
