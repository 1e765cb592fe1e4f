// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! wfk-catalog
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The catalog service over a [`wfk_store::Store`].
pub mod catalog;
/// Garbage collection of unreachable artifacts and orphaned blobs.
pub mod gc;
/// JSON-Patch application and workflow canonicalization.
pub mod patch;
/// Stored record shapes.
pub mod records;

pub use catalog::{Catalog, MATERIALIZER_VERSION};
pub use gc::{GcConfig, GcReport};
pub use records::{ArtifactKind, ArtifactRecord, BlobRecord, TagMove, TagRecord};

use wfk_store::StoreError;

/// Errors surfaced by catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Optimistic CAS loss on a tag move.
    #[error("tag `{tag}` moved concurrently: expected version {expected}, found {found}")]
    Conflict {
        /// The contended tag name.
        tag: String,
        /// Version the caller expected.
        expected: u64,
        /// Version actually stored.
        found: u64,
    },

    /// A referenced artifact, blob, or tag does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up (`artifact`, `blob`, `tag`).
        kind: &'static str,
        /// The missing identifier.
        id: String,
    },

    /// A patch operation failed during materialization.
    ///
    /// The patch artifact itself stays valid; materialization refuses to
    /// produce a snapshot and callers may fall back to a previous tag
    /// position.
    #[error("patch {seq} op {op_index} failed to apply: {reason}")]
    PatchApply {
        /// 1-based position of the patch in its chain.
        seq: usize,
        /// 0-based index of the failing operation.
        op_index: usize,
        /// What went wrong.
        reason: String,
    },

    /// The operation targets an artifact of the wrong kind.
    #[error("invalid target: {reason}")]
    InvalidTarget {
        /// Why the target was rejected.
        reason: String,
    },

    /// Undo requested with no prior move to revert.
    #[error("nothing to undo for tag `{tag}`")]
    NothingToUndo {
        /// The tag name.
        tag: String,
    },

    /// Redo requested with no undone move to replay.
    #[error("nothing to redo for tag `{tag}`")]
    NothingToRedo {
        /// The tag name.
        tag: String,
    },

    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored record failed to (de)serialize.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Canonical hashing failed.
    #[error(transparent)]
    Hashing(#[from] wfk_core::error::ContractError),
}
