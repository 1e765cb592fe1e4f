// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stored record shapes for the catalog.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wfk_core::{CasId, MediaType};

/// The typed kind of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A base workflow version.
    DagVersion,
    /// An incremental patch anchored to a base version.
    PatchSet,
    /// A cached materialization result.
    RunSnapshot,
    /// A run manifest.
    RunManifest,
}

impl ArtifactKind {
    /// Wire label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DagVersion => "dag_version",
            Self::PatchSet => "patch_set",
            Self::RunSnapshot => "run_snapshot",
            Self::RunManifest => "run_manifest",
        }
    }
}

/// Metadata for a stored blob; the payload lives in the blob namespace
/// keyed by the content address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BlobRecord {
    /// Content address of the payload.
    pub id: CasId,

    /// Tagged media type.
    pub media_type: MediaType,

    /// Payload size in bytes.
    pub size: u64,

    /// First-seen timestamp.
    pub created_at: DateTime<Utc>,
}

/// A typed, immutable reference to one blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRecord {
    /// Artifact id.
    pub id: Uuid,

    /// Artifact kind.
    pub kind: ArtifactKind,

    /// The referenced blob.
    pub blob_id: CasId,

    /// Human name.
    pub name: String,

    /// Creating user.
    pub owner: String,

    /// Integrity hash of the artifact's logical content.
    pub version_hash: String,

    /// For patches: the `dag_version` anchoring the chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Uuid>,

    /// Distance from the base version (0 for bases).
    #[serde(default)]
    pub depth: u32,

    /// Number of patch operations (0 for non-patches).
    #[serde(default)]
    pub op_count: u32,

    /// Denormalized node count for quick inspection.
    #[serde(default)]
    pub nodes_count: u32,

    /// Denormalized edge count for quick inspection.
    #[serde(default)]
    pub edges_count: u32,

    /// For compacted bases: the patch head this artifact supplanted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_from_id: Option<Uuid>,

    /// Insertion timestamp.
    pub created_at: DateTime<Utc>,
}

/// A mutable, user-namespaced pointer into the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TagRecord {
    /// Owning username (exact-match isolation; never prefix-matched).
    pub username: String,

    /// Tag name within the owner's namespace.
    pub tag_name: String,

    /// Kind of the target artifact (mirrors the artifact row).
    pub target_kind: ArtifactKind,

    /// The target artifact.
    pub target_id: Uuid,

    /// The target's version hash at move time.
    pub target_hash: String,

    /// Monotonically increasing version for optimistic CAS updates.
    pub version: u64,

    /// Actor of the last move.
    pub moved_by: String,

    /// Time of the last move.
    pub moved_at: DateTime<Utc>,
}

/// One row of the append-only tag move log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TagMove {
    /// Owning username.
    pub username: String,

    /// Tag name.
    pub tag_name: String,

    /// Target before the move (`None` for tag creation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_target: Option<Uuid>,

    /// Target after the move.
    pub to_target: Uuid,

    /// Tag version after the move.
    pub version_after: u64,

    /// Who moved the tag.
    pub actor: String,

    /// When.
    pub moved_at: DateTime<Utc>,
}

/// Undo/redo position over a tag's target history.
///
/// `targets[pos]` is the current target; entries after `pos` are redoable.
/// A regular move truncates the redo tail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct TagHistory {
    pub targets: Vec<Uuid>,
    pub pos: usize,
}
