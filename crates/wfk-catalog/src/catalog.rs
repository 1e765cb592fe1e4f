// SPDX-License-Identifier: MIT OR Apache-2.0
//! The catalog service: blobs, artifacts, tags, chains, materialization.
//!
//! Multi-key writes (patch creation, tag moves) serialize on one
//! transaction mutex, which stands in for the row locks a SQL backend
//! would take. Reads go straight to the store.

use crate::patch::{PatchOp, apply_ops, canonicalize_workflow};
use crate::records::{ArtifactKind, ArtifactRecord, BlobRecord, TagHistory, TagMove, TagRecord};
use crate::CatalogError;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use wfk_core::{CasId, MediaType, canonical_json_hash, sha256_hex};
use wfk_store::{Store, StoreExt};

/// Version of the materializer; part of every plan hash so a semantics
/// change invalidates cached snapshots.
pub const MATERIALIZER_VERSION: &str = "wfk-materializer/1";

pub(crate) mod keys {
    use uuid::Uuid;
    use wfk_core::CasId;

    pub fn artifact(id: Uuid) -> String {
        format!("cat:artifact:{id}")
    }
    pub const ARTIFACT_PREFIX: &str = "cat:artifact:";

    pub fn blob_meta(id: &CasId) -> String {
        format!("cat:blobmeta:{id}")
    }
    pub const BLOB_META_PREFIX: &str = "cat:blobmeta:";

    pub fn tag(username: &str, tag_name: &str) -> String {
        format!("cat:tag:{username}:{tag_name}")
    }
    pub const TAG_PREFIX: &str = "cat:tag:";

    pub fn tag_moves(username: &str, tag_name: &str) -> String {
        format!("cat:tagmoves:{username}:{tag_name}")
    }

    pub fn tag_history(username: &str, tag_name: &str) -> String {
        format!("cat:taghistory:{username}:{tag_name}")
    }

    pub fn chain(head: Uuid) -> String {
        format!("cat:chain:{head}")
    }

    pub fn plan(hash: &str) -> String {
        format!("cat:plan:{hash}")
    }

    pub fn snapshot_index(date: chrono::NaiveDate) -> String {
        format!("cat:snapidx:{date}")
    }
}

/// The Version & Patch Store.
pub struct Catalog {
    store: Arc<dyn Store>,
    txn: Mutex<()>,
}

impl Catalog {
    /// Create a catalog over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            txn: Mutex::new(()),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // -- blobs ------------------------------------------------------------

    /// Store a payload by content address. Idempotent: storing the same
    /// bytes twice is a no-op returning the same id.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Store`] on backend failure.
    pub async fn put_blob(
        &self,
        bytes: &[u8],
        media_type: MediaType,
    ) -> Result<CasId, CatalogError> {
        let id = CasId::from_bytes(bytes);
        let meta_key = keys::blob_meta(&id);
        if self.store.kv_get(&meta_key).await?.is_some() {
            return Ok(id);
        }
        self.store.blob_put(id.as_str(), bytes.to_vec()).await?;
        let record = BlobRecord {
            id: id.clone(),
            media_type,
            size: bytes.len() as u64,
            created_at: Utc::now(),
        };
        self.store.set_json(&meta_key, &record, None).await?;
        debug!(target: "wfk.catalog", id = %id, ?media_type, size = record.size, "blob stored");
        Ok(id)
    }

    /// Load blob metadata.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the blob does not exist.
    pub async fn blob_meta(&self, id: &CasId) -> Result<BlobRecord, CatalogError> {
        self.store
            .get_json(&keys::blob_meta(id))
            .await?
            .ok_or_else(|| CatalogError::NotFound {
                kind: "blob",
                id: id.to_string(),
            })
    }

    /// Load blob bytes.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the blob does not exist.
    pub async fn blob_bytes(&self, id: &CasId) -> Result<Vec<u8>, CatalogError> {
        self.store
            .blob_get(id.as_str())
            .await?
            .ok_or_else(|| CatalogError::NotFound {
                kind: "blob",
                id: id.to_string(),
            })
    }

    /// Load and parse a JSON blob.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] or a parse failure.
    pub async fn blob_json(&self, id: &CasId) -> Result<Value, CatalogError> {
        let bytes = self.blob_bytes(id).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    // -- artifacts --------------------------------------------------------

    /// Record a base workflow version over an existing `dag` blob.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the blob is missing, or a parse
    /// failure when it is not a workflow document.
    pub async fn create_dag_version(
        &self,
        blob_id: &CasId,
        name: &str,
        owner: &str,
    ) -> Result<ArtifactRecord, CatalogError> {
        self.create_dag_inner(blob_id, name, owner, None).await
    }

    async fn create_dag_inner(
        &self,
        blob_id: &CasId,
        name: &str,
        owner: &str,
        compacted_from_id: Option<Uuid>,
    ) -> Result<ArtifactRecord, CatalogError> {
        let mut doc = self.blob_json(blob_id).await?;
        canonicalize_workflow(&mut doc);
        let version_hash = canonical_json_hash(&doc)?;
        let record = ArtifactRecord {
            id: Uuid::new_v4(),
            kind: ArtifactKind::DagVersion,
            blob_id: blob_id.clone(),
            name: name.to_string(),
            owner: owner.to_string(),
            version_hash,
            base_version: None,
            depth: 0,
            op_count: 0,
            nodes_count: count(&doc, "nodes"),
            edges_count: count(&doc, "edges"),
            compacted_from_id,
            created_at: Utc::now(),
        };
        self.store
            .set_json(&keys::artifact(record.id), &record, None)
            .await?;
        info!(target: "wfk.catalog", id = %record.id, name, "dag version created");
        Ok(record)
    }

    /// Record a patch on top of `parent_id` (a `dag_version` or another
    /// `patch_set`). The chain rows and artifact row commit together.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when parent or ops blob are missing;
    /// [`CatalogError::InvalidTarget`] for a non-versionable parent.
    pub async fn create_patch(
        &self,
        parent_id: Uuid,
        ops_blob: &CasId,
        name: &str,
        owner: &str,
    ) -> Result<ArtifactRecord, CatalogError> {
        let _guard = self.txn.lock().await;

        let parent = self.artifact(parent_id).await?;
        let ops: Vec<PatchOp> = serde_json::from_value(self.blob_json(ops_blob).await?)?;

        let (base_version, depth, mut chain) = match parent.kind {
            ArtifactKind::DagVersion => (parent.id, 1, Vec::new()),
            ArtifactKind::PatchSet => {
                let base = parent.base_version.ok_or(CatalogError::InvalidTarget {
                    reason: format!("patch {parent_id} has no base version"),
                })?;
                (base, parent.depth + 1, self.chain_members(parent.id).await?)
            }
            other => {
                return Err(CatalogError::InvalidTarget {
                    reason: format!("cannot patch a {} artifact", other.as_str()),
                });
            }
        };

        let record = ArtifactRecord {
            id: Uuid::new_v4(),
            kind: ArtifactKind::PatchSet,
            blob_id: ops_blob.clone(),
            name: name.to_string(),
            owner: owner.to_string(),
            version_hash: sha256_hex(&self.blob_bytes(ops_blob).await?),
            base_version: Some(base_version),
            depth,
            op_count: ops.len() as u32,
            nodes_count: 0,
            edges_count: 0,
            compacted_from_id: None,
            created_at: Utc::now(),
        };

        chain.push(record.id);
        self.store
            .set_json(&keys::chain(record.id), &chain, None)
            .await?;
        self.store
            .set_json(&keys::artifact(record.id), &record, None)
            .await?;
        info!(target: "wfk.catalog", id = %record.id, depth, ops = record.op_count, "patch created");
        Ok(record)
    }

    /// Load an artifact.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when it does not exist.
    pub async fn artifact(&self, id: Uuid) -> Result<ArtifactRecord, CatalogError> {
        self.store
            .get_json(&keys::artifact(id))
            .await?
            .ok_or_else(|| CatalogError::NotFound {
                kind: "artifact",
                id: id.to_string(),
            })
    }

    /// Ordered chain members for a patch head, base-nearest first.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Store`] on backend failure.
    pub async fn chain_members(&self, head: Uuid) -> Result<Vec<Uuid>, CatalogError> {
        Ok(self
            .store
            .get_json::<Vec<Uuid>>(&keys::chain(head))
            .await?
            .unwrap_or_default())
    }

    // -- tags -------------------------------------------------------------

    /// Move a tag (or create it when `expected_version` is 0 and the tag
    /// does not exist yet).
    ///
    /// # Errors
    ///
    /// [`CatalogError::Conflict`] when the stored version no longer matches
    /// `expected_version`; callers decide whether to re-read and retry.
    pub async fn move_tag(
        &self,
        username: &str,
        tag_name: &str,
        new_target: Uuid,
        expected_version: u64,
        actor: &str,
    ) -> Result<u64, CatalogError> {
        let _guard = self.txn.lock().await;

        let target = self.artifact(new_target).await?;
        if target.kind == ArtifactKind::PatchSet {
            let base = target.base_version.ok_or(CatalogError::InvalidTarget {
                reason: format!("patch {new_target} has no base version"),
            })?;
            // The chain's base must exist before a tag may point at the head.
            self.artifact(base).await?;
        }

        let tag_key = keys::tag(username, tag_name);
        let existing: Option<TagRecord> = self.store.get_json(&tag_key).await?;
        let found_version = existing.as_ref().map_or(0, |t| t.version);
        if found_version != expected_version {
            return Err(CatalogError::Conflict {
                tag: tag_name.to_string(),
                expected: expected_version,
                found: found_version,
            });
        }

        let from_target = existing.as_ref().map(|t| t.target_id);
        let new_version = found_version + 1;
        self.write_tag_state(username, tag_name, &target, new_version, actor, from_target)
            .await?;
        info!(target: "wfk.catalog", username, tag_name, target = %new_target, version = new_version, "tag moved");
        Ok(new_version)
    }

    /// Revert a tag to its previous target, recorded as a fresh move.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NothingToUndo`] at the start of history.
    pub async fn undo_tag(
        &self,
        username: &str,
        tag_name: &str,
        actor: &str,
    ) -> Result<u64, CatalogError> {
        let _guard = self.txn.lock().await;
        let tag = self.tag(username, tag_name).await?;
        let mut history = self.history(username, tag_name).await?;
        if history.pos == 0 {
            return Err(CatalogError::NothingToUndo {
                tag: tag_name.to_string(),
            });
        }
        history.pos -= 1;
        let target = self.artifact(history.targets[history.pos]).await?;
        let new_version = tag.version + 1;
        self.write_tag_with_history(username, tag_name, &target, new_version, actor, Some(tag.target_id), history)
            .await?;
        Ok(new_version)
    }

    /// Replay the most recently undone move.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NothingToRedo`] when no undo is outstanding.
    pub async fn redo_tag(
        &self,
        username: &str,
        tag_name: &str,
        actor: &str,
    ) -> Result<u64, CatalogError> {
        let _guard = self.txn.lock().await;
        let tag = self.tag(username, tag_name).await?;
        let mut history = self.history(username, tag_name).await?;
        if history.pos + 1 >= history.targets.len() {
            return Err(CatalogError::NothingToRedo {
                tag: tag_name.to_string(),
            });
        }
        history.pos += 1;
        let target = self.artifact(history.targets[history.pos]).await?;
        let new_version = tag.version + 1;
        self.write_tag_with_history(username, tag_name, &target, new_version, actor, Some(tag.target_id), history)
            .await?;
        Ok(new_version)
    }

    /// Load a tag by exact `(username, tag_name)`.
    ///
    /// User isolation is a hard security invariant: lookups are exact-match
    /// key reads, never prefix scans.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when absent.
    pub async fn tag(&self, username: &str, tag_name: &str) -> Result<TagRecord, CatalogError> {
        self.store
            .get_json(&keys::tag(username, tag_name))
            .await?
            .ok_or_else(|| CatalogError::NotFound {
                kind: "tag",
                id: format!("{username}:{tag_name}"),
            })
    }

    /// Full move history for a tag, oldest first.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Store`] on backend failure.
    pub async fn tag_moves(
        &self,
        username: &str,
        tag_name: &str,
    ) -> Result<Vec<TagMove>, CatalogError> {
        Ok(self
            .store
            .get_json(&keys::tag_moves(username, tag_name))
            .await?
            .unwrap_or_default())
    }

    /// Resolve a tag to `(base, chain)` ready for materialization.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] for a missing tag or dangling artifact.
    pub async fn resolve_tag(
        &self,
        username: &str,
        tag_name: &str,
    ) -> Result<(ArtifactRecord, Vec<ArtifactRecord>), CatalogError> {
        let tag = self.tag(username, tag_name).await?;
        self.resolve_artifact(tag.target_id).await
    }

    /// Resolve an artifact id to `(base, chain)`.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] or [`CatalogError::InvalidTarget`].
    pub async fn resolve_artifact(
        &self,
        id: Uuid,
    ) -> Result<(ArtifactRecord, Vec<ArtifactRecord>), CatalogError> {
        let target = self.artifact(id).await?;
        match target.kind {
            ArtifactKind::DagVersion | ArtifactKind::RunSnapshot => Ok((target, Vec::new())),
            ArtifactKind::PatchSet => {
                let base_id = target.base_version.ok_or(CatalogError::InvalidTarget {
                    reason: format!("patch {id} has no base version"),
                })?;
                let base = self.artifact(base_id).await?;
                let mut chain = Vec::new();
                for member in self.chain_members(target.id).await? {
                    chain.push(self.artifact(member).await?);
                }
                Ok((base, chain))
            }
            ArtifactKind::RunManifest => Err(CatalogError::InvalidTarget {
                reason: "a run manifest cannot be materialized".to_string(),
            }),
        }
    }

    // -- materialization --------------------------------------------------

    /// Apply a patch chain to a base version and canonicalize the result.
    ///
    /// Deterministic: identical `(base, chain)` inputs always produce the
    /// same document and therefore the same effective hash.
    ///
    /// # Errors
    ///
    /// [`CatalogError::PatchApply`] naming the failing `(seq, op_index)`.
    pub async fn materialize(
        &self,
        base: &ArtifactRecord,
        chain: &[ArtifactRecord],
    ) -> Result<Value, CatalogError> {
        let mut doc = self.blob_json(&base.blob_id).await?;
        for (idx, member) in chain.iter().enumerate() {
            let seq = idx + 1;
            let ops: Vec<PatchOp> =
                serde_json::from_value(self.blob_json(&member.blob_id).await?).map_err(|e| {
                    CatalogError::PatchApply {
                        seq,
                        op_index: 0,
                        reason: format!("malformed ops blob: {e}"),
                    }
                })?;
            apply_ops(&mut doc, &ops).map_err(|(op_index, reason)| CatalogError::PatchApply {
                seq,
                op_index,
                reason,
            })?;
        }
        canonicalize_workflow(&mut doc);
        Ok(doc)
    }

    /// Effective hash of a materialized document.
    ///
    /// # Errors
    ///
    /// Serialization failure only.
    pub fn effective_hash(doc: &Value) -> Result<String, CatalogError> {
        Ok(canonical_json_hash(doc)?)
    }

    /// Deterministic cache key over `(base, chain, materializer, options)`.
    #[must_use]
    pub fn plan_hash(base: Uuid, chain: &[Uuid], options: &str) -> String {
        let mut input = String::new();
        input.push_str(&base.to_string());
        input.push('\n');
        for member in chain {
            input.push_str(&member.to_string());
            input.push('\n');
        }
        input.push_str(MATERIALIZER_VERSION);
        input.push('\n');
        input.push_str(options);
        sha256_hex(input.as_bytes())
    }

    /// Materialize with snapshot reuse: an existing `run_snapshot` artifact
    /// under the same plan hash short-circuits the patch application.
    ///
    /// # Errors
    ///
    /// Any [`Self::materialize`] error.
    pub async fn materialize_cached(
        &self,
        base: &ArtifactRecord,
        chain: &[ArtifactRecord],
        owner: &str,
    ) -> Result<(Value, Uuid), CatalogError> {
        let chain_ids: Vec<Uuid> = chain.iter().map(|c| c.id).collect();
        let plan = Self::plan_hash(base.id, &chain_ids, "");
        let plan_key = keys::plan(&plan);

        if let Some(snapshot_id) = self.store.get_json::<Uuid>(&plan_key).await? {
            if let Ok(artifact) = self.artifact(snapshot_id).await {
                let doc = self.blob_json(&artifact.blob_id).await?;
                debug!(target: "wfk.catalog", plan = %plan, snapshot = %snapshot_id, "snapshot cache hit");
                return Ok((doc, snapshot_id));
            }
        }

        let doc = self.materialize(base, chain).await?;
        let bytes = serde_json::to_vec(&doc)?;
        let blob_id = self.put_blob(&bytes, MediaType::RunSnapshot).await?;
        let record = ArtifactRecord {
            id: Uuid::new_v4(),
            kind: ArtifactKind::RunSnapshot,
            blob_id,
            name: format!("snapshot of {}", base.name),
            owner: owner.to_string(),
            version_hash: Self::effective_hash(&doc)?,
            base_version: Some(base.id),
            depth: 0,
            op_count: 0,
            nodes_count: count(&doc, "nodes"),
            edges_count: count(&doc, "edges"),
            compacted_from_id: None,
            created_at: Utc::now(),
        };
        self.store
            .set_json(&keys::artifact(record.id), &record, None)
            .await?;
        self.store.set_json(&plan_key, &record.id, None).await?;
        self.store
            .set_add(
                &keys::snapshot_index(Utc::now().date_naive()),
                &record.id.to_string(),
            )
            .await?;
        Ok((doc, record.id))
    }

    /// Materialize a patch head and store the result as a fresh
    /// `dag_version` with `compacted_from_id` linking back. Old patches are
    /// retained; garbage collection removes them once unreachable.
    ///
    /// # Errors
    ///
    /// [`CatalogError::InvalidTarget`] unless `head_patch` is a `patch_set`.
    pub async fn compact(
        &self,
        head_patch: Uuid,
        actor: &str,
    ) -> Result<ArtifactRecord, CatalogError> {
        let head = self.artifact(head_patch).await?;
        if head.kind != ArtifactKind::PatchSet {
            return Err(CatalogError::InvalidTarget {
                reason: format!("compact requires a patch_set, got {}", head.kind.as_str()),
            });
        }
        let (base, chain) = self.resolve_artifact(head_patch).await?;
        let doc = self.materialize(&base, &chain).await?;
        let bytes = serde_json::to_vec(&doc)?;
        let blob_id = self.put_blob(&bytes, MediaType::Dag).await?;
        let record = self
            .create_dag_inner(&blob_id, &head.name, actor, Some(head_patch))
            .await?;
        info!(target: "wfk.catalog", head = %head_patch, compacted = %record.id, "patch chain compacted");
        Ok(record)
    }

    // -- internals --------------------------------------------------------

    async fn history(&self, username: &str, tag_name: &str) -> Result<TagHistory, CatalogError> {
        Ok(self
            .store
            .get_json(&keys::tag_history(username, tag_name))
            .await?
            .unwrap_or_default())
    }

    /// Write tag record + move log + history for a regular move (truncates
    /// any redo tail).
    async fn write_tag_state(
        &self,
        username: &str,
        tag_name: &str,
        target: &ArtifactRecord,
        new_version: u64,
        actor: &str,
        from_target: Option<Uuid>,
    ) -> Result<(), CatalogError> {
        let mut history = self.history(username, tag_name).await?;
        if !history.targets.is_empty() {
            history.targets.truncate(history.pos + 1);
        }
        history.targets.push(target.id);
        history.pos = history.targets.len() - 1;
        self.write_tag_with_history(
            username, tag_name, target, new_version, actor, from_target, history,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_tag_with_history(
        &self,
        username: &str,
        tag_name: &str,
        target: &ArtifactRecord,
        new_version: u64,
        actor: &str,
        from_target: Option<Uuid>,
        history: TagHistory,
    ) -> Result<(), CatalogError> {
        let now = Utc::now();
        let record = TagRecord {
            username: username.to_string(),
            tag_name: tag_name.to_string(),
            target_kind: target.kind,
            target_id: target.id,
            target_hash: target.version_hash.clone(),
            version: new_version,
            moved_by: actor.to_string(),
            moved_at: now,
        };
        self.store
            .set_json(&keys::tag(username, tag_name), &record, None)
            .await?;

        let mut moves = self.tag_moves(username, tag_name).await?;
        moves.push(TagMove {
            username: username.to_string(),
            tag_name: tag_name.to_string(),
            from_target,
            to_target: target.id,
            version_after: new_version,
            actor: actor.to_string(),
            moved_at: now,
        });
        self.store
            .set_json(&keys::tag_moves(username, tag_name), &moves, None)
            .await?;
        self.store
            .set_json(&keys::tag_history(username, tag_name), &history, None)
            .await?;
        Ok(())
    }
}

fn count(doc: &Value, field: &str) -> u32 {
    doc.get(field)
        .and_then(Value::as_array)
        .map_or(0, |a| a.len() as u32)
}
