// SPDX-License-Identifier: MIT OR Apache-2.0
//! Mid-run patch overlay.
//!
//! A node (typically an agent) can propose a patch while its run is in
//! flight. The overlay records it as a `run_patch`, chains it onto the
//! run's base materialization, and rewrites `ir:{run_id}` in place. The
//! coordinator re-reads the IR on every signal, so routing picks up the
//! patched graph without interrupting in-flight work.

use crate::CoordinatorError;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;
use wfk_catalog::Catalog;
use wfk_core::{BaseRef, CasId, RunPatch, RunRecord, keys};
use wfk_ir::{IrMetadata, WorkflowDoc};
use wfk_store::{Backplane, StoreExt};

/// Settings for the patch overlay.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// TTL applied to the rewritten IR.
    pub ir_ttl: Duration,

    /// Reject patches whose added nodes no edge connects to the existing
    /// graph. Off by default: unreachable additions simply never execute.
    pub reject_disconnected: bool,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            ir_ttl: Duration::from_secs(24 * 60 * 60),
            reject_disconnected: false,
        }
    }
}

/// Applies run patches and recompiles the live IR.
pub struct PatchOverlay {
    store: Arc<dyn Backplane>,
    catalog: Arc<Catalog>,
    config: OverlayConfig,
}

impl PatchOverlay {
    /// Create an overlay over the shared backplane and catalog.
    pub fn new(store: Arc<dyn Backplane>, catalog: Arc<Catalog>, config: OverlayConfig) -> Self {
        Self {
            store,
            catalog,
            config,
        }
    }

    /// Persist a run patch and rewrite the run's IR.
    ///
    /// The patch chains onto the previous run patch, or onto the run's
    /// base artifact for the first one. Returns the recorded [`RunPatch`].
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::RunNotFound`] for an unknown run; catalog
    /// errors for a malformed chain; [`CoordinatorError::Rejected`] when
    /// strict connectivity checking is on and the patch adds islands.
    pub async fn apply_run_patch(
        &self,
        run_id: Uuid,
        ops_blob: &CasId,
        creator: &str,
        origin_node: Option<String>,
    ) -> Result<RunPatch, CoordinatorError> {
        let record = self
            .store
            .get_json::<RunRecord>(&keys::run_record(run_id))
            .await?
            .ok_or(CoordinatorError::RunNotFound(run_id))?;

        let patches: Vec<RunPatch> = self
            .store
            .get_json(&keys::run_patches(run_id))
            .await?
            .unwrap_or_default();

        let parent = match patches.last() {
            Some(last) => last.artifact_id,
            None => self.base_artifact(&record).await?,
        };

        let before = if self.config.reject_disconnected {
            Some(self.materialized_doc(parent).await?)
        } else {
            None
        };

        let seq = patches.len() as u64 + 1;
        let artifact = self
            .catalog
            .create_patch(parent, ops_blob, &format!("run-patch-{seq}"), creator)
            .await?;

        let (base, chain) = self.catalog.resolve_artifact(artifact.id).await?;
        let doc_value = self.catalog.materialize(&base, &chain).await?;

        if let Some(before) = before {
            let after: WorkflowDoc = serde_json::from_value(doc_value.clone())?;
            let islands = wfk_ir::disconnected_additions(&before, &after);
            if !islands.is_empty() {
                return Err(CoordinatorError::Rejected {
                    run_id,
                    reason: format!("patch adds disconnected nodes: {}", islands.join(", ")),
                });
            }
        }

        let ir = wfk_ir::compile_value(
            &doc_value,
            IrMetadata {
                owner: record.owner.clone(),
                tag: ir_tag(&record),
            },
        )?;
        self.store
            .set_json(&keys::ir(run_id), &ir, Some(self.config.ir_ttl))
            .await?;

        let patch = RunPatch {
            run_id,
            seq,
            artifact_id: artifact.id,
            created_by: creator.to_string(),
            origin_node,
            created_at: chrono::Utc::now(),
        };
        let mut patches = patches;
        patches.push(patch.clone());
        self.store
            .set_json(&keys::run_patches(run_id), &patches, None)
            .await?;

        info!(
            target: "wfk.coordinator",
            %run_id,
            seq,
            artifact = %artifact.id,
            "run patch applied, IR rewritten"
        );
        Ok(patch)
    }

    /// The artifact a run's first patch chains onto: the tag position
    /// captured at submission (not the tag's current position), or the
    /// pinned artifact id.
    async fn base_artifact(&self, record: &RunRecord) -> Result<Uuid, CoordinatorError> {
        match &record.base {
            BaseRef::Artifact { id } => Ok(*id),
            BaseRef::Tag { name } => match record.tag_snapshot.get(name) {
                Some(id) => Ok(*id),
                None => {
                    let tag = self.catalog.tag(&record.owner, name).await?;
                    Ok(tag.target_id)
                }
            },
        }
    }

    async fn materialized_doc(&self, artifact: Uuid) -> Result<WorkflowDoc, CoordinatorError> {
        let (base, chain) = self.catalog.resolve_artifact(artifact).await?;
        let value: Value = self.catalog.materialize(&base, &chain).await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn ir_tag(record: &RunRecord) -> String {
    match &record.base {
        BaseRef::Tag { name } => name.clone(),
        BaseRef::Artifact { .. } => String::new(),
    }
}
