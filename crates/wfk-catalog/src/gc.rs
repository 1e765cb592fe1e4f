// SPDX-License-Identifier: MIT OR Apache-2.0
//! Garbage collection of unreachable artifacts and orphaned blobs.
//!
//! An artifact is reachable when a tag points at it, when it appears in a
//! recent run-snapshot index, or transitively through `base_version` and
//! chain membership from a reachable artifact. Deep reachability analysis
//! (walking run histories in an analytic store) is out of scope here.

use crate::catalog::{Catalog, keys};
use crate::records::{ArtifactRecord, TagRecord};
use crate::CatalogError;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use tracing::info;
use uuid::Uuid;
use wfk_store::StoreExt;

/// Garbage collection settings.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Snapshot indexes newer than this many days keep their artifacts.
    pub reachability_days: i64,

    /// Artifacts younger than this many days are never deleted, reachable
    /// or not.
    pub safety_window_days: i64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            reachability_days: 30,
            safety_window_days: 7,
        }
    }
}

/// What one collection pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Artifacts examined.
    pub examined: usize,

    /// Artifacts found reachable.
    pub reachable: usize,

    /// Artifacts deleted.
    pub deleted_artifacts: usize,

    /// Blobs deleted after the artifact sweep.
    pub deleted_blobs: usize,
}

impl Catalog {
    /// Run one garbage collection pass.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Store`] on backend failure; a partial sweep
    /// is safe to re-run.
    pub async fn collect_garbage(
        &self,
        config: &GcConfig,
        now: DateTime<Utc>,
    ) -> Result<GcReport, CatalogError> {
        let store = self.store();

        // Roots: every tag target.
        let mut roots: BTreeSet<Uuid> = BTreeSet::new();
        for key in store.kv_scan(keys::TAG_PREFIX).await? {
            if let Some(tag) = store.get_json::<TagRecord>(&key).await? {
                roots.insert(tag.target_id);
            }
        }

        // Roots: snapshot indexes inside the reachability window.
        for days_back in 0..=config.reachability_days {
            let date = (now - Duration::days(days_back)).date_naive();
            for member in store.set_members(&keys::snapshot_index(date)).await? {
                if let Ok(id) = member.parse::<Uuid>() {
                    roots.insert(id);
                }
            }
        }

        // Transitive closure over base_version and chain membership.
        let mut reachable: BTreeSet<Uuid> = BTreeSet::new();
        let mut worklist: Vec<Uuid> = roots.into_iter().collect();
        while let Some(id) = worklist.pop() {
            if !reachable.insert(id) {
                continue;
            }
            let Some(artifact) = store
                .get_json::<ArtifactRecord>(&keys::artifact(id))
                .await?
            else {
                continue;
            };
            if let Some(base) = artifact.base_version {
                worklist.push(base);
            }
            worklist.extend(self.chain_members(id).await?);
        }

        // Sweep artifacts outside the safety window.
        let cutoff = now - Duration::days(config.safety_window_days);
        let mut report = GcReport::default();
        for key in store.kv_scan(keys::ARTIFACT_PREFIX).await? {
            let Some(artifact) = store.get_json::<ArtifactRecord>(&key).await? else {
                continue;
            };
            report.examined += 1;
            if reachable.contains(&artifact.id) {
                report.reachable += 1;
                continue;
            }
            if artifact.created_at > cutoff {
                continue;
            }
            store.kv_delete(&key).await?;
            store.kv_delete(&keys::chain(artifact.id)).await?;
            report.deleted_artifacts += 1;
        }

        // Sweep blobs no surviving artifact references.
        let mut referenced: BTreeSet<String> = BTreeSet::new();
        for key in store.kv_scan(keys::ARTIFACT_PREFIX).await? {
            if let Some(artifact) = store.get_json::<ArtifactRecord>(&key).await? {
                referenced.insert(artifact.blob_id.to_string());
            }
        }
        for key in store.kv_scan(keys::BLOB_META_PREFIX).await? {
            let cas = key.trim_start_matches(keys::BLOB_META_PREFIX).to_string();
            if referenced.contains(&cas) {
                continue;
            }
            store.kv_delete(&key).await?;
            store.blob_delete(&cas).await?;
            report.deleted_blobs += 1;
        }

        info!(
            target: "wfk.catalog",
            examined = report.examined,
            reachable = report.reachable,
            deleted_artifacts = report.deleted_artifacts,
            deleted_blobs = report.deleted_blobs,
            "garbage collection pass finished"
        );
        Ok(report)
    }
}
