// SPDX-License-Identifier: MIT OR Apache-2.0
//! Supervisor: reclaims runs that stopped making progress.
//!
//! A periodic scan finds RUNNING runs whose `last_event_at` is older than
//! the inactivity timeout, marks them failed with the counter value in the
//! reason, deletes their volatile keys, and publishes `workflow_failed`.
//! Runs waiting on human approval are exempt — those waits are indefinite
//! by design.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;
use wfk_core::event::{WorkflowEvent, WorkflowEventKind};
use wfk_core::{RunRecord, RunStatus, keys};
use wfk_store::{Backplane, CancellationToken, StoreError, StoreExt};

/// Errors from the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The store failed mid-scan; the next tick retries.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A payload failed to serialize.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Settings for the supervisor loop.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between scans.
    pub scan_interval: Duration,

    /// A RUNNING run with no signal activity for this long is reclaimed.
    pub inactivity_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// The supervisor service.
pub struct Supervisor {
    store: Arc<dyn Backplane>,
    config: SupervisorConfig,
}

impl Supervisor {
    /// Create a supervisor over the shared backplane.
    pub fn new(store: Arc<dyn Backplane>, config: SupervisorConfig) -> Self {
        Self { store, config }
    }

    /// Scan periodically until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Store`] only when a scan fails
    /// unrecoverably; individual run failures are logged and skipped.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        info!(
            target: "wfk.supervisor",
            interval_s = self.config.scan_interval.as_secs(),
            timeout_s = self.config.inactivity_timeout.as_secs(),
            "supervisor started"
        );
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(target: "wfk.supervisor", "supervisor stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.scan_once(Utc::now()).await?;
                }
            }
        }
    }

    /// Run one scan. Returns the number of reclaimed runs.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<usize, SupervisorError> {
        let cutoff = now
            - ChronoDuration::from_std(self.config.inactivity_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let mut reclaimed = 0;

        for key in self.store.kv_scan("run:record:").await? {
            let Some(record) = self.store.get_json::<RunRecord>(&key).await? else {
                continue;
            };
            if record.status != RunStatus::Running || record.last_event_at > cutoff {
                continue;
            }
            self.reclaim(record).await?;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn reclaim(&self, mut record: RunRecord) -> Result<(), SupervisorError> {
        let run_id = record.run_id;
        let counter = self.store.run_counter(run_id).await?;
        let reason = format!("timeout: no activity, counter={counter}");
        warn!(target: "wfk.supervisor", %run_id, counter, "reclaiming stuck run");

        record.status = RunStatus::Failed;
        record.ended_at = Some(Utc::now());
        record.failure_reason = Some(reason.clone());
        self.store
            .set_json(&keys::run_record(run_id), &record, None)
            .await?;
        self.store
            .set_json(&keys::run_status(run_id), &record.status, None)
            .await?;

        self.cleanup_run_keys(run_id).await?;

        self.store
            .publish(
                &keys::events_channel(&record.owner),
                serde_json::to_value(&WorkflowEvent::now(
                    run_id,
                    WorkflowEventKind::WorkflowFailed { reason },
                ))?,
            )
            .await?;
        Ok(())
    }

    async fn cleanup_run_keys(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.store.kv_delete(&keys::ir(run_id)).await?;
        self.store.counter_clear(run_id).await?;
        self.store.hash_delete(&keys::context(run_id)).await?;
        for prefix in [
            format!("loop:{run_id}:"),
            format!("pending_tokens:{run_id}:"),
        ] {
            for key in self.store.hash_scan(&prefix).await? {
                self.store.hash_delete(&key).await?;
            }
        }
        Ok(())
    }
}
