// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the Workflow Kernel.
//!
//! This crate provides [`KernelConfig`] — the top-level runtime settings —
//! together with helpers for loading from TOML files, merging overlays, and
//! producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A deadline is unusually large.
    LargeDeadline {
        /// Worker type.
        worker: String,
        /// Deadline value in seconds.
        secs: u64,
    },
    /// The supervisor scans less often than it times runs out.
    SlowSupervisorScan {
        /// Scan interval in seconds.
        scan_secs: u64,
        /// Inactivity timeout in seconds.
        timeout_secs: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeDeadline { worker, secs } => {
                write!(f, "deadline for `{worker}` workers is {secs}s — runs may hang long")
            }
            ConfigWarning::SlowSupervisorScan { scan_secs, timeout_secs } => {
                write!(
                    f,
                    "supervisor scans every {scan_secs}s but times out after {timeout_secs}s — detection will lag"
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Queue/stream consumption settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct QueueSettings {
    /// Consumer group name shared by kernel services.
    pub group: String,

    /// Stream read block timeout in seconds.
    pub block_timeout_secs: u64,

    /// Un-ACKed messages become redeliverable after this many seconds.
    pub redeliver_after_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            group: "wfk".to_string(),
            block_timeout_secs: 5,
            redeliver_after_secs: 30,
        }
    }
}

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Number of coordinator shards.
    pub shards: u32,

    /// Publish `node_failed` events for failed completions.
    pub emit_node_failed: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            shards: 1,
            emit_node_failed: false,
        }
    }
}

/// Initializer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct InitializerSettings {
    /// IR and idempotency-mark TTL in seconds.
    pub ir_ttl_secs: u64,

    /// Node configs above this many serialized bytes move to the blob store.
    pub inline_config_limit: usize,
}

impl Default for InitializerSettings {
    fn default() -> Self {
        Self {
            ir_ttl_secs: 24 * 60 * 60,
            inline_config_limit: 8 * 1024,
        }
    }
}

/// Per-worker-type execution deadlines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WorkerSettings {
    /// Function/transform worker deadline in seconds.
    pub function_deadline_secs: u64,

    /// HTTP worker deadline in seconds.
    pub http_deadline_secs: u64,

    /// Agent worker deadline in seconds (LLM calls run long).
    pub agent_deadline_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            function_deadline_secs: 30,
            http_deadline_secs: 30,
            agent_deadline_secs: 300,
        }
    }
}

/// Supervisor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Time between scans in seconds.
    pub scan_interval_secs: u64,

    /// Inactivity timeout in seconds.
    pub inactivity_timeout_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            inactivity_timeout_secs: 5 * 60,
        }
    }
}

/// Catalog garbage collection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GcSettings {
    /// Snapshot indexes newer than this many days pin their artifacts.
    pub reachability_days: i64,

    /// Artifacts younger than this many days are never deleted.
    pub safety_window_days: i64,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            reachability_days: 30,
            safety_window_days: 7,
        }
    }
}

// ---------------------------------------------------------------------------
// KernelConfig
// ---------------------------------------------------------------------------

/// Top-level runtime settings for the Workflow Kernel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct KernelConfig {
    /// Queue/stream consumption settings.
    pub queues: QueueSettings,

    /// Coordinator settings.
    pub coordinator: CoordinatorSettings,

    /// Initializer settings.
    pub initializer: InitializerSettings,

    /// Per-worker-type deadlines.
    pub workers: WorkerSettings,

    /// Supervisor settings.
    pub supervisor: SupervisorSettings,

    /// Garbage collection settings.
    pub gc: GcSettings,
}

impl KernelConfig {
    /// Load a config from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse a config from TOML text.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ParseError`] on malformed TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Load a base config and merge an overlay file on top, table by table.
    ///
    /// # Errors
    ///
    /// File or parse errors from either file.
    pub fn load_with_overlay(
        base: impl AsRef<Path>,
        overlay: impl AsRef<Path>,
    ) -> Result<Self, ConfigError> {
        let read = |p: &Path| {
            std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })
        };
        let parse = |text: &str| {
            text.parse::<toml::Value>().map_err(|e| ConfigError::ParseError {
                reason: e.to_string(),
            })
        };
        let mut base_value = parse(&read(base.as_ref())?)?;
        let overlay_value = parse(&read(overlay.as_ref())?)?;
        merge_toml(&mut base_value, overlay_value);
        base_value
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                reason: e.to_string(),
            })
    }

    /// Check semantic invariants, returning advisory warnings on success.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] listing every problem.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        if self.coordinator.shards == 0 {
            reasons.push("coordinator.shards must be at least 1".to_string());
        }
        if self.queues.block_timeout_secs == 0 {
            reasons.push("queues.block_timeout_secs must be positive".to_string());
        }
        if self.queues.redeliver_after_secs == 0 {
            reasons.push("queues.redeliver_after_secs must be positive".to_string());
        }
        if self.initializer.ir_ttl_secs == 0 {
            reasons.push("initializer.ir_ttl_secs must be positive".to_string());
        }
        if self.supervisor.inactivity_timeout_secs == 0 {
            reasons.push("supervisor.inactivity_timeout_secs must be positive".to_string());
        }
        if self.gc.reachability_days < 0 || self.gc.safety_window_days < 0 {
            reasons.push("gc windows must be non-negative".to_string());
        }
        for (worker, secs) in [
            ("function", self.workers.function_deadline_secs),
            ("http", self.workers.http_deadline_secs),
            ("agent", self.workers.agent_deadline_secs),
        ] {
            if secs == 0 {
                reasons.push(format!("workers.{worker}_deadline_secs must be positive"));
            }
        }
        if !reasons.is_empty() {
            return Err(ConfigError::ValidationError { reasons });
        }

        let mut warnings = Vec::new();
        for (worker, secs) in [
            ("function", self.workers.function_deadline_secs),
            ("http", self.workers.http_deadline_secs),
            ("agent", self.workers.agent_deadline_secs),
        ] {
            if secs > 3600 {
                warnings.push(ConfigWarning::LargeDeadline {
                    worker: worker.to_string(),
                    secs,
                });
            }
        }
        if self.supervisor.scan_interval_secs > self.supervisor.inactivity_timeout_secs {
            warnings.push(ConfigWarning::SlowSupervisorScan {
                scan_secs: self.supervisor.scan_interval_secs,
                timeout_secs: self.supervisor.inactivity_timeout_secs,
            });
        }
        Ok(warnings)
    }

    /// Stream read block timeout as a [`Duration`].
    #[must_use]
    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.queues.block_timeout_secs)
    }

    /// IR TTL as a [`Duration`].
    #[must_use]
    pub fn ir_ttl(&self) -> Duration {
        Duration::from_secs(self.initializer.ir_ttl_secs)
    }

    /// Deadline for a worker type name as a [`Duration`]; unknown types
    /// get the function deadline.
    #[must_use]
    pub fn worker_deadline(&self, worker: &str) -> Duration {
        let secs = match worker {
            "http" => self.workers.http_deadline_secs,
            "agent" => self.workers.agent_deadline_secs,
            _ => self.workers.function_deadline_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Recursive table merge: overlay scalars and arrays replace, tables merge.
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}
