// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fanout events published on `workflow:events:{owner}`.
//!
//! The WebSocket fanout service consumes these verbatim; the `type` tag and
//! field names are wire-stable.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SignalStatus;

/// An event on an owner's fanout channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowEvent {
    /// The run the event concerns.
    pub run_id: Uuid,

    /// Publication timestamp.
    pub timestamp: DateTime<Utc>,

    /// Discriminated payload.
    #[serde(flatten)]
    pub kind: WorkflowEventKind,
}

impl WorkflowEvent {
    /// Wrap a payload with the current timestamp.
    #[must_use]
    pub fn now(run_id: Uuid, kind: WorkflowEventKind) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// The payload discriminator for [`WorkflowEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEventKind {
    /// Entry tokens have been emitted; the run is underway.
    WorkflowStarted {
        /// Tag the run was submitted against (empty for artifact refs).
        tag: String,
    },

    /// A node finished and the coordinator advanced the run.
    NodeCompleted {
        /// The node that finished.
        node_id: String,
        /// Completed or failed.
        status: SignalStatus,
        /// Counter value after this signal's ops were applied.
        counter: i64,
    },

    /// A node executor failed (published only when configured).
    NodeFailed {
        /// The node that failed.
        node_id: String,
        /// Wire-stable error kind label.
        error_type: String,
    },

    /// The counter reached zero; the run is complete.
    WorkflowCompleted {},

    /// The run was marked failed.
    WorkflowFailed {
        /// Human-readable reason.
        reason: String,
    },

    /// A HITL node parked and awaits a human decision.
    ApprovalRequired {
        /// The waiting node.
        node_id: String,
        /// Prompt shown to the approver.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tag_is_flattened() {
        let ev = WorkflowEvent::now(
            Uuid::now_v7(),
            WorkflowEventKind::WorkflowFailed {
                reason: "timeout: no activity, counter=2".into(),
            },
        );
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "workflow_failed");
        assert_eq!(v["reason"], "timeout: no activity, counter=2");
        assert!(v["run_id"].is_string());
    }

    #[test]
    fn node_completed_round_trips() {
        let ev = WorkflowEvent::now(
            Uuid::now_v7(),
            WorkflowEventKind::NodeCompleted {
                node_id: "score".into(),
                status: SignalStatus::Completed,
                counter: 1,
            },
        );
        let back: WorkflowEvent =
            serde_json::from_str(&serde_json::to_string(&ev).unwrap()).unwrap();
        assert_eq!(back, ev);
    }
}
