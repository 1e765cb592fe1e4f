// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stream names, store key namespaces, and deterministic op-keys.
//!
//! Every cross-process key the kernel writes is built here, so the full
//! namespace is auditable in one place.

use uuid::Uuid;

/// Stream names (wire-stable).
pub mod streams {
    /// Run submissions, consumed by the initializer.
    pub const RUN_REQUESTS: &str = "wf.run.requests";
    /// Completion signals, consumed by the coordinator.
    pub const COMPLETION_SIGNALS: &str = "wf.completion_signals";
    /// Tokens for HITL request-side workers.
    pub const TASKS_HITL: &str = "wf.tasks.hitl";
    /// Human decisions, consumed by the HITL response-side worker.
    pub const HITL_RESPONSES: &str = "wf.tasks.hitl.responses";
    /// Prefix for per-node-type task streams.
    pub const TASK_PREFIX: &str = "wf.tasks.";
}

/// IR for a run: `ir:{run}`.
#[must_use]
pub fn ir(run_id: Uuid) -> String {
    format!("ir:{run_id}")
}

/// One-shot idempotency mark set by the initializer: `run:started:{run}`.
#[must_use]
pub fn run_started(run_id: Uuid) -> String {
    format!("run:started:{run_id}")
}

/// Durable run record: `run:record:{run}`.
#[must_use]
pub fn run_record(run_id: Uuid) -> String {
    format!("run:record:{run_id}")
}

/// Mirrored run status: `run:{run}:status`.
#[must_use]
pub fn run_status(run_id: Uuid) -> String {
    format!("run:{run_id}:status")
}

/// Per-node status: `run:{run}:node:{id}:status`.
#[must_use]
pub fn node_status(run_id: Uuid, node_id: &str) -> String {
    format!("run:{run_id}:node:{node_id}:status")
}

/// Node result refs for interpolation: `context:{run}`.
#[must_use]
pub fn context(run_id: Uuid) -> String {
    format!("context:{run_id}")
}

/// Loop iteration state: `loop:{run}:{node}`.
#[must_use]
pub fn loop_state(run_id: Uuid, node_id: &str) -> String {
    format!("loop:{run_id}:{node_id}")
}

/// Join buffering hash: `pending_tokens:{run}:{node}`.
#[must_use]
pub fn pending_tokens(run_id: Uuid, node_id: &str) -> String {
    format!("pending_tokens:{run_id}:{node_id}")
}

/// HITL approval record: `hitl:approval:{run}:{node}`.
#[must_use]
pub fn hitl_approval(run_id: Uuid, node_id: &str) -> String {
    format!("hitl:approval:{run_id}:{node_id}")
}

/// Pending approvals for a workflow tag: `workflow:{owner}:{tag}:pending_approvals`.
#[must_use]
pub fn tag_pending_approvals(owner: &str, tag: &str) -> String {
    format!("workflow:{owner}:{tag}:pending_approvals")
}

/// Pending approvals for a run: `run:{run}:pending_approvals`.
#[must_use]
pub fn run_pending_approvals(run_id: Uuid) -> String {
    format!("run:{run_id}:pending_approvals")
}

/// Accumulated run patches: `run:{run}:patches`.
#[must_use]
pub fn run_patches(run_id: Uuid) -> String {
    format!("run:{run_id}:patches")
}

/// Owner fanout channel: `workflow:events:{owner}`.
#[must_use]
pub fn events_channel(owner: &str) -> String {
    format!("workflow:events:{owner}")
}

// ---------------------------------------------------------------------------
// Op-keys
// ---------------------------------------------------------------------------

/// Op-key for seeding the counter with the entry-node count.
#[must_use]
pub fn init_op(run_id: Uuid) -> String {
    format!("init:{run_id}")
}

/// Op-key for consuming a token that traveled `from -> to`.
///
/// The token id disambiguates repeat traversals of the same edge (loop
/// iterations re-enter their own node with fresh tokens).
#[must_use]
pub fn consume_op(run_id: Uuid, from_node: &str, to_node: &str, token_id: &str) -> String {
    format!("consume:{run_id}:{from_node}->{to_node}:{token_id}")
}

/// Op-key for emitting a token to a successor.
#[must_use]
pub fn emit_op(run_id: Uuid, to_node: &str, token_id: &str) -> String {
    format!("emit:{run_id}:{to_node}:{token_id}")
}

/// Op-key guarding the one-shot pending-approval decrement when a HITL
/// decision is resolved.
#[must_use]
pub fn hitl_resolve_op(run_id: Uuid, node_id: &str) -> String {
    format!("hitl:resolved:{run_id}:{node_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_keys_are_deterministic() {
        let run = Uuid::now_v7();
        assert_eq!(
            consume_op(run, "a", "b", "t1"),
            consume_op(run, "a", "b", "t1")
        );
        assert_ne!(
            consume_op(run, "a", "b", "t1"),
            consume_op(run, "a", "b", "t2")
        );
        assert_eq!(emit_op(run, "b", "t1"), format!("emit:{run}:b:t1"));
        assert_eq!(
            hitl_resolve_op(run, "approve"),
            format!("hitl:resolved:{run}:approve")
        );
    }

    #[test]
    fn key_namespaces_do_not_collide() {
        let run = Uuid::now_v7();
        let keys = [
            ir(run),
            run_started(run),
            run_record(run),
            run_status(run),
            node_status(run, "n"),
            context(run),
            loop_state(run, "n"),
            pending_tokens(run, "n"),
            hitl_approval(run, "n"),
            run_pending_approvals(run),
            run_patches(run),
        ];
        let unique: std::collections::BTreeSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
    }
}
