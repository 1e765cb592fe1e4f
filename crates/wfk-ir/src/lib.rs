// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workflow documents and their compiled intermediate representation.
//!
//! The wire shape is a `{nodes, edges}` JSON document. The IR is the
//! runtime-only compiled form the coordinator routes from: per-node
//! dependency lists, precomputed terminal flags, and typed branch/loop
//! substructures, persisted per run and re-read on every completion signal
//! so mid-run patches take effect without interrupting in-flight work.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use wfk_core::{CasId, NodeKind};

/// Version stamp embedded in every compiled IR.
pub const IR_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from parsing or compiling a workflow document.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// The workflow fails structural invariants.
    #[error("workflow validation failed: {}", reasons.join("; "))]
    Validation {
        /// Individual failure messages.
        reasons: Vec<String>,
    },

    /// The document could not be parsed.
    #[error("malformed workflow document: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Wire document
// ---------------------------------------------------------------------------

/// The JSON wire shape of a workflow definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDoc {
    /// Node definitions.
    #[serde(default)]
    pub nodes: Vec<NodeDef>,

    /// Directed edges between node ids.
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

/// One node in a workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeDef {
    /// Unique node id.
    pub id: String,

    /// Executable type.
    #[serde(rename = "type")]
    pub kind: NodeKind,

    /// Free-form node configuration.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,

    /// Routing rules for conditional nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchSpec>,

    /// Iteration control for loop nodes.
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,
}

/// A directed edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EdgeDef {
    /// Source node id.
    pub from: String,
    /// Destination node id.
    pub to: String,
}

/// Branch routing: rules evaluated in declaration order, first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BranchSpec {
    /// Ordered rules.
    pub rules: Vec<BranchRule>,

    /// Successors when no rule matches. Empty means the path terminates.
    #[serde(default)]
    pub default: Vec<String>,
}

/// One branch rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BranchRule {
    /// Predicate over the node's result document.
    pub when: String,

    /// Successors taken when the predicate holds.
    pub next_nodes: Vec<String>,
}

/// Loop iteration control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LoopSpec {
    /// Iteration ceiling; `0` routes to `timeout_path` on first completion.
    pub max_iterations: u32,

    /// Node re-entered while the condition holds.
    pub loop_back_to: String,

    /// Continuation predicate over the node's result document.
    pub condition: String,

    /// Successors when the condition stops holding.
    #[serde(default)]
    pub break_path: Vec<String>,

    /// Successors when `max_iterations` is exceeded.
    #[serde(default)]
    pub timeout_path: Vec<String>,
}

// ---------------------------------------------------------------------------
// IR
// ---------------------------------------------------------------------------

/// Where a node's resolved config lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ConfigSource {
    /// Small configs embed directly.
    Inline {
        /// The configuration value.
        value: Value,
    },
    /// Large configs live in the blob store.
    Blob {
        /// Content address of the config blob.
        cas_id: CasId,
    },
}

/// A compiled node record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IrNode {
    /// Node id.
    pub id: String,

    /// Executable type.
    pub kind: NodeKind,

    /// Resolved configuration.
    pub config: ConfigSource,

    /// Direct predecessors (edge sources).
    pub dependencies: Vec<String>,

    /// Direct successors (edge destinations).
    pub dependents: Vec<String>,

    /// `true` when the node has no successors of any kind.
    pub is_terminal: bool,

    /// Branch substructure, when the node routes conditionally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchSpec>,

    /// Loop substructure, when the node iterates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,
}

impl IrNode {
    /// `true` when more than one edge leads into this node.
    #[must_use]
    pub fn is_join(&self) -> bool {
        self.dependencies.len() > 1
    }
}

/// Compilation metadata carried with the IR.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IrMetadata {
    /// Owning username.
    pub owner: String,

    /// Tag the run was submitted against (empty for artifact refs).
    pub tag: String,
}

/// The compiled, runtime-only shape of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Ir {
    /// IR format version.
    pub version: u32,

    /// Node records keyed by id.
    pub nodes: BTreeMap<String, IrNode>,

    /// Compilation metadata.
    pub metadata: IrMetadata,
}

impl Ir {
    /// Look up a node record.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&IrNode> {
        self.nodes.get(id)
    }

    /// Nodes with no dependencies, in id order.
    #[must_use]
    pub fn entry_nodes(&self) -> Vec<&IrNode> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.is_empty())
            .collect()
    }

    /// Node ids whose inline config serializes larger than `limit` bytes.
    #[must_use]
    pub fn oversized_configs(&self, limit: usize) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| match &n.config {
                ConfigSource::Inline { value } => {
                    !value.is_null()
                        && serde_json::to_string(value).map_or(false, |s| s.len() > limit)
                }
                ConfigSource::Blob { .. } => false,
            })
            .map(|n| n.id.clone())
            .collect()
    }

    /// Swap a node's inline config for a blob reference.
    ///
    /// Returns the displaced inline value, or `None` when the node is
    /// unknown or already externalized.
    pub fn externalize_config(&mut self, node_id: &str, cas_id: CasId) -> Option<Value> {
        let node = self.nodes.get_mut(node_id)?;
        match std::mem::replace(&mut node.config, ConfigSource::Blob { cas_id }) {
            ConfigSource::Inline { value } => Some(value),
            blob @ ConfigSource::Blob { .. } => {
                node.config = blob;
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Compile a workflow document into its IR.
///
/// Validates structural invariants first: unique node ids, edges over known
/// nodes, at least one entry and one terminal node, branch/loop targets
/// that exist, and no cycles outside loop nodes.
///
/// # Errors
///
/// Returns [`IrError::Validation`] listing every violated invariant.
pub fn compile(doc: &WorkflowDoc, metadata: IrMetadata) -> Result<Ir, IrError> {
    validate(doc)?;

    let mut nodes: BTreeMap<String, IrNode> = doc
        .nodes
        .iter()
        .map(|n| {
            (
                n.id.clone(),
                IrNode {
                    id: n.id.clone(),
                    kind: n.kind,
                    config: ConfigSource::Inline {
                        value: n.config.clone(),
                    },
                    dependencies: Vec::new(),
                    dependents: Vec::new(),
                    is_terminal: false,
                    branch: n.branch.clone(),
                    loop_spec: n.loop_spec.clone(),
                },
            )
        })
        .collect();

    for edge in &doc.edges {
        if let Some(n) = nodes.get_mut(&edge.to) {
            n.dependencies.push(edge.from.clone());
        }
        if let Some(n) = nodes.get_mut(&edge.from) {
            n.dependents.push(edge.to.clone());
        }
    }

    for node in nodes.values_mut() {
        node.dependencies.sort();
        node.dependencies.dedup();
        node.dependents.sort();
        node.dependents.dedup();
        node.is_terminal = node.dependents.is_empty()
            && node.branch.as_ref().is_none_or(|b| {
                b.default.is_empty() && b.rules.iter().all(|r| r.next_nodes.is_empty())
            })
            && node
                .loop_spec
                .as_ref()
                .is_none_or(|l| l.break_path.is_empty() && l.timeout_path.is_empty());
    }

    Ok(Ir {
        version: IR_VERSION,
        nodes,
        metadata,
    })
}

/// Parse a workflow JSON value and compile it.
///
/// # Errors
///
/// Returns [`IrError::Malformed`] on parse failure, or any [`compile`] error.
pub fn compile_value(value: &Value, metadata: IrMetadata) -> Result<Ir, IrError> {
    let doc: WorkflowDoc = serde_json::from_value(value.clone())?;
    compile(&doc, metadata)
}

/// Check a document's structural invariants without compiling.
///
/// # Errors
///
/// Returns [`IrError::Validation`] listing every violated invariant.
pub fn validate(doc: &WorkflowDoc) -> Result<(), IrError> {
    let mut reasons = Vec::new();

    let mut ids = BTreeSet::new();
    for node in &doc.nodes {
        if node.id.is_empty() {
            reasons.push("node with empty id".to_string());
        }
        if !ids.insert(node.id.as_str()) {
            reasons.push(format!("duplicate node id `{}`", node.id));
        }
    }

    let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
    let mut outgoing: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for edge in &doc.edges {
        for end in [edge.from.as_str(), edge.to.as_str()] {
            if !ids.contains(end) {
                reasons.push(format!("edge references unknown node `{end}`"));
            }
        }
        *incoming.entry(edge.to.as_str()).or_default() += 1;
        outgoing.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }

    let has_entry = doc
        .nodes
        .iter()
        .any(|n| incoming.get(n.id.as_str()).copied().unwrap_or(0) == 0);
    if !doc.nodes.is_empty() && !has_entry {
        reasons.push("workflow has no entry node".to_string());
    }
    if doc.nodes.is_empty() {
        reasons.push("workflow has no nodes".to_string());
    }

    let has_terminal = doc
        .nodes
        .iter()
        .any(|n| outgoing.get(n.id.as_str()).is_none_or(Vec::is_empty));
    if !doc.nodes.is_empty() && !has_terminal {
        reasons.push("workflow has no terminal node".to_string());
    }

    for node in &doc.nodes {
        if let Some(branch) = &node.branch {
            let targets = branch
                .rules
                .iter()
                .flat_map(|r| r.next_nodes.iter())
                .chain(branch.default.iter());
            for target in targets {
                if !ids.contains(target.as_str()) {
                    reasons.push(format!(
                        "branch on `{}` targets unknown node `{target}`",
                        node.id
                    ));
                }
            }
        }
        if let Some(spec) = &node.loop_spec {
            if !ids.contains(spec.loop_back_to.as_str()) {
                reasons.push(format!(
                    "loop on `{}` re-enters unknown node `{}`",
                    node.id, spec.loop_back_to
                ));
            }
            for target in spec.break_path.iter().chain(spec.timeout_path.iter()) {
                if !ids.contains(target.as_str()) {
                    reasons.push(format!(
                        "loop on `{}` targets unknown node `{target}`",
                        node.id
                    ));
                }
            }
        }
    }

    // Edge cycles are legal only when they pass through a loop node.
    let loop_nodes: BTreeSet<&str> = doc
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::Loop || n.loop_spec.is_some())
        .map(|n| n.id.as_str())
        .collect();
    for cycle in find_cycles(&ids, &outgoing) {
        if !cycle.iter().any(|n| loop_nodes.contains(n)) {
            reasons.push(format!("cycle outside loop nodes: {}", cycle.join(" -> ")));
        }
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(IrError::Validation { reasons })
    }
}

/// Collect one representative cycle per back edge found by DFS.
fn find_cycles<'a>(
    ids: &BTreeSet<&'a str>,
    outgoing: &BTreeMap<&'a str, Vec<&'a str>>,
) -> Vec<Vec<&'a str>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit<'a>(
        node: &'a str,
        outgoing: &BTreeMap<&'a str, Vec<&'a str>>,
        colors: &mut BTreeMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<&'a str>>,
    ) {
        colors.insert(node, Color::Gray);
        stack.push(node);
        for &next in outgoing.get(node).map_or(&[][..], Vec::as_slice) {
            match colors.get(next).copied().unwrap_or(Color::White) {
                Color::White => visit(next, outgoing, colors, stack, cycles),
                Color::Gray => {
                    if let Some(start) = stack.iter().position(|&n| n == next) {
                        cycles.push(stack[start..].to_vec());
                    }
                }
                Color::Black => {}
            }
        }
        stack.pop();
        colors.insert(node, Color::Black);
    }

    let mut colors = BTreeMap::new();
    let mut cycles = Vec::new();
    for &id in ids {
        if colors.get(id).copied().unwrap_or(Color::White) == Color::White {
            let mut stack = Vec::new();
            visit(id, outgoing, &mut colors, &mut stack, &mut cycles);
        }
    }
    cycles
}

// ---------------------------------------------------------------------------
// Patch connectivity
// ---------------------------------------------------------------------------

/// Node ids added by a patch that no edge connects to the pre-patch graph.
///
/// Unreachable additions are permitted by the coordinator (they never
/// execute); callers wanting stricter intake reject when this is non-empty.
#[must_use]
pub fn disconnected_additions(base: &WorkflowDoc, patched: &WorkflowDoc) -> Vec<String> {
    let existing: BTreeSet<&str> = base.nodes.iter().map(|n| n.id.as_str()).collect();
    let mut connected: BTreeSet<&str> = existing.clone();
    let added: Vec<&str> = patched
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !existing.contains(id))
        .collect();

    // New nodes connect transitively: an addition wired to a connected node
    // (in either direction) is connected itself.
    loop {
        let mut grew = false;
        for edge in &patched.edges {
            let (from, to) = (edge.from.as_str(), edge.to.as_str());
            if connected.contains(from) && !connected.contains(to) {
                connected.insert(to);
                grew = true;
            }
            if connected.contains(to) && !connected.contains(from) {
                connected.insert(from);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    added
        .into_iter()
        .filter(|id| !connected.contains(id))
        .map(str::to_string)
        .collect()
}
