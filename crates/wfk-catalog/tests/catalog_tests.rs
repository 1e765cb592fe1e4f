// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tests for the version & patch store: blobs, artifacts, tags, chains,
//! materialization, and compaction.

use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;
use wfk_catalog::{ArtifactKind, Catalog, CatalogError};
use wfk_core::{CasId, MediaType, canonical_json_hash};
use wfk_store::MemoryStore;

fn catalog() -> Catalog {
    Catalog::new(Arc::new(MemoryStore::new()))
}

fn base_doc() -> Value {
    json!({
        "nodes": [
            {"id": "a", "type": "function"},
            {"id": "b", "type": "function"}
        ],
        "edges": [{"from": "a", "to": "b"}]
    })
}

async fn put_doc(catalog: &Catalog, doc: &Value) -> CasId {
    catalog
        .put_blob(&serde_json::to_vec(doc).unwrap(), MediaType::Dag)
        .await
        .unwrap()
}

async fn put_ops(catalog: &Catalog, ops: Value) -> CasId {
    catalog
        .put_blob(&serde_json::to_vec(&ops).unwrap(), MediaType::PatchOps)
        .await
        .unwrap()
}

/// Ops adding one node and one edge wiring it to `from`.
fn add_node_ops(id: &str, from: &str) -> Value {
    json!([
        {"op": "add", "path": "/nodes/-", "value": {"id": id, "type": "function"}},
        {"op": "add", "path": "/edges/-", "value": {"from": from, "to": id}}
    ])
}

// ── Blobs ──────────────────────────────────────────────────────────

#[tokio::test]
async fn put_blob_deduplicates_on_hash() {
    let catalog = catalog();
    let a = catalog.put_blob(b"same bytes", MediaType::Dag).await.unwrap();
    let b = catalog.put_blob(b"same bytes", MediaType::Dag).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(catalog.blob_bytes(&a).await.unwrap(), b"same bytes");
}

#[tokio::test]
async fn missing_blob_is_not_found() {
    let catalog = catalog();
    let ghost = CasId::from_bytes(b"never stored");
    assert!(matches!(
        catalog.blob_bytes(&ghost).await.unwrap_err(),
        CatalogError::NotFound { kind: "blob", .. }
    ));
}

// ── Artifacts & chains ─────────────────────────────────────────────

#[tokio::test]
async fn dag_version_counts_and_hash() {
    let catalog = catalog();
    let blob = put_doc(&catalog, &base_doc()).await;
    let artifact = catalog.create_dag_version(&blob, "demo", "alice").await.unwrap();
    assert_eq!(artifact.kind, ArtifactKind::DagVersion);
    assert_eq!(artifact.nodes_count, 2);
    assert_eq!(artifact.edges_count, 1);
    assert_eq!(artifact.depth, 0);
    assert!(artifact.base_version.is_none());
}

#[tokio::test]
async fn version_hash_is_order_insensitive() {
    let catalog = catalog();
    let forward = put_doc(&catalog, &base_doc()).await;
    let shuffled = put_doc(
        &catalog,
        &json!({
            "edges": [{"from": "a", "to": "b"}],
            "nodes": [
                {"id": "b", "type": "function"},
                {"id": "a", "type": "function"}
            ]
        }),
    )
    .await;
    let v1 = catalog.create_dag_version(&forward, "x", "alice").await.unwrap();
    let v2 = catalog.create_dag_version(&shuffled, "y", "alice").await.unwrap();
    assert_eq!(v1.version_hash, v2.version_hash);
}

#[tokio::test]
async fn patch_chains_extend_transactionally() {
    let catalog = catalog();
    let blob = put_doc(&catalog, &base_doc()).await;
    let base = catalog.create_dag_version(&blob, "demo", "alice").await.unwrap();

    let ops1 = put_ops(&catalog, add_node_ops("c", "b")).await;
    let p1 = catalog.create_patch(base.id, &ops1, "add c", "alice").await.unwrap();
    assert_eq!(p1.depth, 1);
    assert_eq!(p1.base_version, Some(base.id));
    assert_eq!(p1.op_count, 2);
    assert_eq!(catalog.chain_members(p1.id).await.unwrap(), vec![p1.id]);

    let ops2 = put_ops(&catalog, add_node_ops("d", "c")).await;
    let p2 = catalog.create_patch(p1.id, &ops2, "add d", "alice").await.unwrap();
    assert_eq!(p2.depth, 2);
    assert_eq!(p2.base_version, Some(base.id));
    assert_eq!(
        catalog.chain_members(p2.id).await.unwrap(),
        vec![p1.id, p2.id]
    );
}

#[tokio::test]
async fn patch_on_missing_parent_fails() {
    let catalog = catalog();
    let ops = put_ops(&catalog, json!([])).await;
    assert!(matches!(
        catalog
            .create_patch(Uuid::new_v4(), &ops, "orphan", "alice")
            .await
            .unwrap_err(),
        CatalogError::NotFound { kind: "artifact", .. }
    ));
}

// ── Tags ───────────────────────────────────────────────────────────

#[tokio::test]
async fn move_tag_is_cas_guarded() {
    let catalog = catalog();
    let blob = put_doc(&catalog, &base_doc()).await;
    let v1 = catalog.create_dag_version(&blob, "one", "alice").await.unwrap();
    let blob2 = put_doc(&catalog, &json!({"nodes": [{"id": "x", "type": "function"}], "edges": []})).await;
    let v2 = catalog.create_dag_version(&blob2, "two", "alice").await.unwrap();

    let version = catalog.move_tag("alice", "main", v1.id, 0, "alice").await.unwrap();
    assert_eq!(version, 1);

    // Stale expected version loses.
    let err = catalog.move_tag("alice", "main", v2.id, 0, "alice").await.unwrap_err();
    assert!(matches!(err, CatalogError::Conflict { expected: 0, found: 1, .. }));

    let version = catalog.move_tag("alice", "main", v2.id, 1, "alice").await.unwrap();
    assert_eq!(version, 2);

    let moves = catalog.tag_moves("alice", "main").await.unwrap();
    assert_eq!(moves.len(), 2);
    assert_eq!(moves[0].from_target, None);
    assert_eq!(moves[1].from_target, Some(v1.id));
    assert_eq!(moves[1].to_target, v2.id);
}

#[tokio::test]
async fn tag_kind_mirrors_target_artifact() {
    let catalog = catalog();
    let blob = put_doc(&catalog, &base_doc()).await;
    let base = catalog.create_dag_version(&blob, "demo", "alice").await.unwrap();
    let ops = put_ops(&catalog, add_node_ops("c", "b")).await;
    let patch = catalog.create_patch(base.id, &ops, "p", "alice").await.unwrap();

    catalog.move_tag("alice", "head", patch.id, 0, "alice").await.unwrap();
    let tag = catalog.tag("alice", "head").await.unwrap();
    assert_eq!(tag.target_kind, ArtifactKind::PatchSet);
    assert_eq!(tag.target_hash, patch.version_hash);
}

#[tokio::test]
async fn user_isolation_is_exact_match() {
    let catalog = catalog();
    let blob = put_doc(&catalog, &base_doc()).await;
    let base = catalog.create_dag_version(&blob, "demo", "ali").await.unwrap();
    catalog.move_tag("ali", "main", base.id, 0, "ali").await.unwrap();

    // A prefix of an existing username must not resolve the tag.
    assert!(matches!(
        catalog.tag("alice", "main").await.unwrap_err(),
        CatalogError::NotFound { kind: "tag", .. }
    ));
    assert!(catalog.tag("ali", "main").await.is_ok());
}

#[tokio::test]
async fn undo_then_redo_round_trips() {
    let catalog = catalog();
    let blob_a = put_doc(&catalog, &base_doc()).await;
    let a = catalog.create_dag_version(&blob_a, "a", "alice").await.unwrap();
    let blob_b = put_doc(&catalog, &json!({"nodes": [{"id": "solo", "type": "function"}], "edges": []})).await;
    let b = catalog.create_dag_version(&blob_b, "b", "alice").await.unwrap();

    catalog.move_tag("alice", "main", a.id, 0, "alice").await.unwrap();
    catalog.move_tag("alice", "main", b.id, 1, "alice").await.unwrap();

    // undo(move(A -> B)) restores A with version bumped again.
    let version = catalog.undo_tag("alice", "main", "alice").await.unwrap();
    assert_eq!(version, 3);
    assert_eq!(catalog.tag("alice", "main").await.unwrap().target_id, a.id);

    // redo(undo(...)) restores B.
    let version = catalog.redo_tag("alice", "main", "alice").await.unwrap();
    assert_eq!(version, 4);
    assert_eq!(catalog.tag("alice", "main").await.unwrap().target_id, b.id);

    // Every transition left exactly one log row.
    assert_eq!(catalog.tag_moves("alice", "main").await.unwrap().len(), 4);
}

#[tokio::test]
async fn undo_at_history_start_fails() {
    let catalog = catalog();
    let blob = put_doc(&catalog, &base_doc()).await;
    let a = catalog.create_dag_version(&blob, "a", "alice").await.unwrap();
    catalog.move_tag("alice", "main", a.id, 0, "alice").await.unwrap();
    assert!(matches!(
        catalog.undo_tag("alice", "main", "alice").await.unwrap_err(),
        CatalogError::NothingToUndo { .. }
    ));
    assert!(matches!(
        catalog.redo_tag("alice", "main", "alice").await.unwrap_err(),
        CatalogError::NothingToRedo { .. }
    ));
}

#[tokio::test]
async fn regular_move_truncates_redo_tail() {
    let catalog = catalog();
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let blob = put_doc(
            &catalog,
            &json!({"nodes": [{"id": name, "type": "function"}], "edges": []}),
        )
        .await;
        ids.push(catalog.create_dag_version(&blob, name, "alice").await.unwrap().id);
    }
    catalog.move_tag("alice", "main", ids[0], 0, "alice").await.unwrap();
    catalog.move_tag("alice", "main", ids[1], 1, "alice").await.unwrap();
    catalog.undo_tag("alice", "main", "alice").await.unwrap();
    // A fresh move clears the redoable entry for ids[1].
    catalog.move_tag("alice", "main", ids[2], 3, "alice").await.unwrap();
    assert!(matches!(
        catalog.redo_tag("alice", "main", "alice").await.unwrap_err(),
        CatalogError::NothingToRedo { .. }
    ));
}

// ── Materialization ────────────────────────────────────────────────

#[tokio::test]
async fn materialize_applies_chain_in_order() {
    let catalog = catalog();
    let blob = put_doc(&catalog, &base_doc()).await;
    let base = catalog.create_dag_version(&blob, "demo", "alice").await.unwrap();
    let ops1 = put_ops(&catalog, add_node_ops("c", "b")).await;
    let p1 = catalog.create_patch(base.id, &ops1, "add c", "alice").await.unwrap();
    let ops2 = put_ops(&catalog, add_node_ops("d", "c")).await;
    let p2 = catalog.create_patch(p1.id, &ops2, "add d", "alice").await.unwrap();

    catalog.move_tag("alice", "main", p2.id, 0, "alice").await.unwrap();
    let (resolved_base, chain) = catalog.resolve_tag("alice", "main").await.unwrap();
    assert_eq!(resolved_base.id, base.id);
    assert_eq!(chain.len(), 2);

    let doc = catalog.materialize(&resolved_base, &chain).await.unwrap();
    let ids: Vec<&str> = doc["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn materialize_is_deterministic() {
    let catalog = catalog();
    let blob = put_doc(&catalog, &base_doc()).await;
    let base = catalog.create_dag_version(&blob, "demo", "alice").await.unwrap();
    let ops = put_ops(&catalog, add_node_ops("c", "b")).await;
    let patch = catalog.create_patch(base.id, &ops, "p", "alice").await.unwrap();

    let (b, chain) = catalog.resolve_artifact(patch.id).await.unwrap();
    let once = catalog.materialize(&b, &chain).await.unwrap();
    let twice = catalog.materialize(&b, &chain).await.unwrap();
    assert_eq!(once, twice);
    assert_eq!(
        canonical_json_hash(&once).unwrap(),
        canonical_json_hash(&twice).unwrap()
    );
}

#[tokio::test]
async fn malformed_patch_reports_seq_and_op_index() {
    let catalog = catalog();
    let blob = put_doc(&catalog, &base_doc()).await;
    let base = catalog.create_dag_version(&blob, "demo", "alice").await.unwrap();
    let bad_ops = put_ops(
        &catalog,
        json!([
            {"op": "add", "path": "/nodes/-", "value": {"id": "c", "type": "function"}},
            {"op": "remove", "path": "/nodes/42"}
        ]),
    )
    .await;
    let patch = catalog.create_patch(base.id, &bad_ops, "bad", "alice").await.unwrap();

    let (b, chain) = catalog.resolve_artifact(patch.id).await.unwrap();
    let err = catalog.materialize(&b, &chain).await.unwrap_err();
    let CatalogError::PatchApply { seq, op_index, .. } = err else {
        panic!("expected PatchApply, got {err}");
    };
    assert_eq!(seq, 1);
    assert_eq!(op_index, 1);
}

#[tokio::test]
async fn snapshot_cache_reuses_by_plan_hash() {
    let catalog = catalog();
    let blob = put_doc(&catalog, &base_doc()).await;
    let base = catalog.create_dag_version(&blob, "demo", "alice").await.unwrap();
    let ops = put_ops(&catalog, add_node_ops("c", "b")).await;
    let patch = catalog.create_patch(base.id, &ops, "p", "alice").await.unwrap();

    let (b, chain) = catalog.resolve_artifact(patch.id).await.unwrap();
    let (doc1, snap1) = catalog.materialize_cached(&b, &chain, "alice").await.unwrap();
    let (doc2, snap2) = catalog.materialize_cached(&b, &chain, "alice").await.unwrap();
    assert_eq!(snap1, snap2);
    assert_eq!(doc1, doc2);

    let snapshot = catalog.artifact(snap1).await.unwrap();
    assert_eq!(snapshot.kind, ArtifactKind::RunSnapshot);
    assert_eq!(snapshot.version_hash, canonical_json_hash(&doc1).unwrap());
}

#[tokio::test]
async fn compact_produces_equivalent_base() {
    let catalog = catalog();
    let blob = put_doc(&catalog, &base_doc()).await;
    let base = catalog.create_dag_version(&blob, "demo", "alice").await.unwrap();
    let ops = put_ops(&catalog, add_node_ops("c", "b")).await;
    let patch = catalog.create_patch(base.id, &ops, "p", "alice").await.unwrap();

    let compacted = catalog.compact(patch.id, "alice").await.unwrap();
    assert_eq!(compacted.kind, ArtifactKind::DagVersion);
    assert_eq!(compacted.compacted_from_id, Some(patch.id));

    // The compacted base materializes to the same document as the chain.
    let (b, chain) = catalog.resolve_artifact(patch.id).await.unwrap();
    let from_chain = catalog.materialize(&b, &chain).await.unwrap();
    let (cb, cchain) = catalog.resolve_artifact(compacted.id).await.unwrap();
    let from_base = catalog.materialize(&cb, &cchain).await.unwrap();
    assert_eq!(from_chain, from_base);
    assert_eq!(compacted.version_hash, canonical_json_hash(&from_chain).unwrap());

    // Old patches are not removed by compaction.
    assert!(catalog.artifact(patch.id).await.is_ok());
}

// ── Plan hash ──────────────────────────────────────────────────────

#[test]
fn plan_hash_is_deterministic_and_input_sensitive() {
    let base = Uuid::new_v4();
    let chain = vec![Uuid::new_v4(), Uuid::new_v4()];
    let h1 = Catalog::plan_hash(base, &chain, "");
    let h2 = Catalog::plan_hash(base, &chain, "");
    assert_eq!(h1, h2);

    let reordered = vec![chain[1], chain[0]];
    assert_ne!(h1, Catalog::plan_hash(base, &reordered, ""));
    assert_ne!(h1, Catalog::plan_hash(base, &chain, "opts"));
    assert_ne!(h1, Catalog::plan_hash(Uuid::new_v4(), &chain, ""));
}
