//! Integration tests for light-kubeconfig
//!
//! These tests exercise the public merge API with realistic kubeconfig
//! documents and the on-disk sync flow.

use light_kubeconfig::{merge_and_persist, KubeconfigDocument, KubeconfigMerger, MergeError};
use serde_json::json;
use tempfile::tempdir;

fn doc(value: serde_json::Value) -> KubeconfigDocument {
    KubeconfigDocument::from_value(value).unwrap()
}

// ============================================================================
// Merge Semantics
// ============================================================================

#[test]
fn test_merge_upserts_clusters_and_switches_context() {
    let target = doc(json!({
        "clusters": [{"name": "a", "x": 1}],
        "current-context": "a",
    }));
    let incoming = doc(json!({
        "clusters": [{"name": "a", "x": 2}, {"name": "b", "x": 3}],
        "users": [],
        "contexts": [],
        "current-context": "b",
    }));

    let mut merger = KubeconfigMerger::new(target);
    merger.merge(&incoming).unwrap();
    let merged = merger.into_document();

    assert_eq!(
        merged.entries("clusters"),
        &[json!({"name": "a", "x": 2}), json!({"name": "b", "x": 3})]
    );
    assert_eq!(merged.current_context(), Some("b"));
}

#[test]
fn test_merge_is_idempotent_for_named_entries() {
    let target = doc(json!({
        "apiVersion": "v1",
        "clusters": [{"name": "home", "cluster": {"server": "https://home:6443"}}],
        "users": [{"name": "home-admin", "user": {"token": "t0"}}],
        "contexts": [{"name": "home", "context": {"cluster": "home", "user": "home-admin"}}],
        "current-context": "home",
    }));
    let incoming = doc(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{"name": "light", "cluster": {"server": "https://eks:443"}}],
        "users": [{"name": "light", "user": {"token": "t1"}}],
        "contexts": [{"name": "light", "context": {"cluster": "light", "user": "light"}}],
        "current-context": "light",
    }));

    let mut once = KubeconfigMerger::new(target.clone());
    once.merge(&incoming).unwrap();

    let mut twice = KubeconfigMerger::new(target);
    twice.merge(&incoming).unwrap();
    twice.merge(&incoming).unwrap();

    assert_eq!(once.document(), twice.document());
    assert_eq!(once.document().entries("clusters").len(), 2);
    assert_eq!(once.document().entries("contexts").len(), 2);
}

#[test]
fn test_merge_preserves_position_of_replaced_entry() {
    let target = doc(json!({
        "contexts": [{"name": "x"}, {"name": "y", "v": 1}, {"name": "z"}],
        "current-context": "x",
    }));
    let mut merger = KubeconfigMerger::new(target);
    merger
        .merge(&doc(json!({"contexts": [{"name": "y", "v": 2}], "current-context": "y"})))
        .unwrap();

    let names: Vec<&str> = merger
        .document()
        .entries("contexts")
        .iter()
        .filter_map(|e| e["name"].as_str())
        .collect();
    assert_eq!(names, vec!["x", "y", "z"]);
    assert_eq!(merger.document().entry("contexts", "y").unwrap()["v"], 2);
}

#[test]
fn test_merge_rejects_non_list_incoming_section() {
    let mut merger = KubeconfigMerger::new(KubeconfigDocument::new());
    let err = merger
        .merge(&doc(json!({"users": {"name": "a"}, "current-context": "a"})))
        .unwrap_err();
    assert!(matches!(err, MergeError::SectionNotList { found: "mapping", .. }));
    assert!(merger.document().keys().is_empty());
}

// ============================================================================
// Persistence Flow
// ============================================================================

#[test]
fn test_merge_and_persist_writes_sorted_system_kubeconfig() {
    let dir = tempdir().unwrap();
    let system = dir.path().join(".kube").join("config");
    let cluster = dir.path().join("current_cluster").join("kubeconfig.yaml");

    std::fs::create_dir_all(system.parent().unwrap()).unwrap();
    std::fs::create_dir_all(cluster.parent().unwrap()).unwrap();
    std::fs::write(
        &system,
        "current-context: home\nclusters:\n- name: home\n  cluster:\n    server: https://home\n",
    )
    .unwrap();
    std::fs::write(
        &cluster,
        "apiVersion: v1\nkind: Config\ncurrent-context: light\nclusters:\n- name: light\n  cluster:\n    server: https://light\n",
    )
    .unwrap();

    let merged = merge_and_persist(&system, &cluster).unwrap();
    assert_eq!(merged.current_context(), Some("light"));

    let on_disk = KubeconfigDocument::load(&system).unwrap();
    assert_eq!(on_disk, merged);
    assert_eq!(on_disk.entries("clusters").len(), 2);

    let text = std::fs::read_to_string(&system).unwrap();
    let positions: Vec<usize> = ["apiVersion", "clusters", "current-context", "kind"]
        .iter()
        .map(|key| text.find(&format!("{key}:")).unwrap())
        .collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted);
}

#[test]
fn test_merge_and_persist_creates_missing_system_kubeconfig() {
    let dir = tempdir().unwrap();
    let system = dir.path().join("fresh").join("config");
    let cluster = dir.path().join("kubeconfig.yaml");
    std::fs::write(&cluster, "current-context: only\ncontexts:\n- name: only\n").unwrap();

    merge_and_persist(&system, &cluster).unwrap();

    let on_disk = KubeconfigDocument::load(&system).unwrap();
    assert_eq!(on_disk.current_context(), Some("only"));
}

#[test]
fn test_merge_and_persist_requires_cluster_kubeconfig() {
    let dir = tempdir().unwrap();
    let system = dir.path().join("config");
    std::fs::write(&system, "current-context: keep\n").unwrap();

    let err = merge_and_persist(&system, &dir.path().join("missing.yaml")).unwrap_err();
    assert!(matches!(err, MergeError::Document(_)));

    // The system kubeconfig is untouched on failure
    let on_disk = KubeconfigDocument::load(&system).unwrap();
    assert_eq!(on_disk.current_context(), Some("keep"));
}
