//! End-to-end runs of the `depup` subcommands against files on disk

use depup_cli::{command, run};
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const ONE_NODE: &str = r#"{"nodes": {"n1": {"type": "t"}}}"#;

const TWO_NODES: &str = r"
nodes:
  n1:
    type: t
    relationships:
      - { type: connected_to, target_id: n2 }
  n2:
    type: t
";

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn invoke(args: &[&str]) -> anyhow::Result<String> {
    let matches = command().try_get_matches_from(std::iter::once("depup").chain(args.iter().copied()))?;
    run(&matches)
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn check_reports_counts() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "two.yaml", TWO_NODES);
    let out = invoke(&["check", arg(&file)]).unwrap();
    assert!(out.ends_with(&format!("ok (2 nodes, 1 relationships, hash {})", hash_of(&file))), "{out}");
}

fn hash_of(path: &Path) -> String {
    depup_cli::load_topology(path).unwrap().hash().short()
}

#[test]
fn check_rejects_dangling_relationship() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "bad.json",
        r#"{"nodes": {"n1": {"type": "t", "relationships": [{"type": "r", "target_id": "nope"}]}}}"#,
    );
    let err = invoke(&["check", arg(&file)]).unwrap_err();
    assert!(format!("{err:#}").contains("undeclared node"), "{err:#}");
}

#[test]
fn unknown_extension_is_rejected() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "topology.txt", ONE_NODE);
    let err = invoke(&["check", arg(&file)]).unwrap_err();
    assert!(err.to_string().contains("unsupported topology format"));
}

#[test]
fn diff_of_identical_files_is_empty() {
    let dir = TempDir::new().unwrap();
    let json = write(&dir, "a.json", ONE_NODE);
    let yaml = write(&dir, "a.yml", "nodes:\n  n1: { type: t }\n");
    assert_eq!(invoke(&["diff", arg(&json), arg(&yaml)]).unwrap(), "no changes");
}

#[test]
fn diff_lists_changes_as_json() {
    let dir = TempDir::new().unwrap();
    let old = write(&dir, "old.json", ONE_NODE);
    let new = write(&dir, "new.yaml", TWO_NODES);
    let out = invoke(&["diff", arg(&old), arg(&new), "--json"]).unwrap();
    let changes: Value = serde_json::from_str(&out).unwrap();
    let changes = changes.as_array().unwrap();
    assert_eq!(changes.len(), 2);
    assert!(changes
        .iter()
        .any(|c| c["entity_type"] == "relationship" && c["entity_id"] == "n1::n2"));
}

#[test]
fn plan_orders_node_before_relationship() {
    let dir = TempDir::new().unwrap();
    let old = write(&dir, "old.json", ONE_NODE);
    let new = write(&dir, "new.yaml", TWO_NODES);
    let out = invoke(&["plan", arg(&old), arg(&new)]).unwrap();
    assert_eq!(
        out,
        "  1. ADD node n2\n  2. ADD relationship n1::n2\ninstances:\n  n2: 0 -> 1 (+1)"
    );
}

#[test]
fn plan_removal_uses_live_overrides() {
    let dir = TempDir::new().unwrap();
    let old = write(&dir, "old.yaml", TWO_NODES);
    let new = write(&dir, "new.json", ONE_NODE);
    let out = invoke(&["plan", arg(&old), arg(&new), "--live", "n2=3", "--json"]).unwrap();
    let plan: Value = serde_json::from_str(&out).unwrap();
    let steps: Vec<String> = plan["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| format!("{} {}", s["operation"].as_str().unwrap(), s["entity_id"].as_str().unwrap()))
        .collect();
    assert_eq!(steps, vec!["REMOVE n1::n2", "REMOVE n2"]);
    assert_eq!(plan["instance_deltas"]["n2"]["current"], 3);
    assert_eq!(plan["instance_deltas"]["n2"]["target"], 0);
}

#[test]
fn plan_without_changes() {
    let dir = TempDir::new().unwrap();
    let old = write(&dir, "old.json", ONE_NODE);
    assert_eq!(invoke(&["plan", arg(&old), arg(&old)]).unwrap(), "no changes required");
}

#[test]
fn plan_rejects_type_change() {
    let dir = TempDir::new().unwrap();
    let old = write(&dir, "old.json", ONE_NODE);
    let new = write(&dir, "new.json", r#"{"nodes": {"n1": {"type": "other"}}}"#);
    let err = invoke(&["plan", arg(&old), arg(&new)]).unwrap_err();
    assert!(format!("{err:#}").contains("unsupported changes"), "{err:#}");
}

#[test]
fn malformed_live_override_fails_parsing() {
    let dir = TempDir::new().unwrap();
    let old = write(&dir, "old.json", ONE_NODE);
    assert!(command()
        .try_get_matches_from(["depup", "plan", arg(&old), arg(&old), "--live", "n1"])
        .is_err());
}
