#![allow(missing_docs)]

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

#[test]
fn stress_reports_a_verified_tree() {
    let output = cargo_bin_cmd!("treelock")
        .args(["--format", "json", "stress"])
        .args(["--threads", "2", "--ops", "500", "--keys", "64", "--node-capacity", "4"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["verified"].as_bool(), Some(true));
    assert_eq!(json["threads"].as_u64(), Some(2));
    assert_eq!(json["mismatches"].as_u64(), Some(0));
    assert!(json["stats"]["searches"].as_u64().unwrap_or(0) > 0);
    assert!(json["height"].as_u64().unwrap_or(0) >= 1);
}

#[test]
fn dump_prints_nodes_and_walk() {
    let output = cargo_bin_cmd!("treelock")
        .args(["dump", "--keys", "10", "--node-capacity", "3"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8 output");
    assert!(text.starts_with("height "));
    assert!(text.contains("level 1"));
    assert!(text.contains("walk"));
    assert!(text.contains("9:0"));
}

#[test]
fn dump_json_walks_leftward_on_request() {
    let output = cargo_bin_cmd!("treelock")
        .args(["--format", "json", "dump", "--keys", "6", "--direction", "leftward"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    let keys: Vec<&str> = json["walk"]
        .as_array()
        .expect("walk array")
        .iter()
        .filter(|entry| entry["level"].as_u64() == Some(1))
        .filter_map(|entry| entry["key"].as_str())
        .collect();
    assert_eq!(keys, ["5:0", "4:0", "3:0", "2:0", "1:0", "0:0"]);
}

#[test]
fn config_file_overrides_defaults() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("tree.toml");
    fs::write(&path, "node_capacity = 8\ncache_slots = 0\n").expect("write config");
    let output = cargo_bin_cmd!("treelock")
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8 output");
    assert!(text.contains("node_capacity = 8"));
    assert!(text.contains("cache_slots = 0"));
    assert!(text.contains("restart_limit = 10000"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("bad.toml");
    fs::write(&path, "node_capacity = 1\n").expect("write config");
    cargo_bin_cmd!("treelock")
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure()
        .code(1);

    cargo_bin_cmd!("treelock")
        .args(["--config", "/nonexistent/tree.toml", "config"])
        .assert()
        .failure();
}
