#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

const SMALL_CONFIG: &str = r#"
[pcm]
region_bytes = 1048576
log_pool_slots = 8
log_slot_words = 1024

[stm]
lock_array_log_size = 10
"#;

fn write_config(contents: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("mnemo.toml");
    fs::write(&path, contents).expect("write config");
    (dir, path)
}

fn run_json(config: &PathBuf, args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("mnemo-torture")
        .arg("--config")
        .arg(config)
        .args(["--quiet", "--format", "json", "--iterations", "20", "--threads", "2"])
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn crash_scenario_reports_no_violations() {
    let (_dir, config) = write_config(SMALL_CONFIG);
    let json = run_json(&config, &["crash"]);
    assert_eq!(json["iterations"], 20);
    assert_eq!(json["stores"], 20 * 256);
    assert_eq!(json["violations"], 0);
    assert!(json["flushed_words"].as_u64().unwrap_or(0) > 0);
}

#[test]
fn log_scenario_covers_both_encodings() {
    let (_dir, config) = write_config(SMALL_CONFIG);
    let json = run_json(&config, &["log"]);
    let runs = json["runs"].as_array().expect("runs array");
    let kinds: Vec<&str> = runs.iter().filter_map(|r| r["kind"].as_str()).collect();
    assert_eq!(kinds, ["base", "tornbit"]);
    for run in runs {
        assert_eq!(run["violations"], 0, "{run}");
        assert!(run["flushed_records"].as_u64().unwrap_or(0) >= 20);
    }

    let json = run_json(&config, &["log", "--kind", "tornbit"]);
    assert_eq!(json["runs"].as_array().map(Vec::len), Some(1));
}

#[test]
fn cdf_scenario_histograms_every_bucket() {
    let (_dir, config) = write_config(SMALL_CONFIG);
    let json = run_json(&config, &["cdf", "--uniform"]);
    assert_eq!(json["words_per_line"], 8);
    let buckets = json["buckets"].as_array().expect("buckets");
    assert_eq!(buckets.len(), 9);
    let observed: f64 = buckets
        .iter()
        .filter_map(|b| b["observed"].as_f64())
        .sum();
    assert!((observed - 1.0).abs() < 1e-9);
}

#[test]
fn stm_scenario_keeps_the_balance() {
    let (_dir, config) = write_config(SMALL_CONFIG);
    let json = run_json(&config, &["stm"]);
    assert_eq!(json["consistent"], true);
    assert_eq!(json["sum"], json["expected"]);
    assert_eq!(json["threads"], 2);
}

#[test]
fn text_output_ends_with_a_verdict() {
    let (_dir, config) = write_config(SMALL_CONFIG);
    let output = cargo_bin_cmd!("mnemo-torture")
        .arg("--config")
        .arg(&config)
        .args(["--theme", "plain", "--iterations", "5", "crash"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("Crash rollback"));
    assert!(text.contains("every flushed word survived"));
}

#[test]
fn unknown_config_keys_are_rejected() {
    let (_dir, config) = write_config("[pcm]\nregion_size = 12\n");
    cargo_bin_cmd!("mnemo-torture")
        .arg("--config")
        .arg(&config)
        .arg("crash")
        .assert()
        .code(1);
}
