#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn write_data(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("pets.json");
    fs::write(
        &path,
        r#"[
            {"id": 1, "name": "rex", "kind": "dog", "age": 3},
            {"id": 2, "name": "tom", "kind": "cat", "age": 5},
            {"id": 3, "name": "ace", "kind": "dog", "age": 7},
            {"id": 4, "name": "fig", "kind": "dog", "age": 1}
        ]"#,
    )
    .expect("write data");
    path
}

fn empty_config(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("config.toml");
    fs::write(&path, "").expect("write config");
    path
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json output")
}

#[test]
fn parse_prints_the_syntax_tree() {
    let dir = TempDir::new().expect("tempdir");
    let output = cargo_bin_cmd!("quarry")
        .arg("--config")
        .arg(empty_config(&dir))
        .args(["parse", "a = 1 and not b < 2"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert_eq!(text.trim(), "select * where (and (a = 1) (not (b < 2)))");
}

#[test]
fn explain_reports_plan_and_hash() {
    let dir = TempDir::new().expect("tempdir");
    let output = cargo_bin_cmd!("quarry")
        .arg("--config")
        .arg(empty_config(&dir))
        .args(["--format", "json", "explain", "a = 1 and b = 2"])
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&output);
    let plan = json["plan"].as_str().expect("plan text");
    assert!(plan.starts_with("Slice"), "unexpected plan: {plan}");
    assert_eq!(json["plan_hash"].as_str().map(str::len), Some(16));
    assert_eq!(json["tree"]["op"], "Slice");
}

#[test]
fn run_pages_through_the_data_file() {
    let dir = TempDir::new().expect("tempdir");
    let data = write_data(&dir);
    let config = empty_config(&dir);

    let first = cargo_bin_cmd!("quarry")
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "run", "select name where kind = 'dog'", "--limit", "2"])
        .arg("--data")
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .clone();
    let first = stdout_json(&first);
    let names: Vec<&str> = first["records"]
        .as_array()
        .expect("records")
        .iter()
        .filter_map(|r| r["name"].as_str())
        .collect();
    assert_eq!(names, ["rex", "ace"]);
    let cursor = first["cursor"].as_str().expect("cursor").to_owned();

    let second = cargo_bin_cmd!("quarry")
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "run", "select name where kind = 'dog'", "--limit", "2"])
        .arg("--data")
        .arg(&data)
        .args(["--cursor", &cursor])
        .assert()
        .success()
        .get_output()
        .clone();
    let second = stdout_json(&second);
    assert_eq!(second["records"], serde_json::json!([{"name": "fig"}]));
    assert!(second["cursor"].is_null());
}

#[test]
fn syntax_errors_exit_nonzero_with_a_code() {
    let dir = TempDir::new().expect("tempdir");
    let output = cargo_bin_cmd!("quarry")
        .arg("--config")
        .arg(empty_config(&dir))
        .args(["parse", "a = "])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("[UnexpectedEnd]"), "stderr was: {text}");
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("config.toml");
    fs::write(&config, "[query]\nmax_limit = 0\n").expect("write config");
    cargo_bin_cmd!("quarry")
        .arg("--config")
        .arg(&config)
        .args(["parse", "a = 1"])
        .assert()
        .failure();
}

#[test]
fn run_orders_by_a_property() {
    let dir = TempDir::new().expect("tempdir");
    let data = write_data(&dir);
    let config = empty_config(&dir);
    let query = "select name where kind = 'dog' order by age desc";

    let first = cargo_bin_cmd!("quarry")
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "run", query, "--limit", "2"])
        .arg("--data")
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .clone();
    let first = stdout_json(&first);
    assert_eq!(first["records"], serde_json::json!([{"name": "ace"}, {"name": "rex"}]));
    let cursor = first["cursor"].as_str().expect("cursor").to_owned();

    let second = cargo_bin_cmd!("quarry")
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "run", query, "--limit", "2", "--cursor", &cursor])
        .arg("--data")
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .clone();
    let second = stdout_json(&second);
    assert_eq!(second["records"], serde_json::json!([{"name": "fig"}]));
    assert!(second["cursor"].is_null());
}

#[test]
fn explain_shows_the_sort_node() {
    let dir = TempDir::new().expect("tempdir");
    let output = cargo_bin_cmd!("quarry")
        .arg("--config")
        .arg(empty_config(&dir))
        .args(["explain", "done = true order by age desc"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(
        text.starts_with("Sort by=age desc\n  Slice done=done [true, true]\n"),
        "unexpected plan: {text}"
    );
}
