#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

const CONFIG: &str = r#"
[methods.add]
kind = "write"
sql = "INSERT INTO items (id, label) VALUES (:id, :label)"

[methods.by_ids]
sql = "SELECT id, label FROM items WHERE id IN (:ids) ORDER BY id"
"#;

fn setup() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("items.toml");
    fs::write(&config, CONFIG).expect("write config");
    fs::write(
        dir.path().join("schema.sql"),
        "CREATE TABLE IF NOT EXISTS items (id INTEGER PRIMARY KEY, label TEXT);",
    )
    .expect("write schema");
    (dir, config)
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json output")
}

#[test]
fn compile_lists_parameters() {
    let output = cargo_bin_cmd!("sqldao")
        .args(["--format", "json", "compile"])
        .arg("SELECT * FROM {table} WHERE id = :user.id AND ts > :since")
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&output);
    assert_eq!(json["params"], serde_json::json!(["user.id", "since"]));
    assert_eq!(json["defines"], serde_json::json!(["table"]));
}

#[test]
fn compile_reports_syntax_errors() {
    let output = cargo_bin_cmd!("sqldao")
        .args(["compile", "SELECT :a..b"])
        .assert()
        .failure()
        .get_output()
        .clone();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("[TemplateSyntaxError]"), "{stderr}");
}

#[test]
fn bind_prints_plan() {
    let (_dir, config) = setup();
    let output = cargo_bin_cmd!("sqldao")
        .args(["--format", "json", "bind", "--method", "by_ids", "--args", r#"{"ids":[3,1]}"#])
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&output);
    assert_eq!(json["sql"], "SELECT id, label FROM items WHERE id IN (?, ?) ORDER BY id");
    assert_eq!(json["values"], serde_json::json!([3, 1]));
}

#[test]
fn run_writes_then_reads() {
    let (dir, config) = setup();
    let db = dir.path().join("items.db");
    let schema = dir.path().join("schema.sql");

    cargo_bin_cmd!("sqldao")
        .args(["run", "--method", "add", "--args", r#"{"id":1,"label":"first"}"#])
        .arg("--config")
        .arg(&config)
        .arg("--db")
        .arg(&db)
        .arg("--init")
        .arg(&schema)
        .assert()
        .success();

    let output = cargo_bin_cmd!("sqldao")
        .args(["--format", "json", "run", "--method", "by_ids", "--args", r#"{"ids":[1]}"#])
        .arg("--config")
        .arg(&config)
        .arg("--db")
        .arg(&db)
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&output);
    assert_eq!(json, serde_json::json!([{ "id": 1, "label": "first" }]));
}

