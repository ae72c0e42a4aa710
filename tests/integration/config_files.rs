#![allow(missing_docs)]

use std::fs;
use std::sync::Arc;

use sqldao::{BindingContext, Dao, DaoConfig, SqliteExecutor, Value};
use tempfile::TempDir;

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("dao.toml");
    fs::write(&path, body).expect("write config");
    path
}

#[test]
fn loads_and_runs_config_from_disk() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(
        &dir,
        r#"
        name = "reports"

        [methods.sorted]
        sql = "SELECT v FROM nums ORDER BY {order -> v ASC}"
        define_with_named_parameter = true
        "#,
    );
    let config = DaoConfig::load(&path).unwrap();
    assert_eq!(config.name, "reports");

    let db = SqliteExecutor::open(dir.path().join("data.db")).unwrap();
    db.execute_script("CREATE TABLE nums (v INTEGER); INSERT INTO nums VALUES (2), (1), (3);")
        .unwrap();
    let dao = Dao::new(config, Arc::new(db)).unwrap();

    let values = |ctx: &BindingContext| -> Vec<Value> {
        dao.query("sorted", ctx)
            .unwrap()
            .iter()
            .map(|row| row.as_object().unwrap()["v"].clone())
            .collect()
    };
    assert_eq!(values(&BindingContext::new()), [Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert_eq!(
        values(&BindingContext::new().with_define("order", "v DESC")),
        [Value::Int(3), Value::Int(2), Value::Int(1)]
    );
    assert_eq!(
        values(&BindingContext::new().with_param("order", "v DESC")),
        [Value::Int(3), Value::Int(2), Value::Int(1)]
    );
}

#[test]
fn invalid_files_report_config_errors() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, "[cache]\ncapacity = \"lots\"\n");
    assert_eq!(DaoConfig::load(&path).unwrap_err().code(), "InvalidConfig");

    let path = write_config(&dir, "[methods.bad]\nsql = \"SELECT {oops\"\n");
    assert_eq!(DaoConfig::load(&path).unwrap_err().code(), "TemplateSyntaxError");
}
