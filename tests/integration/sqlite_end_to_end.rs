#![allow(missing_docs)]

use std::sync::Arc;

use sqldao::executor::{Statement, StatementExecutor};
use sqldao::{BindingContext, Dao, DaoConfig, DaoError, ExecOptions, SqliteExecutor, Value};

const SCHEMA: &str = "
    CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, created_at INTEGER);
    CREATE TABLE tags (user_id INTEGER NOT NULL, tag TEXT NOT NULL);
";

const CONFIG: &str = r#"
    name = "users"
    refresh_filters = ["insert", "re:^(delete|tag)_"]

    [cache]
    capacity = 16

    [methods.insert_users]
    kind = "write"
    is_batch = true
    batch_size = 2
    timestamped = true
    sql = "INSERT INTO {table -> users} (id, name, created_at) VALUES (:id, :name, :_timestamp)"

    [methods.insert_users_atomic]
    kind = "write"
    is_batch = true
    batch_size = 2
    sql = "INSERT INTO users (id, name) VALUES (:id, :name)"
    transaction = {}

    [methods.tag_user]
    kind = "write"
    sql = "INSERT INTO tags (user_id, tag) VALUES (:user.id, :tag)"

    [methods.find_by_ids]
    sql = "SELECT id, name FROM users WHERE id IN (:ids) ORDER BY id"

    [methods.count_users]
    sql = "SELECT COUNT(*) AS n FROM users"
    cached = false

    [methods.with_tags]
    sql = """
        SELECT u.id, u.name, t.tag AS "tags"
        FROM users u LEFT JOIN tags t ON t.user_id = u.id
        ORDER BY u.id, t.rowid
    """
    merge = { identity = ["id"], nested = [{ property = "tags", prefix = "tags", scalar = true }] }

    [methods.delete_user]
    kind = "write"
    sql = "DELETE FROM users WHERE id = :id"
"#;

fn setup() -> (SqliteExecutor, Dao) {
    let db = SqliteExecutor::open_in_memory().unwrap();
    db.execute_script(SCHEMA).unwrap();
    let dao = Dao::new(DaoConfig::from_toml_str(CONFIG).unwrap(), Arc::new(db.clone()))
        .unwrap()
        .with_transactions(Arc::new(db.transactions()));
    (db, dao)
}

fn ints(values: &[i64]) -> Value {
    Value::List(values.iter().copied().map(Value::Int).collect())
}

fn strs(values: &[&str]) -> Value {
    Value::List(values.iter().map(|s| Value::from(*s)).collect())
}

fn count(dao: &Dao) -> i64 {
    match dao.query("count_users", &BindingContext::new()).unwrap()[0]
        .as_object()
        .and_then(|row| row.get("n"))
    {
        Some(Value::Int(n)) => *n,
        other => panic!("unexpected count {other:?}"),
    }
}

#[test]
fn batch_insert_then_cached_read() {
    let (db, dao) = setup();
    let args = BindingContext::new()
        .with_param("id", ints(&[1, 2, 3]))
        .with_param("name", strs(&["ann", "bob", "cy"]));
    assert_eq!(dao.update("insert_users", &args).unwrap(), 3);

    let ids = BindingContext::new().with_param("ids", ints(&[1, 3]));
    let first = dao.query("find_by_ids", &ids).unwrap();
    let names: Vec<&Value> = first
        .iter()
        .map(|row| &row.as_object().unwrap()["name"])
        .collect();
    assert_eq!(names, [&Value::from("ann"), &Value::from("cy")]);

    // Bypass the DAO; the cached read must not see this write.
    db.update(&Statement {
        sql: "UPDATE users SET name = 'zed' WHERE id = 1",
        values: &[],
        options: ExecOptions::default(),
    })
    .unwrap();
    assert_eq!(dao.query("find_by_ids", &ids).unwrap(), first);

    let delete = BindingContext::new().with_param("id", 2);
    assert_eq!(dao.update("delete_user", &delete).unwrap(), 1);
    let fresh = dao.query("find_by_ids", &ids).unwrap();
    assert_eq!(fresh[0].as_object().unwrap()["name"], Value::from("zed"));

    let stats = dao.cache().unwrap().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.invalidations, 2);
}

#[test]
fn timestamp_is_bound_for_every_unit() {
    let (_db, dao) = setup();
    let args = BindingContext::new()
        .with_param("id", ints(&[10, 11]))
        .with_param("name", strs(&["a", "b"]));
    dao.update("insert_users", &args).unwrap();

    let conflicting = args.clone().with_param("_timestamp", 5);
    let err = dao.update("insert_users", &conflicting).unwrap_err();
    assert!(matches!(err, DaoError::ReservedParameterConflict { .. }));
    assert_eq!(count(&dao), 2);
}

#[test]
fn failed_chunk_keeps_earlier_chunks_without_transaction() {
    let (_db, dao) = setup();
    let args = BindingContext::new()
        .with_param("id", ints(&[1, 2, 1, 4, 5]))
        .with_param("name", strs(&["a", "b", "c", "d", "e"]));
    match dao.update("insert_users", &args).unwrap_err() {
        DaoError::BatchChunkFailed {
            chunk,
            units,
            unresolved,
            ..
        } => {
            assert_eq!(chunk, 1);
            assert_eq!(units, 2..4);
            assert_eq!(unresolved, 2..5);
        }
        other => panic!("expected chunk failure, got {other}"),
    }
    assert_eq!(count(&dao), 2);
}

#[test]
fn failed_chunk_rolls_back_inside_transaction() {
    let (_db, dao) = setup();
    let args = BindingContext::new()
        .with_param("id", ints(&[1, 2, 1, 4, 5]))
        .with_param("name", strs(&["a", "b", "c", "d", "e"]));
    let err = dao.update("insert_users_atomic", &args).unwrap_err();
    assert_eq!(err.code(), "BatchChunkFailed");
    assert_eq!(count(&dao), 0);
}

#[test]
fn mismatched_columns_execute_nothing() {
    let (_db, dao) = setup();
    let args = BindingContext::new()
        .with_param("id", ints(&[1, 2, 3]))
        .with_param("name", strs(&["a", "b", "c", "d"]));
    let err = dao.update("insert_users", &args).unwrap_err();
    assert_eq!(err.code(), "BatchCardinalityMismatch");
    assert_eq!(count(&dao), 0);
}

#[test]
fn join_rows_merge_into_entities() {
    let (_db, dao) = setup();
    dao.update(
        "insert_users",
        &BindingContext::new()
            .with_param("id", ints(&[1, 2]))
            .with_param("name", strs(&["ann", "bob"])),
    )
    .unwrap();
    let ann = Value::object([("id", Value::Int(1))]);
    for tag in ["a", "b"] {
        dao.update(
            "tag_user",
            &BindingContext::new().with_param("user", ann.clone()).with_param("tag", tag),
        )
        .unwrap();
    }

    let users = dao.query("with_tags", &BindingContext::new()).unwrap();
    assert_eq!(users.len(), 2);
    let first = users[0].as_object().unwrap();
    assert_eq!(first["tags"], strs(&["a", "b"]));
    let second = users[1].as_object().unwrap();
    assert_eq!(second["name"], Value::from("bob"));
    assert_eq!(second["tags"], Value::List(vec![]));
}

#[test]
fn empty_id_list_renders_null() {
    let (_db, dao) = setup();
    let plan = dao
        .plan("find_by_ids", &BindingContext::new().with_param("ids", ints(&[])))
        .unwrap();
    assert_eq!(plan.sql(), "SELECT id, name FROM users WHERE id IN (NULL) ORDER BY id");
    assert!(dao
        .query("find_by_ids", &BindingContext::new().with_param("ids", ints(&[])))
        .unwrap()
        .is_empty());
}
