//! [`StatementExecutor`] over a single rusqlite connection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{ArcReentrantMutexGuard, RawMutex, RawThreadId, ReentrantMutex};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use tracing::{trace, warn};

use crate::error::{DaoError, Result};
use crate::executor::{
    ExecOptions, RowStream, Statement, StatementExecutor, TransactionContext, TransactionScope,
    TxOptions, DRIVER_DEFAULT,
};
use crate::merge::Row;
use crate::value::Value;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Int(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Float(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Value::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::DateTime(ns) => {
                let ns = i64::try_from(*ns)
                    .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
                ToSqlOutput::Owned(SqlValue::Integer(ns))
            }
            composite @ (Value::List(_) | Value::Object(_)) => {
                let json = serde_json::to_string(composite)
                    .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
                ToSqlOutput::Owned(SqlValue::Text(json))
            }
        })
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn exec_err(err: rusqlite::Error) -> DaoError {
    DaoError::Execution(err.to_string())
}

fn tx_err(err: rusqlite::Error) -> DaoError {
    DaoError::Transaction(err.to_string())
}

// Busy timeout rusqlite gives every new connection.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type SharedConnection = Arc<ReentrantMutex<Connection>>;

/// SQLite-backed statement executor.
///
/// Queries are read eagerly while the connection lock is held and handed
/// out as an in-memory row stream. The lock is reentrant: while a
/// transaction scope is open, the thread that opened it keeps executing
/// and every other clone waits for the scope to finish.
#[derive(Clone)]
pub struct SqliteExecutor {
    conn: SharedConnection,
}

impl SqliteExecutor {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(exec_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(exec_err)?;
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Connection::open_in_memory()
            .map(Self::from_connection)
            .map_err(exec_err)
    }

    /// Wraps an existing connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(ReentrantMutex::new(conn)),
        }
    }

    /// Runs raw SQL (schema setup and the like).
    pub fn execute_script(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql).map_err(exec_err)
    }

    /// Transaction collaborator sharing this connection.
    pub fn transactions(&self) -> SqliteTransactions {
        SqliteTransactions {
            conn: Arc::clone(&self.conn),
        }
    }

    fn apply_timeout(conn: &Connection, options: ExecOptions) -> Result<()> {
        let timeout = match options.query_timeout {
            DRIVER_DEFAULT => DEFAULT_BUSY_TIMEOUT,
            secs => Duration::from_secs(u64::try_from(secs).unwrap_or(0)),
        };
        conn.busy_timeout(timeout).map_err(exec_err)
    }
}

impl StatementExecutor for SqliteExecutor {
    fn query(&self, stmt: &Statement<'_>) -> Result<RowStream> {
        let conn = self.conn.lock();
        Self::apply_timeout(&conn, stmt.options)?;
        let mut prepared = conn.prepare_cached(stmt.sql).map_err(exec_err)?;
        let columns: Arc<[String]> = prepared
            .column_names()
            .into_iter()
            .map(str::to_owned)
            .collect::<Vec<_>>()
            .into();
        let width = columns.len();
        let mut rows = prepared
            .query(params_from_iter(stmt.values.iter()))
            .map_err(exec_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(exec_err)? {
            let values = (0..width)
                .map(|idx| row.get_ref(idx).map(from_sql))
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(exec_err)?;
            out.push(Ok(Row::new(Arc::clone(&columns), values)));
        }
        trace!(sql = stmt.sql, rows = out.len(), "sqlite query");
        Ok(Box::new(out.into_iter()))
    }

    fn update(&self, stmt: &Statement<'_>) -> Result<u64> {
        let conn = self.conn.lock();
        Self::apply_timeout(&conn, stmt.options)?;
        let mut prepared = conn.prepare_cached(stmt.sql).map_err(exec_err)?;
        let changed = prepared
            .execute(params_from_iter(stmt.values.iter()))
            .map_err(exec_err)?;
        trace!(sql = stmt.sql, changed, "sqlite update");
        Ok(changed as u64)
    }

    fn update_batch(
        &self,
        sql: &str,
        rows: &[Vec<Value>],
        options: ExecOptions,
    ) -> Result<Vec<u64>> {
        let conn = self.conn.lock();
        Self::apply_timeout(&conn, options)?;
        let mut prepared = conn.prepare_cached(sql).map_err(exec_err)?;
        rows.iter()
            .map(|values| {
                prepared
                    .execute(params_from_iter(values.iter()))
                    .map(|n| n as u64)
                    .map_err(exec_err)
            })
            .collect()
    }
}

/// Transactions on the executor's connection.
///
/// Required and Supports join an open transaction and Nested uses a
/// savepoint inside one. A single connection cannot suspend a transaction,
/// so NotSupported and RequiresNew fail while one is open. Isolation is
/// fixed by SQLite and ignored.
///
/// An open scope holds the connection lock until it commits or rolls back.
pub struct SqliteTransactions {
    conn: SharedConnection,
}

enum ScopeKind {
    Joined,
    Top,
    Savepoint(&'static str),
}

const SAVEPOINT: &str = "sqldao_savepoint";

struct SqliteScope {
    conn: ArcReentrantMutexGuard<RawMutex, RawThreadId, Connection>,
    kind: ScopeKind,
    finished: bool,
}

impl TransactionContext for SqliteTransactions {
    fn begin(&self, options: TxOptions) -> Result<Box<dyn TransactionScope>> {
        use crate::executor::Propagation::*;

        let conn = self.conn.lock_arc();
        let active = !conn.is_autocommit();
        let kind = match (options.propagation, active) {
            (Required | Supports | Mandatory, true) => ScopeKind::Joined,
            (Supports | NotSupported | Never, false) => ScopeKind::Joined,
            (Mandatory, false) => {
                return Err(DaoError::Transaction("no active transaction for MANDATORY".into()))
            }
            (Never, true) => {
                return Err(DaoError::Transaction("transaction active for NEVER".into()))
            }
            (NotSupported | RequiresNew, true) => {
                return Err(DaoError::Transaction(format!(
                    "sqlite cannot suspend an open transaction for {:?}",
                    options.propagation
                )))
            }
            (Nested, true) => {
                conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT}")).map_err(tx_err)?;
                ScopeKind::Savepoint(SAVEPOINT)
            }
            (Required | RequiresNew | Nested, false) => {
                conn.execute_batch("BEGIN").map_err(tx_err)?;
                ScopeKind::Top
            }
        };
        Ok(Box::new(SqliteScope {
            conn,
            kind,
            finished: false,
        }))
    }
}

impl SqliteScope {
    fn finish(&mut self, commit: bool) -> Result<()> {
        self.finished = true;
        let sql = match (&self.kind, commit) {
            (ScopeKind::Joined, _) => return Ok(()),
            (ScopeKind::Top, true) => "COMMIT".to_owned(),
            (ScopeKind::Top, false) => "ROLLBACK".to_owned(),
            (ScopeKind::Savepoint(name), true) => format!("RELEASE {name}"),
            (ScopeKind::Savepoint(name), false) => {
                format!("ROLLBACK TO {name}; RELEASE {name}")
            }
        };
        self.conn.execute_batch(&sql).map_err(tx_err)
    }
}

impl TransactionScope for SqliteScope {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish(true)
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish(false)
    }
}

impl Drop for SqliteScope {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.finish(false) {
                warn!(error = %err, "rollback of abandoned sqlite scope failed");
            }
        }
    }
}
