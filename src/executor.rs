//! Narrow interfaces to the collaborators this crate drives but does not
//! own: statement execution and transaction demarcation.

use std::fmt;

use serde::Deserialize;
use tracing::warn;

use crate::error::{DaoError, Result};
use crate::merge::Row;
use crate::value::Value;

/// Driver default for timeouts and fetch sizes.
pub const DRIVER_DEFAULT: i32 = -1;

/// Pass-through execution settings. Validated here, enforced by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    /// Statement timeout in seconds, `-1` for the driver default.
    pub query_timeout: i32,
    /// Row fetch size hint, `-1` for the driver default.
    pub fetch_size: i32,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            query_timeout: DRIVER_DEFAULT,
            fetch_size: DRIVER_DEFAULT,
        }
    }
}

impl ExecOptions {
    /// Rejects values the driver could not interpret.
    pub fn validate(&self) -> Result<()> {
        if self.query_timeout < DRIVER_DEFAULT {
            return Err(DaoError::config(format!(
                "query_timeout must be -1 or a non-negative number of seconds (got {})",
                self.query_timeout
            )));
        }
        if self.fetch_size != DRIVER_DEFAULT && self.fetch_size <= 0 {
            return Err(DaoError::config(format!(
                "fetch_size must be -1 or positive (got {})",
                self.fetch_size
            )));
        }
        Ok(())
    }
}

/// One statement ready for the driver.
#[derive(Clone, Copy, Debug)]
pub struct Statement<'a> {
    /// SQL text with positional placeholder marks.
    pub sql: &'a str,
    /// Values in placeholder order.
    pub values: &'a [Value],
    /// Timeout and fetch size hints.
    pub options: ExecOptions,
}

/// Lazily produced result rows.
pub type RowStream = Box<dyn Iterator<Item = Result<Row>> + Send>;

/// Executes SQL against a database.
pub trait StatementExecutor: Send + Sync {
    /// Runs a query and streams its rows.
    fn query(&self, stmt: &Statement<'_>) -> Result<RowStream>;

    /// Runs a write and returns the affected row count.
    fn update(&self, stmt: &Statement<'_>) -> Result<u64>;

    /// Runs one SQL text once per parameter row. An error fails the whole
    /// call; per-row counts are returned in input order on success.
    fn update_batch(
        &self,
        sql: &str,
        rows: &[Vec<Value>],
        options: ExecOptions,
    ) -> Result<Vec<u64>> {
        rows.iter()
            .map(|values| {
                self.update(&Statement {
                    sql,
                    values,
                    options,
                })
            })
            .collect()
    }
}

/// Transaction propagation behaviour handed to the transaction collaborator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    /// Join the current transaction or start one.
    #[default]
    Required,
    /// Always start a new transaction, suspending the current one.
    RequiresNew,
    /// Join if present, otherwise run without one.
    Supports,
    /// Suspend any current transaction.
    NotSupported,
    /// Fail unless a transaction is active.
    Mandatory,
    /// Fail if a transaction is active.
    Never,
    /// Run in a savepoint of the current transaction.
    Nested,
}

/// Isolation level handed to the transaction collaborator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Whatever the connection uses.
    #[default]
    Default,
    /// Dirty reads allowed.
    ReadUncommitted,
    /// Only committed data is visible.
    ReadCommitted,
    /// Repeated reads see the same rows.
    RepeatableRead,
    /// Full serializability.
    Serializable,
}

/// Propagation and isolation for one unit of work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TxOptions {
    /// Propagation behaviour.
    pub propagation: Propagation,
    /// Isolation level.
    pub isolation: Isolation,
}

impl fmt::Display for TxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.propagation, self.isolation)
    }
}

/// Begins, joins or suspends transactions around a unit of work.
pub trait TransactionContext: Send + Sync {
    /// Opens a scope according to `options`.
    fn begin(&self, options: TxOptions) -> Result<Box<dyn TransactionScope>>;
}

/// An open transaction scope.
pub trait TransactionScope {
    /// Commits the scope.
    fn commit(self: Box<Self>) -> Result<()>;
    /// Rolls the scope back.
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Runs `work` inside a scope from `tx`: commit on success, roll back on
/// failure. A rollback failure is logged and the original error returned.
pub fn in_transaction<T>(
    tx: &dyn TransactionContext,
    options: TxOptions,
    work: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let scope = tx.begin(options)?;
    match work() {
        Ok(value) => {
            scope.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = scope.rollback() {
                warn!(error = %rollback_err, %options, "transaction rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingTx {
        log: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingScope {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl TransactionContext for RecordingTx {
        fn begin(&self, options: TxOptions) -> Result<Box<dyn TransactionScope>> {
            self.log.lock().push(format!("begin {options}"));
            Ok(Box::new(RecordingScope {
                log: Arc::clone(&self.log),
            }))
        }
    }

    impl TransactionScope for RecordingScope {
        fn commit(self: Box<Self>) -> Result<()> {
            self.log.lock().push("commit".into());
            Ok(())
        }

        fn rollback(self: Box<Self>) -> Result<()> {
            self.log.lock().push("rollback".into());
            Ok(())
        }
    }

    #[test]
    fn commits_on_success_and_rolls_back_on_error() {
        let tx = RecordingTx::default();
        let options = TxOptions {
            propagation: Propagation::RequiresNew,
            isolation: Isolation::Serializable,
        };
        assert_eq!(in_transaction(&tx, options, || Ok(3)).unwrap(), 3);
        let err = in_transaction::<()>(&tx, TxOptions::default(), || {
            Err(DaoError::Execution("boom".into()))
        })
        .unwrap_err();
        assert_eq!(err.code(), "ExecutionFailed");
        assert_eq!(
            *tx.log.lock(),
            vec![
                "begin RequiresNew/Serializable".to_owned(),
                "commit".to_owned(),
                "begin Required/Default".to_owned(),
                "rollback".to_owned(),
            ]
        );
    }

    #[test]
    fn exec_options_validation() {
        assert!(ExecOptions::default().validate().is_ok());
        assert!(ExecOptions {
            query_timeout: -2,
            ..ExecOptions::default()
        }
        .validate()
        .is_err());
        assert!(ExecOptions {
            fetch_size: 0,
            ..ExecOptions::default()
        }
        .validate()
        .is_err());
    }
}
