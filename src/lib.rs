//! Declarative data access: SQL templates with named parameters and
//! template variables, batched writes, join-row merging and a per-DAO
//! result cache, driven through narrow executor and transaction traits.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sqldao::{BindingContext, Dao, DaoConfig, SqliteExecutor, Value};
//!
//! # fn main() -> sqldao::Result<()> {
//! let config = DaoConfig::from_toml_str(r#"
//!     [methods.by_ids]
//!     sql = "SELECT id, name FROM users WHERE id IN (:ids)"
//! "#)?;
//! let dao = Dao::new(config, Arc::new(SqliteExecutor::open("app.db")?))?;
//! let args = BindingContext::new().with_param("ids", vec![Value::Int(1), Value::Int(2)]);
//! let users = dao.query("by_ids", &args)?;
//! # let _ = users;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod batch;
pub mod bind;
pub mod cache;
pub mod config;
pub mod dao;
pub mod error;
pub mod executor;
pub mod interceptor;
pub mod logging;
pub mod merge;
pub mod sqlite;
pub mod template;
pub mod value;

pub use batch::{BatchExecutor, BatchOutcome, BatchReport, BatchUnits};
pub use bind::{BindOptions, Binder, BindingContext, ExecutionPlan, PropertyResolver};
pub use cache::{CacheConfig, CacheKey, DaoCache, RefreshFilters};
pub use config::DaoConfig;
pub use dao::{Dao, MethodKind, MethodSpec};
pub use error::{DaoError, DaoErrorWithCode, Result};
pub use executor::{
    ExecOptions, Isolation, Propagation, StatementExecutor, TransactionContext, TxOptions,
};
pub use interceptor::{Interceptor, InterceptorChain, Invocation};
pub use merge::{merge, merge_all, IdentitySpec, NestedSpec, Row};
pub use sqlite::SqliteExecutor;
pub use template::{compile, CompiledTemplate, TemplateCache, Token};
pub use value::Value;
