//! The method pipeline: compile, bind, execute or batch, merge, cache.
//!
//! A [`Dao`] is assembled once from a [`DaoConfig`] and is immutable
//! afterwards. Every call runs inside the interceptor chain; reads go
//! through the result cache when one is configured, and writes clear it
//! when their name matches a refresh filter.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::batch::{BatchExecutor, BatchUnits};
use crate::bind::{BindOptions, Binder, BindingContext, ExecutionPlan};
use crate::cache::{CacheKey, DaoCache, RefreshFilters};
use crate::config::DaoConfig;
use crate::error::{DaoError, Result};
use crate::executor::{
    in_transaction, ExecOptions, Statement, StatementExecutor, TransactionContext, TxOptions,
    DRIVER_DEFAULT,
};
use crate::interceptor::{Interceptor, InterceptorChain, Invocation};
use crate::merge::{merge_all, IdentitySpec};
use crate::template::CompiledTemplate;
use crate::value::Value;

/// Default number of units per batch chunk.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Whether a method reads or writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Returns rows; eligible for caching.
    #[default]
    Read,
    /// Returns affected row counts; may invalidate the cache.
    Write,
}

/// Declarative description of one DAO method.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MethodSpec {
    /// SQL template.
    pub sql: String,
    /// Read or write.
    pub kind: MethodKind,
    /// Execute once per batch unit.
    pub is_batch: bool,
    /// Units per chunk for batch methods.
    pub batch_size: usize,
    /// Bind each entity of this list parameter as one batch unit. Without
    /// it, batch units come from parallel list parameters.
    pub bind_as: Option<String>,
    /// Statement timeout in seconds, `-1` for the driver default.
    pub query_timeout: i32,
    /// Fetch size hint, `-1` for the driver default.
    pub fetch_size: i32,
    /// Bind the reserved timestamp parameter.
    pub timestamped: bool,
    /// Parameters passed as one value even when they hold a collection.
    pub single_parameters: BTreeSet<String>,
    /// Let `{name}` fall back to the bound parameter `name`.
    pub define_with_named_parameter: bool,
    /// Separator between expanded placeholder marks.
    pub list_separator: Option<String>,
    /// Cache results of this read when the DAO has a cache.
    pub cached: bool,
    /// Fold joined rows into nested entities.
    pub merge: Option<IdentitySpec>,
    /// Run inside a transaction with these settings.
    pub transaction: Option<TxOptions>,
}

impl Default for MethodSpec {
    fn default() -> Self {
        Self {
            sql: String::new(),
            kind: MethodKind::Read,
            is_batch: false,
            batch_size: DEFAULT_BATCH_SIZE,
            bind_as: None,
            query_timeout: DRIVER_DEFAULT,
            fetch_size: DRIVER_DEFAULT,
            timestamped: false,
            single_parameters: BTreeSet::new(),
            define_with_named_parameter: false,
            list_separator: None,
            cached: true,
            merge: None,
            transaction: None,
        }
    }
}

impl MethodSpec {
    /// Read method with the given SQL.
    pub fn read(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }

    /// Write method with the given SQL.
    pub fn write(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            kind: MethodKind::Write,
            ..Self::default()
        }
    }

    /// Driver pass-through options.
    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            query_timeout: self.query_timeout,
            fetch_size: self.fetch_size,
        }
    }

    /// Binder switches.
    pub fn bind_options(&self) -> BindOptions {
        let mut opts = BindOptions {
            single_parameters: self.single_parameters.clone(),
            timestamped: self.timestamped,
            define_with_named_parameter: self.define_with_named_parameter,
            ..BindOptions::default()
        };
        if let Some(sep) = &self.list_separator {
            opts.list_separator = sep.clone();
        }
        opts
    }

    /// Checks the method in isolation.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.sql.trim().is_empty() {
            return Err(DaoError::config(format!("method '{name}': sql must not be empty")));
        }
        if self.batch_size == 0 {
            return Err(DaoError::config(format!(
                "method '{name}': batch_size must be positive"
            )));
        }
        if self.is_batch && self.kind != MethodKind::Write {
            return Err(DaoError::config(format!(
                "method '{name}': batch methods must be writes"
            )));
        }
        if self.merge.is_some() && self.kind != MethodKind::Read {
            return Err(DaoError::config(format!(
                "method '{name}': only reads can merge rows"
            )));
        }
        self.exec_options()
            .validate()
            .map_err(|err| DaoError::config(format!("method '{name}': {err}")))
    }
}

struct Method {
    spec: MethodSpec,
    template: Arc<CompiledTemplate>,
    bind: BindOptions,
}

/// Configured data-access object.
pub struct Dao {
    name: String,
    methods: BTreeMap<String, Method>,
    executor: Arc<dyn StatementExecutor>,
    binder: Binder,
    cache: Option<DaoCache<Vec<Value>>>,
    interceptors: InterceptorChain,
    transactions: Option<Arc<dyn TransactionContext>>,
}

impl Dao {
    /// Validates `config`, compiles every method template and builds the
    /// cache.
    pub fn new(config: DaoConfig, executor: Arc<dyn StatementExecutor>) -> Result<Self> {
        Self::with_binder(config, executor, Binder::default())
    }

    /// Like [`Dao::new`] with a specific binder (template memo and property
    /// resolver).
    pub fn with_binder(
        config: DaoConfig,
        executor: Arc<dyn StatementExecutor>,
        binder: Binder,
    ) -> Result<Self> {
        config.validate()?;
        let cache = match &config.cache {
            Some(cache_config) => Some(DaoCache::new(
                cache_config.clone(),
                RefreshFilters::parse(&config.refresh_filters)?,
            )?),
            None => None,
        };
        let methods = config
            .methods
            .into_iter()
            .map(|(name, spec)| {
                let template = binder.templates().get_or_compile(&spec.sql)?;
                let bind = spec.bind_options();
                Ok((name, Method { spec, template, bind }))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        debug!(dao = %config.name, methods = methods.len(), cached = cache.is_some(), "dao ready");
        Ok(Self {
            name: config.name,
            methods,
            executor,
            binder,
            cache,
            interceptors: InterceptorChain::new(),
            transactions: None,
        })
    }

    /// Appends an interceptor (innermost so far).
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Sets the transaction collaborator used by methods with
    /// `transaction` settings.
    pub fn with_transactions(mut self, tx: Arc<dyn TransactionContext>) -> Self {
        self.transactions = Some(tx);
        self
    }

    /// Replaces the result cache, e.g. with one on a custom store or clock.
    pub fn with_cache(mut self, cache: DaoCache<Vec<Value>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// DAO name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Result cache, if configured.
    pub fn cache(&self) -> Option<&DaoCache<Vec<Value>>> {
        self.cache.as_ref()
    }

    /// Method names in sorted order.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Declared spec of `method`.
    pub fn method_spec(&self, method: &str) -> Option<&MethodSpec> {
        self.methods.get(method).map(|m| &m.spec)
    }

    /// Binds `method` without executing it.
    pub fn plan(&self, method: &str, args: &BindingContext) -> Result<ExecutionPlan> {
        let m = self.method(method)?;
        self.binder.bind(&m.template, args, &m.bind)
    }

    /// Runs a read method called from outside the DAO.
    pub fn query(&self, method: &str, args: &BindingContext) -> Result<Arc<Vec<Value>>> {
        self.query_with(&Invocation::external(method), args)
    }

    /// Runs a read method for an explicit invocation.
    pub fn query_with(
        &self,
        call: &Invocation<'_>,
        args: &BindingContext,
    ) -> Result<Arc<Vec<Value>>> {
        let m = self.method(call.method)?;
        if m.spec.kind != MethodKind::Read {
            return Err(DaoError::config(format!("method '{}' is not a read", call.method)));
        }
        self.interceptors.invoke(call, || match &self.cache {
            Some(cache) if m.spec.cached => {
                let key = CacheKey::new(call.method, args)?;
                cache.cached_call(&key, || self.transactional(m, || self.fetch(m, args)))
            }
            _ => self.transactional(m, || self.fetch(m, args)).map(Arc::new),
        })
    }

    /// Runs a write method called from outside the DAO and returns the
    /// total number of affected rows. Batch methods derive their units
    /// from `args`.
    pub fn update(&self, method: &str, args: &BindingContext) -> Result<u64> {
        self.update_with(&Invocation::external(method), args)
    }

    /// Runs a write method for an explicit invocation.
    pub fn update_with(&self, call: &Invocation<'_>, args: &BindingContext) -> Result<u64> {
        let m = self.write_method(call.method)?;
        if m.spec.is_batch {
            let units = self.units_for(m, args)?;
            return self
                .batch_with(call, &units)
                .map(|counts| counts.iter().sum());
        }
        self.interceptors.invoke(call, || {
            self.invalidating(call.method, || {
                self.transactional(m, || {
                    let plan = self.binder.bind(&m.template, args, &m.bind)?;
                    let values = plan.values();
                    self.executor.update(&Statement {
                        sql: plan.sql(),
                        values: &values,
                        options: m.spec.exec_options(),
                    })
                })
            })
        })
    }

    /// Runs a batch method over explicit units; returns per-unit counts.
    pub fn batch(&self, method: &str, units: &BatchUnits) -> Result<Vec<u64>> {
        self.batch_with(&Invocation::external(method), units)
    }

    /// Runs a batch method over explicit units for an explicit invocation.
    ///
    /// A failed chunk surfaces as [`DaoError::BatchChunkFailed`]; inside a
    /// transaction that error rolls back every chunk.
    pub fn batch_with(&self, call: &Invocation<'_>, units: &BatchUnits) -> Result<Vec<u64>> {
        let m = self.write_method(call.method)?;
        let batch = BatchExecutor::new(
            self.binder.clone(),
            Arc::clone(&self.executor),
            m.spec.exec_options(),
        );
        self.interceptors.invoke(call, || {
            self.invalidating(call.method, || {
                self.transactional(m, || {
                    batch
                        .execute(&m.template, units, &m.bind, m.spec.batch_size)?
                        .into_result()
                })
            })
        })
    }

    fn method(&self, name: &str) -> Result<&Method> {
        self.methods
            .get(name)
            .ok_or_else(|| DaoError::config(format!("dao '{}' has no method '{name}'", self.name)))
    }

    fn write_method(&self, name: &str) -> Result<&Method> {
        let m = self.method(name)?;
        if m.spec.kind != MethodKind::Write {
            return Err(DaoError::config(format!("method '{name}' is not a write")));
        }
        Ok(m)
    }

    fn units_for(&self, m: &Method, args: &BindingContext) -> Result<BatchUnits> {
        let Some(name) = &m.spec.bind_as else {
            return BatchUnits::from_columns(args, &m.bind);
        };
        let entities = args
            .param(name)
            .ok_or_else(|| DaoError::MissingParameter { name: name.clone() })?
            .as_list()
            .ok_or_else(|| {
                DaoError::config(format!("batch parameter '{name}' must be a list of entities"))
            })?
            .to_vec();
        let mut shared = BindingContext::new();
        for (key, value) in args.params().iter().filter(|(key, _)| *key != name) {
            shared.set_param(key.clone(), value.clone());
        }
        for (key, fragment) in args.defines() {
            shared.set_define(key.clone(), fragment.clone());
        }
        BatchUnits::from_entities(entities, Some(name.as_str()), &shared)
    }

    fn fetch(&self, m: &Method, args: &BindingContext) -> Result<Vec<Value>> {
        let plan = self.binder.bind(&m.template, args, &m.bind)?;
        let values = plan.values();
        let rows = self.executor.query(&Statement {
            sql: plan.sql(),
            values: &values,
            options: m.spec.exec_options(),
        })?;
        match &m.spec.merge {
            Some(spec) => merge_all(rows, spec.clone()),
            None => rows.map(|row| row.map(|r| r.into_object())).collect(),
        }
    }

    fn invalidating<T>(&self, method: &str, work: impl FnOnce() -> Result<T>) -> Result<T> {
        match &self.cache {
            Some(cache) => cache.invalidating_call(method, work),
            None => work(),
        }
    }

    fn transactional<T>(&self, m: &Method, work: impl FnOnce() -> Result<T>) -> Result<T> {
        match (m.spec.transaction, &self.transactions) {
            (None, _) => work(),
            (Some(options), Some(tx)) => in_transaction(tx.as_ref(), options, work),
            (Some(_), None) => Err(DaoError::Transaction(
                "method declares a transaction but the dao has no transaction context".into(),
            )),
        }
    }
}
