#![forbid(unsafe_code)]

//! Parameter binding.
//!
//! Turns a [`CompiledTemplate`] plus a per-call [`BindingContext`] into an
//! [`ExecutionPlan`]: final SQL text and the ordered positional values.
//! Template variables are substituted first, textually and exactly once;
//! named parameters are resolved afterwards, so a fragment may introduce
//! additional `:name` placeholders.

mod context;
mod resolver;

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::trace;

use crate::error::{DaoError, Result};
use crate::template::{compile, CompiledTemplate, NamedParam, TemplateCache, TemplateVar, Token};
use crate::value::Value;

pub use context::BindingContext;
pub use resolver::{PropertyResolver, ValueResolver};

/// Parameter name bound to the operation timestamp when
/// [`BindOptions::timestamped`] is set.
pub const TIMESTAMP_PARAM: &str = "_timestamp";

/// Number of substituted texts each binder keeps compiled. Fragments vary
/// per call, so these stay out of the long-lived [`TemplateCache`].
pub const SUBSTITUTED_MEMO_CAPACITY: usize = 256;

/// Placeholder mark emitted for every positional value.
pub const PLACEHOLDER: &str = "?";

/// Per-method switches that alter binding.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BindOptions {
    /// Parameters whose collection value is passed as one positional value
    /// (driver-native array or JSON columns) instead of being expanded.
    pub single_parameters: BTreeSet<String>,
    /// Bind [`TIMESTAMP_PARAM`] to the current time.
    pub timestamped: bool,
    /// Let an unsupplied `{name}` fall back to the bound parameter `name`.
    pub define_with_named_parameter: bool,
    /// Text placed between expanded placeholder marks.
    pub list_separator: String,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            single_parameters: BTreeSet::new(),
            timestamped: false,
            define_with_named_parameter: false,
            list_separator: ", ".to_owned(),
        }
    }
}

impl BindOptions {
    fn is_single(&self, param: &NamedParam) -> bool {
        self.single_parameters.contains(&param.name)
            || (!param.path.is_empty()
                && self
                    .single_parameters
                    .contains(&format!("{}.{}", param.name, param.dotted_path())))
    }
}

/// Positional value together with where it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundValue {
    /// Value handed to the statement executor.
    pub value: Value,
    /// Placeholder (with property path) that produced it.
    pub param: String,
    /// Index inside the source collection when the parameter was expanded.
    pub index: Option<usize>,
}

/// Final SQL text and ordered positional values for one execution.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionPlan {
    sql: String,
    values: Vec<BoundValue>,
}

impl ExecutionPlan {
    /// SQL text with every placeholder rendered as a mark.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Positional values with their source attribution.
    pub fn bound_values(&self) -> &[BoundValue] {
        &self.values
    }

    /// Positional values only, in placeholder order.
    pub fn values(&self) -> Vec<Value> {
        self.values.iter().map(|b| b.value.clone()).collect()
    }

    /// Number of placeholder marks in [`Self::sql`].
    pub fn placeholder_count(&self) -> usize {
        self.values.len()
    }
}

/// Resolves templates against binding contexts.
#[derive(Clone)]
pub struct Binder {
    templates: Arc<TemplateCache>,
    resolver: Arc<dyn PropertyResolver>,
    substituted: Arc<Mutex<LruCache<String, Arc<CompiledTemplate>>>>,
}

impl Default for Binder {
    fn default() -> Self {
        Self::new(TemplateCache::global(), Arc::new(ValueResolver))
    }
}

impl Binder {
    /// Builds a binder that shares the method template memo `templates`
    /// and walks property paths with `resolver`.
    pub fn new(templates: Arc<TemplateCache>, resolver: Arc<dyn PropertyResolver>) -> Self {
        let capacity = NonZeroUsize::new(SUBSTITUTED_MEMO_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            templates,
            resolver,
            substituted: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Template memo shared with this binder.
    pub fn templates(&self) -> &Arc<TemplateCache> {
        &self.templates
    }

    /// Binds using the current wall-clock time for [`TIMESTAMP_PARAM`].
    pub fn bind(
        &self,
        template: &CompiledTemplate,
        ctx: &BindingContext,
        opts: &BindOptions,
    ) -> Result<ExecutionPlan> {
        self.bind_at(template, ctx, opts, current_timestamp())
    }

    /// Binds with an explicit timestamp (nanoseconds since the Unix epoch),
    /// so every unit of a batch shares one value.
    pub fn bind_at(
        &self,
        template: &CompiledTemplate,
        ctx: &BindingContext,
        opts: &BindOptions,
        now: i128,
    ) -> Result<ExecutionPlan> {
        if opts.timestamped && ctx.contains_param(TIMESTAMP_PARAM) {
            return Err(DaoError::ReservedParameterConflict {
                name: TIMESTAMP_PARAM.to_owned(),
            });
        }

        let substituted;
        let template = if template.has_template_vars() {
            let text = substitute(template, ctx, opts)?;
            substituted = self.compile_substituted(text)?;
            substituted.as_ref()
        } else {
            template
        };

        let mut sql = String::with_capacity(template.source().len() + 16);
        let mut values = Vec::new();
        for token in template.tokens() {
            match token {
                Token::Literal(text) => sql.push_str(text),
                Token::Escaped(ch) => sql.push(*ch),
                // Fragments are substituted once; a variable introduced by a
                // fragment stays as written.
                Token::TemplateVar(var) => sql.push_str(&var.source),
                Token::NamedParam(param) => {
                    let value = self.resolve(param, ctx, opts, now)?;
                    render_param(param, value, opts, &mut sql, &mut values);
                }
            }
        }

        trace!(values = values.len(), "bound statement");
        Ok(ExecutionPlan { sql, values })
    }

    fn compile_substituted(&self, text: String) -> Result<Arc<CompiledTemplate>> {
        if let Some(found) = self.substituted.lock().get(&text) {
            return Ok(Arc::clone(found));
        }
        let compiled = Arc::new(compile(&text)?);
        self.substituted.lock().put(text, Arc::clone(&compiled));
        Ok(compiled)
    }

    fn resolve(
        &self,
        param: &NamedParam,
        ctx: &BindingContext,
        opts: &BindOptions,
        now: i128,
    ) -> Result<Value> {
        let base = if opts.timestamped && param.name == TIMESTAMP_PARAM {
            Value::DateTime(now)
        } else {
            ctx.param(&param.name)
                .cloned()
                .ok_or_else(|| DaoError::MissingParameter {
                    name: param.name.clone(),
                })?
        };

        let mut current = base;
        for segment in &param.path {
            if current.is_null() {
                break;
            }
            current = self.resolver.get(&current, segment).ok_or_else(|| {
                DaoError::UnresolvedPropertyPath {
                    param: param.name.clone(),
                    path: param.dotted_path(),
                    segment: segment.clone(),
                }
            })?;
        }
        Ok(current)
    }
}

fn render_param(
    param: &NamedParam,
    value: Value,
    opts: &BindOptions,
    sql: &mut String,
    values: &mut Vec<BoundValue>,
) {
    let label = if param.path.is_empty() {
        param.name.clone()
    } else {
        format!("{}.{}", param.name, param.dotted_path())
    };
    match value {
        Value::List(items) if !opts.is_single(param) => {
            if items.is_empty() {
                sql.push_str("NULL");
                return;
            }
            for (index, item) in items.into_iter().enumerate() {
                if index > 0 {
                    sql.push_str(&opts.list_separator);
                }
                sql.push_str(PLACEHOLDER);
                values.push(BoundValue {
                    value: item,
                    param: label.clone(),
                    index: Some(index),
                });
            }
        }
        value => {
            sql.push_str(PLACEHOLDER);
            values.push(BoundValue {
                value,
                param: label,
                index: None,
            });
        }
    }
}

fn substitute(
    template: &CompiledTemplate,
    ctx: &BindingContext,
    opts: &BindOptions,
) -> Result<String> {
    let mut out = String::with_capacity(template.source().len());
    for token in template.tokens() {
        match token {
            Token::TemplateVar(var) => out.push_str(&fragment_for(var, ctx, opts)?),
            other => other.write_source(&mut out),
        }
    }
    Ok(out)
}

fn fragment_for(var: &TemplateVar, ctx: &BindingContext, opts: &BindOptions) -> Result<String> {
    let supplied = match ctx.define_fragment(&var.name) {
        Some(fragment) => Some(fragment.to_owned()),
        None if opts.define_with_named_parameter => ctx.param(&var.name).map(Value::to_string),
        None => None,
    };
    match (supplied, &var.default) {
        (Some(fragment), _) if !fragment.is_empty() => Ok(fragment),
        (_, Some(default)) => Ok(default.clone()),
        (Some(empty), None) => Ok(empty),
        (None, None) => Err(DaoError::MissingTemplateVariable {
            name: var.name.clone(),
        }),
    }
}

/// Current UTC time in nanoseconds since the Unix epoch.
pub fn current_timestamp() -> i128 {
    time::OffsetDateTime::now_utc().unix_timestamp_nanos()
}
