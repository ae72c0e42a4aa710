//! Batched execution of one template over many binding contexts.
//!
//! Units are bound up front, split into contiguous chunks of `batch_size`,
//! and executed strictly in submission order. A failing chunk stops the
//! batch; chunks that already completed are not rolled back here, which is
//! the job of a transaction wrapped around the whole call.

use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bind::{current_timestamp, BindOptions, Binder, BindingContext, ExecutionPlan};
use crate::error::{DaoError, Result};
use crate::executor::{ExecOptions, StatementExecutor};
use crate::template::CompiledTemplate;
use crate::value::Value;

/// Binding contexts destined for one batch call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchUnits {
    units: Vec<BindingContext>,
}

impl BatchUnits {
    /// One unit per entity.
    ///
    /// With `bind_as`, each entity is bound whole under that parameter name
    /// (for `:name.property` paths); otherwise its properties become the
    /// parameters. Parameters and fragments in `shared` are broadcast to
    /// every unit.
    pub fn from_entities<I>(
        entities: I,
        bind_as: Option<&str>,
        shared: &BindingContext,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = Value>,
    {
        let units = entities
            .into_iter()
            .map(|entity| {
                let mut unit = shared.clone();
                match bind_as {
                    Some(name) => unit.set_param(name, entity),
                    None => {
                        for (name, value) in BindingContext::from_entity(&entity)?.params() {
                            unit.set_param(name.clone(), value.clone());
                        }
                    }
                }
                Ok(unit)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { units })
    }

    /// Unit `i` takes element `i` of every list-valued parameter; scalar
    /// parameters and parameters listed in
    /// [`BindOptions::single_parameters`] are broadcast.
    ///
    /// All participating lists must have the same length; this is checked
    /// before anything executes.
    pub fn from_columns(args: &BindingContext, opts: &BindOptions) -> Result<Self> {
        let columns: Vec<(&String, &[Value])> = args
            .params()
            .iter()
            .filter(|(name, _)| !opts.single_parameters.contains(name.as_str()))
            .filter_map(|(name, value)| value.as_list().map(|items| (name, items)))
            .collect();

        let Some((_, first)) = columns.first() else {
            return Ok(Self {
                units: vec![args.clone()],
            });
        };
        let expected = first.len();
        if let Some((param, items)) = columns.iter().find(|(_, items)| items.len() != expected) {
            return Err(DaoError::BatchCardinalityMismatch {
                param: (*param).clone(),
                expected,
                found: items.len(),
            });
        }

        let units = (0..expected)
            .map(|i| {
                let mut unit = args.clone();
                for (name, items) in &columns {
                    unit.set_param((*name).clone(), items[i].clone());
                }
                unit
            })
            .collect();
        Ok(Self { units })
    }

    /// Wraps prepared contexts as-is.
    pub fn from_contexts(units: Vec<BindingContext>) -> Self {
        Self { units }
    }

    /// Number of units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// True when there is nothing to execute.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units in submission order.
    pub fn as_slice(&self) -> &[BindingContext] {
        &self.units
    }
}

/// Result of one unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Executed; rows affected.
    Applied(u64),
    /// Belongs to the chunk that failed.
    Failed {
        /// Index of the failed chunk.
        chunk: usize,
    },
    /// Never sent because an earlier chunk failed.
    NotAttempted,
}

/// Details of the chunk that stopped the batch.
#[derive(Debug)]
pub struct ChunkFailure {
    /// Chunk index.
    pub chunk: usize,
    /// Units in the failed chunk.
    pub units: Range<usize>,
    /// Error reported by the executor.
    pub error: DaoError,
}

/// Per-unit outcomes in submission order.
#[derive(Debug, Default)]
pub struct BatchReport {
    outcomes: Vec<BatchOutcome>,
    chunks: usize,
    failure: Option<ChunkFailure>,
}

impl BatchReport {
    /// Outcomes indexed like the submitted units.
    pub fn outcomes(&self) -> &[BatchOutcome] {
        &self.outcomes
    }

    /// Number of chunks the units were split into.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    /// Failed chunk, if any.
    pub fn failure(&self) -> Option<&ChunkFailure> {
        self.failure.as_ref()
    }

    /// True when every unit was applied.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Sum of affected rows over applied units.
    pub fn rows_affected(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match o {
                BatchOutcome::Applied(n) => *n,
                _ => 0,
            })
            .sum()
    }

    /// Per-unit row counts, or [`DaoError::BatchChunkFailed`] naming the
    /// failed chunk and every unit left unresolved.
    pub fn into_result(self) -> Result<Vec<u64>> {
        match self.failure {
            Some(failure) => Err(DaoError::BatchChunkFailed {
                chunk: failure.chunk,
                unresolved: failure.units.start..self.outcomes.len(),
                units: failure.units,
                source: Box::new(failure.error),
            }),
            None => Ok(self
                .outcomes
                .into_iter()
                .map(|o| match o {
                    BatchOutcome::Applied(n) => n,
                    _ => 0,
                })
                .collect()),
        }
    }
}

/// Contiguous unit ranges for `len` units split by `batch_size`.
pub fn chunk_ranges(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let size = batch_size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// Drives the binder and the statement executor over batch units.
#[derive(Clone)]
pub struct BatchExecutor {
    binder: Binder,
    executor: Arc<dyn StatementExecutor>,
    options: ExecOptions,
}

impl BatchExecutor {
    /// Creates a batch executor.
    pub fn new(binder: Binder, executor: Arc<dyn StatementExecutor>, options: ExecOptions) -> Self {
        Self {
            binder,
            executor,
            options,
        }
    }

    /// Binds every unit, then executes them chunk by chunk.
    ///
    /// Binding failures abort before anything executes. An empty unit list
    /// returns an empty report.
    pub fn execute(
        &self,
        template: &CompiledTemplate,
        units: &BatchUnits,
        opts: &BindOptions,
        batch_size: usize,
    ) -> Result<BatchReport> {
        if batch_size == 0 {
            return Err(DaoError::config("batch_size must be positive"));
        }
        if units.is_empty() {
            return Ok(BatchReport::default());
        }

        let now = current_timestamp();
        let plans = units
            .as_slice()
            .iter()
            .map(|ctx| self.binder.bind_at(template, ctx, opts, now))
            .collect::<Result<Vec<_>>>()?;

        let ranges = chunk_ranges(plans.len(), batch_size);
        let mut report = BatchReport {
            outcomes: vec![BatchOutcome::NotAttempted; plans.len()],
            chunks: ranges.len(),
            failure: None,
        };

        for (chunk, range) in ranges.into_iter().enumerate() {
            debug!(chunk, start = range.start, end = range.end, "executing batch chunk");
            match self.run_chunk(&plans[range.clone()]) {
                Ok(counts) => {
                    for (slot, count) in report.outcomes[range].iter_mut().zip(counts) {
                        *slot = BatchOutcome::Applied(count);
                    }
                }
                Err(error) => {
                    warn!(
                        chunk,
                        start = range.start,
                        end = range.end,
                        %error,
                        "batch chunk failed"
                    );
                    for slot in &mut report.outcomes[range.clone()] {
                        *slot = BatchOutcome::Failed { chunk };
                    }
                    report.failure = Some(ChunkFailure {
                        chunk,
                        units: range,
                        error,
                    });
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Builds units from parallel list arguments and executes them.
    pub fn execute_columns(
        &self,
        template: &CompiledTemplate,
        args: &BindingContext,
        opts: &BindOptions,
        batch_size: usize,
    ) -> Result<BatchReport> {
        let units = BatchUnits::from_columns(args, opts)?;
        self.execute(template, &units, opts, batch_size)
    }

    // Consecutive plans sharing SQL text go to the driver as one batch;
    // collection expansion can make SQL differ between units.
    fn run_chunk(&self, plans: &[ExecutionPlan]) -> Result<Vec<u64>> {
        let mut counts = Vec::with_capacity(plans.len());
        let mut start = 0;
        while start < plans.len() {
            let sql = plans[start].sql();
            let end = plans[start..]
                .iter()
                .position(|p| p.sql() != sql)
                .map_or(plans.len(), |offset| start + offset);
            let rows: Vec<Vec<Value>> =
                plans[start..end].iter().map(ExecutionPlan::values).collect();
            let run = self.executor.update_batch(sql, &rows, self.options)?;
            if run.len() != rows.len() {
                return Err(DaoError::Execution(format!(
                    "driver returned {} counts for {} statements",
                    run.len(),
                    rows.len()
                )));
            }
            counts.extend(run);
            start = end;
        }
        Ok(counts)
    }
}
