use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::debug;

use super::{compile, CompiledTemplate};
use crate::error::Result;

/// Memo table from raw SQL bytes to the compiled template.
///
/// Lookups take a shared lock and never block each other. Compilation runs
/// outside the lock; when two callers compile the same string concurrently
/// the first insert wins and the late duplicate is discarded, so every
/// caller observes one shared instance per distinct string.
#[derive(Default)]
pub struct TemplateCache {
    templates: RwLock<HashMap<String, Arc<CompiledTemplate>>>,
    hits: AtomicU64,
    compiles: AtomicU64,
    discarded: AtomicU64,
}

/// Counters describing memo effectiveness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TemplateCacheStats {
    /// Distinct templates currently memoized.
    pub entries: usize,
    /// Lookups served from the table.
    pub hits: u64,
    /// Compilations performed (including discarded duplicates).
    pub compiles: u64,
    /// Concurrent duplicate compilations dropped in favour of the first insert.
    pub discarded: u64,
}

impl TemplateCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache shared by DAOs that do not bring their own.
    pub fn global() -> Arc<TemplateCache> {
        static GLOBAL: OnceLock<Arc<TemplateCache>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(TemplateCache::new())).clone()
    }

    /// Returns the memoized template for `raw`, compiling it on first use.
    ///
    /// Syntax errors are not memoized; every attempt recompiles and fails.
    pub fn get_or_compile(&self, raw: &str) -> Result<Arc<CompiledTemplate>> {
        if let Some(found) = self.templates.read().get(raw) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(found));
        }

        let compiled = Arc::new(compile(raw)?);
        self.compiles.fetch_add(1, Ordering::Relaxed);

        let mut guard = self.templates.write();
        let entry = guard
            .entry(raw.to_owned())
            .or_insert_with(|| Arc::clone(&compiled));
        if !Arc::ptr_eq(entry, &compiled) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(len = raw.len(), "discarded duplicate template compilation");
        }
        Ok(Arc::clone(entry))
    }

    /// Number of memoized templates.
    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    /// Returns true when nothing is memoized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every memoized template.
    pub fn clear(&self) {
        self.templates.write().clear();
    }

    /// Snapshot of the memo counters.
    pub fn stats(&self) -> TemplateCacheStats {
        TemplateCacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
