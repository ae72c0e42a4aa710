//! DAO configuration assembled once at construction time.
//!
//! ```toml
//! name = "users"
//! refresh_filters = ["insert", "re:^(update|delete)"]
//!
//! [cache]
//! capacity = 500
//! live_time_ms = 60000
//!
//! [methods.find_by_ids]
//! sql = "SELECT * FROM users WHERE id IN (:ids)"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

pub use crate::cache::{CacheConfig, TransferStrategy};
pub use crate::dao::{MethodKind, MethodSpec};

use crate::cache::RefreshFilters;
use crate::error::{DaoError, Result};
use crate::template::compile;

/// Everything a [`Dao`](crate::Dao) needs besides its collaborators.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DaoConfig {
    /// Name used in logs.
    pub name: String,
    /// Result cache limits; no cache when absent.
    pub cache: Option<CacheConfig>,
    /// Write-method filters that clear the cache. Plain strings match as
    /// case-insensitive substrings, `re:` prefixes a regular expression.
    pub refresh_filters: Vec<String>,
    /// Methods by name.
    pub methods: BTreeMap<String, MethodSpec>,
}

impl Default for DaoConfig {
    fn default() -> Self {
        Self {
            name: "dao".to_owned(),
            cache: None,
            refresh_filters: Vec::new(),
            methods: BTreeMap::new(),
        }
    }
}

impl DaoConfig {
    /// Parses and validates TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: DaoConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), methods = config.methods.len(), "loaded dao config");
        Ok(config)
    }

    /// Adds or replaces a method.
    pub fn with_method(mut self, name: impl Into<String>, spec: MethodSpec) -> Self {
        self.methods.insert(name.into(), spec);
        self
    }

    /// Checks every value and compiles every template.
    pub fn validate(&self) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        RefreshFilters::parse(&self.refresh_filters)?;
        for (name, spec) in &self.methods {
            if name.is_empty() {
                return Err(DaoError::config("method names must not be empty"));
            }
            spec.validate(name)?;
            compile(&spec.sql)?;
        }
        Ok(())
    }
}
