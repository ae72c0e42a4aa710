use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DaoError, Result};
use crate::value::Value;

/// Per-call arguments: named parameter values and template-variable
/// fragments.
///
/// Both maps are ordered so the serialized form is a stable fingerprint for
/// cache keys.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingContext {
    params: BTreeMap<String, Value>,
    defines: BTreeMap<String, String>,
}

impl BindingContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context whose parameters are the properties of `entity`.
    pub fn from_entity(entity: &Value) -> Result<Self> {
        let props = entity.as_object().ok_or_else(|| {
            DaoError::config(format!(
                "entity must be an object to bind by property, got {}",
                entity.type_name()
            ))
        })?;
        Ok(Self {
            params: props.clone(),
            defines: BTreeMap::new(),
        })
    }

    /// Adds a parameter, builder style.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_param(name, value);
        self
    }

    /// Adds a template-variable fragment, builder style.
    pub fn with_define(mut self, name: impl Into<String>, fragment: impl Into<String>) -> Self {
        self.set_define(name, fragment);
        self
    }

    /// Binds or replaces a parameter.
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.params.insert(name.into(), value.into());
    }

    /// Binds or replaces a template-variable fragment.
    pub fn set_define(&mut self, name: impl Into<String>, fragment: impl Into<String>) {
        self.defines.insert(name.into(), fragment.into());
    }

    /// Looks up a parameter.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// True when `name` was bound explicitly.
    pub fn contains_param(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Looks up a template-variable fragment.
    pub fn define_fragment(&self, name: &str) -> Option<&str> {
        self.defines.get(name).map(String::as_str)
    }

    /// All parameters in name order.
    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    /// All template-variable fragments in name order.
    pub fn defines(&self) -> &BTreeMap<String, String> {
        &self.defines
    }
}
