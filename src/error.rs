//! Error type shared by every stage of a DAO invocation.

use std::fmt;
use std::io;
use std::ops::Range;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, DaoError>;

/// Errors raised while compiling, binding, executing, merging or caching a
/// DAO method invocation.
///
/// Nothing here is retried internally; every variant is surfaced to the
/// caller as-is.
#[derive(Debug, Error)]
pub enum DaoError {
    /// The raw SQL template could not be tokenized.
    #[error("template syntax error at byte {offset}: {message}")]
    TemplateSyntax { offset: usize, message: String },
    /// A `{name}` template variable had no fragment and no default.
    #[error("missing template variable '{name}'")]
    MissingTemplateVariable { name: String },
    /// A `:name` placeholder referenced a parameter that was never bound.
    #[error("missing parameter '{name}'")]
    MissingParameter { name: String },
    /// A property path segment could not be resolved on the bound value.
    #[error("unresolved property path '{param}.{path}' (segment '{segment}')")]
    UnresolvedPropertyPath {
        param: String,
        path: String,
        segment: String,
    },
    /// The caller explicitly bound a name reserved by the engine.
    #[error("parameter '{name}' is reserved for the operation timestamp")]
    ReservedParameterConflict { name: String },
    /// List-valued batch parameters disagree on their length.
    #[error("batch parameter '{param}' has {found} elements, expected {expected}")]
    BatchCardinalityMismatch {
        param: String,
        expected: usize,
        found: usize,
    },
    /// A batch chunk failed; prior chunks are not rolled back here.
    #[error("batch chunk {chunk} (units {}..{}) failed: {source}", .units.start, .units.end)]
    BatchChunkFailed {
        chunk: usize,
        units: Range<usize>,
        unresolved: Range<usize>,
        #[source]
        source: Box<DaoError>,
    },
    /// Rows for one identity key were not contiguous.
    #[error("rows for identity key {key} are not contiguous (row {row})")]
    UnsupportedRowOrdering { key: String, row: usize },
    /// Configuration values failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The statement executor reported a failure.
    #[error("statement execution failed: {0}")]
    Execution(String),
    /// The transaction collaborator reported a failure.
    #[error("transaction error: {0}")]
    Transaction(String),
    /// An interceptor `before` hook rejected the invocation.
    #[error("interceptor '{name}' rejected invocation: {message}")]
    Interceptor { name: String, message: String },
    /// I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Arguments could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DaoError {
    pub(crate) fn syntax(offset: usize, message: impl Into<String>) -> Self {
        DaoError::TemplateSyntax {
            offset,
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        DaoError::InvalidConfig(message.into())
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            DaoError::TemplateSyntax { .. } => "TemplateSyntaxError",
            DaoError::MissingTemplateVariable { .. } => "MissingTemplateVariable",
            DaoError::MissingParameter { .. } => "MissingParameter",
            DaoError::UnresolvedPropertyPath { .. } => "UnresolvedPropertyPath",
            DaoError::ReservedParameterConflict { .. } => "ReservedParameterConflict",
            DaoError::BatchCardinalityMismatch { .. } => "BatchCardinalityMismatch",
            DaoError::BatchChunkFailed { .. } => "BatchChunkFailed",
            DaoError::UnsupportedRowOrdering { .. } => "UnsupportedRowOrdering",
            DaoError::InvalidConfig(_) | DaoError::Toml(_) => "InvalidConfig",
            DaoError::Execution(_) => "ExecutionFailed",
            DaoError::Transaction(_) => "TransactionFailed",
            DaoError::Interceptor { .. } => "InterceptorRejected",
            DaoError::Io(_) => "Io",
            DaoError::Json(_) => "Json",
        }
    }
}

/// Convenience wrapper that formats errors with their codes.
pub struct DaoErrorWithCode<'a>(pub &'a DaoError);

impl fmt::Display for DaoErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_failure_reports_range_and_code() {
        let err = DaoError::BatchChunkFailed {
            chunk: 1,
            units: 3..6,
            unresolved: 3..10,
            source: Box::new(DaoError::Execution("disk full".into())),
        };
        assert_eq!(err.code(), "BatchChunkFailed");
        let shown = DaoErrorWithCode(&err).to_string();
        assert!(shown.starts_with("[BatchChunkFailed] batch chunk 1 (units 3..6) failed: "));
        assert!(shown.ends_with("statement execution failed: disk full"));
    }
}
