use regex::Regex;

use crate::error::{DaoError, Result};

const REGEX_PREFIX: &str = "re:";

/// Decides which write methods clear the cache.
#[derive(Clone, Debug)]
pub enum RefreshFilter {
    /// Case-insensitive substring of the method name.
    Substring(String),
    /// Regular expression matched against the method name.
    Pattern(Regex),
}

impl RefreshFilter {
    /// Parses a filter; `re:` prefixes a regular expression.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.strip_prefix(REGEX_PREFIX) {
            Some(pattern) => Regex::new(pattern)
                .map(RefreshFilter::Pattern)
                .map_err(|err| DaoError::config(format!("refresh filter '{raw}': {err}"))),
            None if raw.is_empty() => Err(DaoError::config("refresh filter must not be empty")),
            None => Ok(RefreshFilter::Substring(raw.to_lowercase())),
        }
    }

    /// True when `method` matches.
    pub fn matches(&self, method: &str) -> bool {
        match self {
            RefreshFilter::Substring(needle) => method.to_lowercase().contains(needle.as_str()),
            RefreshFilter::Pattern(re) => re.is_match(method),
        }
    }
}

/// Filters OR-combined.
#[derive(Clone, Debug, Default)]
pub struct RefreshFilters(Vec<RefreshFilter>);

impl RefreshFilters {
    /// Parses every filter, failing on the first bad one.
    pub fn parse<I, S>(raw: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        raw.into_iter()
            .map(|s| RefreshFilter::parse(s.as_ref()))
            .collect::<Result<Vec<_>>>()
            .map(RefreshFilters)
    }

    /// True when any filter matches `method`.
    pub fn matches(&self, method: &str) -> bool {
        self.0.iter().any(|f| f.matches(method))
    }

    /// True when no filters are configured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_is_case_insensitive() {
        let filters = RefreshFilters::parse(["Insert", "re:^(update|delete)_"]).unwrap();
        assert!(filters.matches("bulkINSERTUsers"));
        assert!(filters.matches("delete_user"));
        assert!(!filters.matches("undelete_user"));
        assert!(!filters.matches("findUser"));
    }

    #[test]
    fn bad_patterns_are_config_errors() {
        let err = RefreshFilter::parse("re:(").unwrap_err();
        assert_eq!(err.code(), "InvalidConfig");
        assert!(RefreshFilter::parse("").is_err());
    }

    #[test]
    fn no_filters_match_nothing() {
        assert!(!RefreshFilters::default().matches("insert"));
    }
}
