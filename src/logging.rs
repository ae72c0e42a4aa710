//! Tracing subscriber setup for binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{DaoError, Result};

/// Installs a global `fmt` subscriber filtered by `level`, which accepts
/// any `EnvFilter` directive such as `debug` or `sqldao::cache=trace`.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| DaoError::config(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| DaoError::config("logging already initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_directives() {
        let err = init_logging("sqldao=notalevel").unwrap_err();
        assert_eq!(err.code(), "InvalidConfig");
    }
}
