//! Onion-style interception around DAO method invocations.
//!
//! `before` hooks run in declaration order, then the operation, then
//! `after` or `on_error` in reverse order. A `before` hook that fails
//! skips the operation and every inner hook; hooks already entered see
//! `on_error`, innermost first.

use std::sync::Arc;

use tracing::debug;

use crate::error::{DaoError, Result};

/// Describes the call being intercepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Invocation<'a> {
    /// DAO method name.
    pub method: &'a str,
    /// False when the call comes from another method of the same DAO.
    pub is_external: bool,
}

impl<'a> Invocation<'a> {
    /// A call from outside the DAO.
    pub fn external(method: &'a str) -> Self {
        Self {
            method,
            is_external: true,
        }
    }

    /// A call made by another method of the same DAO.
    pub fn internal(method: &'a str) -> Self {
        Self {
            method,
            is_external: false,
        }
    }
}

/// One hook pair around an invocation.
pub trait Interceptor: Send + Sync {
    /// Name used in logs and rejection errors.
    fn name(&self) -> &str;

    /// Skip this hook for calls made from within the same DAO.
    fn external_only(&self) -> bool {
        false
    }

    /// Runs before the operation; an error short-circuits the call.
    fn before(&self, _call: &Invocation<'_>) -> Result<()> {
        Ok(())
    }

    /// Runs after a successful operation.
    fn after(&self, _call: &Invocation<'_>) {}

    /// Runs after a failed operation or a failed inner `before`.
    fn on_error(&self, _call: &Invocation<'_>, _error: &DaoError) {}
}

/// Ordered list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an interceptor as the innermost hook.
    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Builder form of [`push`](Self::push).
    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.push(interceptor);
        self
    }

    /// Number of interceptors.
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// True when no interceptors are registered.
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Runs `op` wrapped by every applicable interceptor.
    pub fn invoke<T, F>(&self, call: &Invocation<'_>, op: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let active: Vec<&Arc<dyn Interceptor>> = self
            .interceptors
            .iter()
            .filter(|i| call.is_external || !i.external_only())
            .collect();

        for (depth, interceptor) in active.iter().enumerate() {
            if let Err(err) = interceptor.before(call) {
                debug!(
                    method = call.method,
                    interceptor = interceptor.name(),
                    error = %err,
                    "interceptor short-circuited invocation"
                );
                for entered in active[..depth].iter().rev() {
                    entered.on_error(call, &err);
                }
                return Err(err);
            }
        }

        let result = op();
        match &result {
            Ok(_) => active.iter().rev().for_each(|i| i.after(call)),
            Err(err) => active.iter().rev().for_each(|i| i.on_error(call, err)),
        }
        result
    }
}

/// Rejection raised by a `before` hook.
pub fn reject(interceptor: &dyn Interceptor, message: impl Into<String>) -> DaoError {
    DaoError::Interceptor {
        name: interceptor.name().to_owned(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        external_only: bool,
        reject: bool,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                external_only: false,
                reject: false,
            }
        }
    }

    impl Interceptor for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn external_only(&self) -> bool {
            self.external_only
        }

        fn before(&self, _call: &Invocation<'_>) -> Result<()> {
            self.log.lock().push(format!("{}.before", self.name));
            if self.reject {
                return Err(reject(self, "denied"));
            }
            Ok(())
        }

        fn after(&self, _call: &Invocation<'_>) {
            self.log.lock().push(format!("{}.after", self.name));
        }

        fn on_error(&self, _call: &Invocation<'_>, _error: &DaoError) {
            self.log.lock().push(format!("{}.error", self.name));
        }
    }

    fn chain(log: &Arc<Mutex<Vec<String>>>, tweak: impl Fn(&mut Recorder)) -> InterceptorChain {
        ["a", "b", "c"].into_iter().fold(InterceptorChain::new(), |chain, name| {
            let mut r = Recorder::new(name, log);
            tweak(&mut r);
            chain.with(Arc::new(r))
        })
    }

    #[test]
    fn hooks_nest_like_an_onion() {
        let log = Arc::default();
        let chain = chain(&log, |_| {});
        let out = chain
            .invoke(&Invocation::external("find"), || {
                log.lock().push("op".into());
                Ok(5)
            })
            .unwrap();
        assert_eq!(out, 5);
        assert_eq!(
            *log.lock(),
            ["a.before", "b.before", "c.before", "op", "c.after", "b.after", "a.after"]
        );
    }

    #[test]
    fn operation_errors_run_on_error_in_reverse() {
        let log = Arc::default();
        let chain = chain(&log, |_| {});
        let result: Result<()> =
            chain.invoke(&Invocation::external("find"), || Err(DaoError::Execution("x".into())));
        assert!(result.is_err());
        assert_eq!(
            *log.lock(),
            ["a.before", "b.before", "c.before", "c.error", "b.error", "a.error"]
        );
    }

    #[test]
    fn rejecting_before_skips_operation_and_inner_hooks() {
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let chain = chain(&log, |r| r.reject = r.name == "b");
        let ran = Mutex::new(false);
        let err = chain
            .invoke(&Invocation::external("find"), || {
                *ran.lock() = true;
                Ok(())
            })
            .unwrap_err();
        assert!(!*ran.lock());
        assert_eq!(err.code(), "InterceptorRejected");
        assert_eq!(*log.lock(), ["a.before", "b.before", "a.error"]);
    }

    #[test]
    fn external_only_hooks_skip_internal_calls() {
        let log = Arc::default();
        let chain = chain(&log, |r| r.external_only = r.name != "b");
        chain.invoke(&Invocation::internal("find"), || Ok(())).unwrap();
        assert_eq!(*log.lock(), ["b.before", "b.after"]);
    }
}
