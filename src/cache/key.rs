use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;
use xxhash_rust::xxh64::Xxh64;

use crate::error::Result;

/// Method signature plus a canonical serialization of the call arguments.
///
/// Arguments are serialized to JSON; map-backed argument types serialize
/// with sorted keys, so equal argument sets produce equal keys.
#[derive(Clone, Debug)]
pub struct CacheKey {
    method: String,
    args: String,
    fingerprint: u64,
}

impl CacheKey {
    /// Builds a key for `method` called with `args`.
    pub fn new<A: Serialize + ?Sized>(method: &str, args: &A) -> Result<Self> {
        let args = serde_json::to_string(args)?;
        Ok(Self::from_parts(method, args))
    }

    /// Builds a key from an already serialized argument string.
    pub fn from_parts(method: impl Into<String>, args: impl Into<String>) -> Self {
        let method = method.into();
        let args = args.into();
        let mut hasher = Xxh64::new(0);
        hasher.write(method.as_bytes());
        hasher.write_u8(0);
        hasher.write(args.as_bytes());
        Self {
            fingerprint: hasher.finish(),
            method,
            args,
        }
    }

    /// Method signature.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Serialized arguments.
    pub fn args(&self) -> &str {
        &self.args
    }

    /// 64-bit fingerprint of method and arguments.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
            && self.method == other.method
            && self.args == other.args
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fingerprint);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:016x}", self.method, self.fingerprint)
    }
}
