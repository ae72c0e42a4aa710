use std::fmt;

use crate::value::Value;

/// Identity-column values of one row, compared by value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MergeKey(Vec<KeyPart>);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    // Bit pattern; -0.0 and NaN payloads compare as distinct keys.
    Float(u64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(i128),
    Composite(String),
}

impl MergeKey {
    /// Builds a key from the values at `indices`.
    pub(crate) fn from_values(values: &[Value], indices: &[usize]) -> Self {
        MergeKey(indices.iter().map(|&idx| KeyPart::from(&values[idx])).collect())
    }

    /// True when every identity column was null, or there were none.
    pub(crate) fn is_all_null(&self) -> bool {
        self.0.iter().all(|part| matches!(part, KeyPart::Null))
    }
}

impl From<&Value> for KeyPart {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Int(v) => KeyPart::Int(*v),
            Value::Float(v) => KeyPart::Float(v.to_bits()),
            Value::String(s) => KeyPart::String(s.clone()),
            Value::Bytes(b) => KeyPart::Bytes(b.clone()),
            Value::DateTime(ns) => KeyPart::DateTime(*ns),
            composite @ (Value::List(_) | Value::Object(_)) => {
                KeyPart::Composite(serde_json::to_string(composite).unwrap_or_default())
            }
        }
    }
}

impl fmt::Display for MergeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (idx, part) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            match part {
                KeyPart::Null => f.write_str("NULL")?,
                KeyPart::Bool(b) => write!(f, "{b}")?,
                KeyPart::Int(v) => write!(f, "{v}")?,
                KeyPart::Float(bits) => write!(f, "{}", f64::from_bits(*bits))?,
                KeyPart::String(s) => write!(f, "{s:?}")?,
                KeyPart::Bytes(b) => write!(f, "<{} bytes>", b.len())?,
                KeyPart::DateTime(ns) => write!(f, "{ns}")?,
                KeyPart::Composite(json) => f.write_str(json)?,
            }
        }
        f.write_str(")")
    }
}
