use std::sync::Arc;

use crate::value::Value;

/// One flat result row. Rows of a single result set share their column
/// header.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Builds a row; `values` should line up with `columns`. The merger
    /// rejects rows that do not.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Builds a row with its own header from `(column, value)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self::new(columns.into(), values)
    }

    /// Column header.
    pub fn columns(&self) -> &Arc<[String]> {
        &self.columns
    }

    /// Values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value of the named column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    /// Converts the row into an object keyed by column name.
    pub fn into_object(self) -> Value {
        Value::Object(
            self.columns
                .iter()
                .cloned()
                .zip(self.values)
                .collect(),
        )
    }
}
