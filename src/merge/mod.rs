#![forbid(unsafe_code)]

//! Folding flat join rows into nested entities.
//!
//! Rows sharing an identity key collapse into one entity whose nested
//! collections gather the prefixed columns of every constituent row. The
//! merge is a single left-to-right pass holding one in-progress entity, so
//! rows must arrive grouped by identity key.

mod key;
mod row;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::error::{DaoError, Result};
use crate::value::Value;

pub use key::MergeKey;
pub use row::Row;

/// How nested columns map onto one collection property.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NestedSpec {
    /// Collection property on the parent entity.
    pub property: String,
    /// Column prefix; `prefix.field` columns feed this collection.
    pub prefix: String,
    /// Nested identity fields; a row where all of them are null contributes
    /// no element. When empty, every nested column is checked instead.
    #[serde(default)]
    pub identity: Vec<String>,
    /// Collect the bare value of the first nested column instead of an object.
    #[serde(default)]
    pub scalar: bool,
}

impl NestedSpec {
    /// Object-valued collection fed by `prefix.*` columns.
    pub fn new(property: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            prefix: prefix.into(),
            identity: Vec::new(),
            scalar: false,
        }
    }

    /// Collection of bare values read from the column named `column` (or
    /// `column.*`).
    pub fn scalar(property: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            scalar: true,
            ..Self::new(property, column)
        }
    }

    /// Sets the nested identity fields.
    pub fn with_identity<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identity = fields.into_iter().map(Into::into).collect();
        self
    }

    fn field_for<'c>(&self, column: &'c str) -> Option<&'c str> {
        if column == self.prefix {
            return Some(column);
        }
        column
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|field| !field.is_empty())
    }
}

/// Column metadata used to auto-detect identity columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Column name.
    pub name: String,
    /// Whether the column is part of the entity identity.
    pub is_identity: bool,
}

/// Identity columns plus nested collection mappings.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct IdentitySpec {
    /// Explicit identity columns. Empty means auto-detect: a column named
    /// `id` if present, otherwise every non-nested column.
    pub identity: Vec<String>,
    /// Nested collections.
    pub nested: Vec<NestedSpec>,
}

impl IdentitySpec {
    /// Spec with explicit identity columns.
    pub fn new<I, S>(identity: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identity: identity.into_iter().map(Into::into).collect(),
            nested: Vec::new(),
        }
    }

    /// Adds a nested collection mapping.
    pub fn nested(mut self, nested: NestedSpec) -> Self {
        self.nested.push(nested);
        self
    }

    /// Fills identity columns from caller-supplied metadata when none were
    /// given explicitly.
    pub fn with_identity_metadata<I>(mut self, meta: I) -> Self
    where
        I: IntoIterator<Item = ColumnMeta>,
    {
        if self.identity.is_empty() {
            self.identity = meta
                .into_iter()
                .filter(|m| m.is_identity)
                .map(|m| m.name)
                .collect();
        }
        self
    }
}

struct NestedLayout {
    property: String,
    scalar: bool,
    columns: Vec<(usize, String)>,
    identity: Vec<usize>,
}

struct Layout {
    header: Arc<[String]>,
    identity: Vec<usize>,
    parent: Vec<usize>,
    nested: Vec<NestedLayout>,
}

impl Layout {
    fn build(header: &Arc<[String]>, spec: &IdentitySpec) -> Result<Self> {
        let names: Vec<&str> = header.iter().map(|c| c.trim_matches('"')).collect();
        let mut owner: Vec<Option<usize>> = vec![None; names.len()];
        let mut nested = Vec::with_capacity(spec.nested.len());
        for (n_idx, n) in spec.nested.iter().enumerate() {
            let mut columns = Vec::new();
            for (c_idx, name) in names.iter().enumerate() {
                if owner[c_idx].is_some() {
                    continue;
                }
                if let Some(field) = n.field_for(name) {
                    owner[c_idx] = Some(n_idx);
                    columns.push((c_idx, field.to_owned()));
                }
            }
            let identity = if n.identity.is_empty() {
                columns.iter().map(|(idx, _)| *idx).collect()
            } else {
                n.identity
                    .iter()
                    .map(|field| {
                        columns
                            .iter()
                            .find(|(_, f)| f == field)
                            .map(|(idx, _)| *idx)
                            .ok_or_else(|| {
                                DaoError::config(format!(
                                    "nested identity '{}.{field}' not in result columns",
                                    n.prefix
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>>>()?
            };
            nested.push(NestedLayout {
                property: n.property.clone(),
                scalar: n.scalar,
                columns,
                identity,
            });
        }

        let parent: Vec<usize> = (0..names.len()).filter(|i| owner[*i].is_none()).collect();
        let identity = if spec.identity.is_empty() {
            match parent.iter().find(|&&i| names[i].eq_ignore_ascii_case("id")) {
                Some(&id) => vec![id],
                None => parent.clone(),
            }
        } else {
            spec.identity
                .iter()
                .map(|col| {
                    names
                        .iter()
                        .position(|name| *name == col.as_str())
                        .ok_or_else(|| {
                            DaoError::config(format!("identity column '{col}' not in result"))
                        })
                })
                .collect::<Result<Vec<_>>>()?
        };

        Ok(Self {
            header: Arc::clone(header),
            identity,
            parent,
            nested,
        })
    }

    fn matches(&self, header: &Arc<[String]>) -> bool {
        Arc::ptr_eq(&self.header, header) || self.header == *header
    }

    fn start_entity(&self, key: MergeKey, values: &[Value]) -> OpenEntity {
        let mut props: BTreeMap<String, Value> = self
            .parent
            .iter()
            .map(|&i| (self.header[i].trim_matches('"').to_owned(), values[i].clone()))
            .collect();
        for nested in &self.nested {
            props.insert(nested.property.clone(), Value::List(Vec::new()));
        }
        let mut entity = OpenEntity {
            key,
            props,
            seen: vec![HashSet::new(); self.nested.len()],
        };
        self.append_nested(&mut entity, values);
        entity
    }

    /// Adds one element per nested collection. Rows of a join over several
    /// collections repeat each element, so elements whose nested identity
    /// was already seen on this entity are skipped.
    fn append_nested(&self, entity: &mut OpenEntity, values: &[Value]) {
        for (nested, seen) in self.nested.iter().zip(entity.seen.iter_mut()) {
            if nested.columns.is_empty() {
                continue;
            }
            let element_key = MergeKey::from_values(values, &nested.identity);
            if element_key.is_all_null() || !seen.insert(element_key) {
                continue;
            }
            let element = if nested.scalar {
                values[nested.columns[0].0].clone()
            } else {
                Value::Object(
                    nested
                        .columns
                        .iter()
                        .map(|(idx, field)| (field.clone(), values[*idx].clone()))
                        .collect(),
                )
            };
            if let Some(Value::List(items)) = entity.props.get_mut(&nested.property) {
                items.push(element);
            }
        }
    }
}

struct OpenEntity {
    key: MergeKey,
    props: BTreeMap<String, Value>,
    seen: Vec<HashSet<MergeKey>>,
}

/// Lazily merges a row stream; see [`merge`].
pub struct MergeIter<I> {
    rows: I,
    spec: IdentitySpec,
    layout: Option<Layout>,
    current: Option<OpenEntity>,
    closed: HashSet<MergeKey>,
    row_index: usize,
    emitted: usize,
    done: bool,
}

impl<I> MergeIter<I>
where
    I: Iterator<Item = Result<Row>>,
{
    fn fail(&mut self, err: DaoError) -> Option<Result<Value>> {
        self.done = true;
        self.current = None;
        Some(Err(err))
    }

    fn ensure_layout(&mut self, header: &Arc<[String]>) -> Result<()> {
        let rebuild = match &self.layout {
            Some(layout) => !layout.matches(header),
            None => true,
        };
        if rebuild {
            self.layout = Some(Layout::build(header, &self.spec)?);
        }
        Ok(())
    }
}

impl<I> Iterator for MergeIter<I>
where
    I: Iterator<Item = Result<Row>>,
{
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let row = match self.rows.next() {
                None => {
                    self.done = true;
                    let last = self.current.take().map(|e| Ok(Value::Object(e.props)));
                    if last.is_some() {
                        self.emitted += 1;
                    }
                    debug!(rows = self.row_index, entities = self.emitted, "merge finished");
                    return last;
                }
                Some(Err(err)) => return self.fail(err),
                Some(Ok(row)) => row,
            };
            let row_index = self.row_index;
            self.row_index += 1;
            if row.values().len() != row.columns().len() {
                return self.fail(DaoError::Execution(format!(
                    "row {row_index} has {} values for {} columns",
                    row.values().len(),
                    row.columns().len()
                )));
            }

            if let Err(err) = self.ensure_layout(row.columns()) {
                return self.fail(err);
            }
            let Some(layout) = self.layout.as_ref() else {
                return self.fail(DaoError::config("merge layout unavailable"));
            };
            let key = MergeKey::from_values(row.values(), &layout.identity);

            if let Some(entity) = self.current.as_mut() {
                if entity.key == key {
                    layout.append_nested(entity, row.values());
                    continue;
                }
            }
            if self.closed.contains(&key) {
                let key = key.to_string();
                return self.fail(DaoError::UnsupportedRowOrdering { key, row: row_index });
            }

            let entity = layout.start_entity(key, row.values());
            if let Some(finished) = self.current.replace(entity) {
                self.closed.insert(finished.key);
                self.emitted += 1;
                return Some(Ok(Value::Object(finished.props)));
            }
        }
    }
}

/// Merges `rows` into entities, lazily and in first-appearance order.
///
/// The iterator stops after the first error, including
/// [`DaoError::UnsupportedRowOrdering`] when a key reappears after another
/// key interrupted it.
pub fn merge<I>(rows: I, spec: IdentitySpec) -> MergeIter<I::IntoIter>
where
    I: IntoIterator<Item = Result<Row>>,
{
    MergeIter {
        rows: rows.into_iter(),
        spec,
        layout: None,
        current: None,
        closed: HashSet::new(),
        row_index: 0,
        emitted: 0,
        done: false,
    }
}

/// Collects [`merge`] into a vector.
pub fn merge_all<I>(rows: I, spec: IdentitySpec) -> Result<Vec<Value>>
where
    I: IntoIterator<Item = Result<Row>>,
{
    merge(rows, spec).collect()
}
