//! Write inputs and read outputs.

use crate::codec::Value;

/// One field of a [`Record`]: a plain value, or a nested record for a
/// reference column (inserted into the referenced table first).
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Value(Value),
    Nested(Record),
}

/// Ordered field → input map used by `insert` and `update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Input)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Record::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, Input::Value(value.into()));
        self
    }

    pub fn with_nested(mut self, name: impl Into<String>, record: Record) -> Self {
        self.set(name, Input::Nested(record));
        self
    }

    /// Set a field, replacing a previous input of the same name.
    pub fn set(&mut self, name: impl Into<String>, input: Input) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = input,
            None => self.fields.push((name, input)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Input> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, i)| i)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Input)> {
        self.fields.iter().map(|(n, i)| (n.as_str(), i))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.set(k, Input::Value(v.into()));
        }
        record
    }
}

/// One column of a [`Batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchInput {
    Values(Vec<Value>),
    Nested(Batch),
}

/// Columnar input for `insert_batch`: one list per field, all of equal length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    fields: Vec<(String, BatchInput)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<V: Into<Value>>(mut self, name: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.set(name, BatchInput::Values(values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_nested(mut self, name: impl Into<String>, batch: Batch) -> Self {
        self.set(name, BatchInput::Nested(batch));
        self
    }

    pub fn set(&mut self, name: impl Into<String>, input: BatchInput) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = input,
            None => self.fields.push((name, input)),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &BatchInput)> {
        self.fields.iter().map(|(n, i)| (n.as_str(), i))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Read-side field: a value, or the joined row replacing a reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Value(Value),
    Row(Row),
}

/// A materialized row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: i64,
    fields: Vec<(String, Datum)>,
}

impl Row {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            fields: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, datum: Datum) {
        self.fields.push((name.into(), datum));
    }

    pub fn datum(&self, name: &str) -> Option<&Datum> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    /// Plain value of a field (None if absent or joined).
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.datum(name)? {
            Datum::Value(v) => Some(v),
            Datum::Row(_) => None,
        }
    }

    pub fn joined(&self, name: &str) -> Option<&Row> {
        match self.datum(name)? {
            Datum::Row(r) => Some(r),
            Datum::Value(_) => None,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Datum)> {
        self.fields.iter().map(|(n, d)| (n.as_str(), d))
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// No fields besides the id.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Drop null fields, keeping only what was actually written.
    pub fn without_nulls(mut self) -> Self {
        self.fields
            .retain(|(_, d)| !matches!(d, Datum::Value(Value::Null)));
        self
    }

    /// Plain values as a [`Record`] (joined rows are skipped).
    pub fn to_record(&self) -> Record {
        self.fields
            .iter()
            .filter_map(|(n, d)| match d {
                Datum::Value(v) => Some((n.clone(), v.clone())),
                Datum::Row(_) => None,
            })
            .collect()
    }
}

/// Column of a [`ColumnBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Values(Vec<Value>),
    /// Joined rows, `None` where the reference was null
    Joined(Vec<Option<Row>>),
}

/// Batched (column-major) read result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnBatch {
    pub ids: Vec<i64>,
    columns: Vec<(String, Column)>,
}

impl ColumnBatch {
    /// Pivot row-major results. Missing fields become `Null` / `None`.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut names: Vec<(String, bool)> = Vec::new();
        for row in &rows {
            for (name, datum) in row.fields() {
                let joined = matches!(datum, Datum::Row(_));
                match names.iter_mut().find(|(n, _)| n == name) {
                    Some((_, j)) => *j |= joined,
                    None => names.push((name.to_string(), joined)),
                }
            }
        }
        let columns = names
            .into_iter()
            .map(|(name, joined)| {
                let column = if joined {
                    Column::Joined(rows.iter().map(|r| r.joined(&name).cloned()).collect())
                } else {
                    Column::Values(
                        rows.iter()
                            .map(|r| r.get(&name).cloned().unwrap_or_default())
                            .collect(),
                    )
                };
                (name, column)
            })
            .collect();
        Self {
            ids: rows.iter().map(|r| r.id).collect(),
            columns,
        }
    }

    pub fn get(&self, name: &str) -> Option<&[Value]> {
        match self.column(name)? {
            Column::Values(v) => Some(v),
            Column::Joined(_) => None,
        }
    }

    pub fn joined(&self, name: &str) -> Option<&[Option<Row>]> {
        match self.column(name)? {
            Column::Joined(r) => Some(r),
            Column::Values(_) => None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
