//! Table export to JSON and CSV, one file per table.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::codec::{Elements, NdArray, Value};
use crate::error::{StoreError, StoreResult};
use crate::query::{Projection, Selection};
use crate::record::Column;
use crate::schema::ID_COLUMN;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// `{ "id": [...], "<column>": [...] }`
    Json,
    /// Header `id,<columns>` then one line per row
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

/// Export `tables` (every table when `None`) to `<out_base>_<Table>.<ext>`.
/// Returns the written paths.
pub fn export_tables(
    store: &Store,
    format: ExportFormat,
    out_base: &Path,
    tables: Option<&[&str]>,
) -> StoreResult<Vec<PathBuf>> {
    let names: Vec<String> = match tables {
        Some(tables) => tables.iter().map(|t| t.to_string()).collect(),
        None => store.tables(),
    };
    let stem = out_base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = out_base.parent().unwrap_or(Path::new(""));

    let mut written = Vec::with_capacity(names.len());
    for name in names {
        let display = store.table_def(&name)?.name.clone();
        let path = dir.join(format!("{stem}_{display}.{}", format.extension()));
        export_table(store, &display, format, &path)?;
        written.push(path);
    }
    log::info!("Exported {} table(s) from {}", written.len(), store.name());
    Ok(written)
}

/// Export one table to `path`.
pub fn export_table(store: &Store, table: &str, format: ExportFormat, path: &Path) -> StoreResult<()> {
    let mut columns = vec![ID_COLUMN.to_string()];
    columns.extend(store.columns(table)?.iter().map(|c| c.name.clone()));
    let batch = store.get_columns(table, &Selection::All, &Projection::all())?;

    let mut out = BufWriter::new(File::create(path)?);
    match format {
        ExportFormat::Json => {
            let mut object = serde_json::Map::new();
            object.insert(
                ID_COLUMN.to_string(),
                serde_json::Value::from(batch.ids.clone()),
            );
            for name in &columns[1..] {
                let values = batch
                    .column(name)
                    .map(column_to_json)
                    .unwrap_or_else(|| serde_json::Value::Array(vec![serde_json::Value::Null; batch.len()]));
                object.insert(name.clone(), values);
            }
            serde_json::to_writer_pretty(&mut out, &object)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        }
        ExportFormat::Csv => {
            writeln!(out, "{}", columns.iter().map(|c| csv_escape(c)).collect::<Vec<_>>().join(","))?;
            for (i, id) in batch.ids.iter().enumerate() {
                let mut line = vec![id.to_string()];
                for name in &columns[1..] {
                    let cell = match batch.get(name) {
                        Some(values) => csv_cell(&values[i]),
                        None => String::new(),
                    };
                    line.push(cell);
                }
                writeln!(out, "{}", line.join(","))?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

fn column_to_json(column: &Column) -> serde_json::Value {
    match column {
        Column::Values(values) => values.iter().map(value_to_json).collect(),
        Column::Joined(rows) => rows
            .iter()
            .map(|r| r.as_ref().map_or(serde_json::Value::Null, |r| r.id.into()))
            .collect(),
    }
}

/// JSON form of a value. Arrays become nested lists following their shape;
/// timestamps are microseconds since the Unix epoch.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(v) => (*v).into(),
        Value::Float(v) => serde_json::Number::from_f64(*v).map_or(serde_json::Value::Null, Into::into),
        Value::Text(s) => s.clone().into(),
        Value::Boolean(b) => (*b).into(),
        Value::Timestamp(t) => t.as_micros().into(),
        Value::Array(a) => array_to_json(a),
    }
}

fn array_to_json(array: &NdArray) -> serde_json::Value {
    let flat: Vec<serde_json::Value> = match array.elements() {
        Elements::Float(v) => v
            .iter()
            .map(|x| serde_json::Number::from_f64(*x).map_or(serde_json::Value::Null, Into::into))
            .collect(),
        Elements::Integer(v) => v.iter().map(|x| (*x).into()).collect(),
    };
    nest(&flat, array.shape())
}

fn nest(flat: &[serde_json::Value], shape: &[usize]) -> serde_json::Value {
    match shape {
        [] => flat.first().cloned().unwrap_or(serde_json::Value::Null),
        [_] => serde_json::Value::Array(flat.to_vec()),
        [n, rest @ ..] => {
            let stride: usize = rest.iter().product();
            (0..*n)
                .map(|i| nest(&flat[i * stride..(i + 1) * stride], rest))
                .collect()
        }
    }
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Text(s) => csv_escape(s),
        Value::Array(_) => csv_escape(&value_to_json(value).to_string()),
        other => value_to_json(other).to_string(),
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
