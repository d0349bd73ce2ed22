//! File-level maintenance: merge, rename, remove, export.
//!
//! Each helper opens the store file as its single writer, applies the change
//! and closes it again, so they must not run while a producer holds the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::codec::Value;
use crate::error::StoreResult;
use crate::export::{export_tables, ExportFormat};
use crate::query::{Projection, Selection};
use crate::record::{Batch, BatchInput};
use crate::schema::{ColumnSpec, FieldType, TableDef, TableId};
use crate::store::{Store, StoreConfig};

/// Merge several store files into a new store.
///
/// Tables are unioned by name, columns by name. Rows are appended in source
/// order and references are remapped to the ids the rows get in the target.
pub fn merge(sources: &[PathBuf], target: StoreConfig, remove_existing: bool) -> StoreResult<Store> {
    let mut merged = Store::create(target, remove_existing)?;
    for source in sources {
        let source_store = Store::open_read_only(StoreConfig::from_path(source))?;
        merge_one(&source_store, &mut merged)?;
        log::info!("Merged {} into {}", source.display(), merged.name());
    }
    merged.flush()?;
    Ok(merged)
}

fn merge_one(source: &Store, target: &mut Store) -> StoreResult<()> {
    let mut id_map: HashMap<(TableId, i64), i64> = HashMap::new();
    for def in dependency_order(source) {
        let specs: Vec<ColumnSpec> = def
            .columns()
            .iter()
            .filter(|c| !def.is_protected(&c.name))
            .map(|c| {
                let field_type = match c.references.and_then(|t| source.catalog().get(t)) {
                    Some(referenced) => FieldType::Reference(referenced.name.clone()),
                    None => FieldType::Kind(c.kind),
                };
                ColumnSpec {
                    name: c.name.clone(),
                    field_type,
                    default: c.default.clone(),
                }
            })
            .collect();
        target.create_table(&def.name, def.role, &specs)?;

        let rows = source.get_rows(&def.name, &Selection::All, &Projection::all())?;
        if rows.is_empty() {
            continue;
        }
        let mut batch = Batch::new();
        for spec in &specs {
            let column = def.column(&spec.name);
            let values = rows
                .iter()
                .map(|row| {
                    let value = row.get(&spec.name).cloned().unwrap_or_default();
                    match (column.and_then(|c| c.references), value.as_i64()) {
                        (Some(referenced), Some(old)) => id_map
                            .get(&(referenced, old))
                            .map_or(Value::Null, |new| Value::Integer(*new)),
                        _ => value,
                    }
                })
                .collect();
            batch.set(spec.name.clone(), BatchInput::Values(values));
        }
        let new_ids = if batch.is_empty() {
            let before = target.count(&def.name)?;
            target.pad_to(&def.name, before + rows.len())?;
            ((before + 1) as i64..=(before + rows.len()) as i64).collect()
        } else {
            target.insert_batch(&def.name, batch)?
        };
        for (row, new_id) in rows.iter().zip(new_ids) {
            id_map.insert((def.id, row.id), new_id);
        }
    }
    Ok(())
}

/// Tables ordered so that referenced tables come before their referrers.
fn dependency_order(store: &Store) -> Vec<&TableDef> {
    let mut remaining: Vec<&TableDef> = store.catalog().tables().collect();
    let mut ordered: Vec<&TableDef> = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready = remaining.iter().position(|t| {
            t.references()
                .all(|(_, target)| target == t.id || ordered.iter().any(|o| o.id == target))
        });
        // A reference cycle cannot be created through the catalog; fall back
        // to creation order if one shows up anyway.
        let next = ready.unwrap_or(0);
        ordered.push(remaining.remove(next));
    }
    ordered
}

fn with_store<T>(path: &Path, f: impl FnOnce(&mut Store) -> StoreResult<T>) -> StoreResult<T> {
    let mut store = Store::load(StoreConfig::from_path(path))?;
    let result = f(&mut store);
    store.close(false)?;
    result
}

pub fn rename_tables(path: &Path, renames: &[(&str, &str)]) -> StoreResult<()> {
    with_store(path, |store| {
        for (old, new) in renames {
            store.rename_table(old, new)?;
        }
        Ok(())
    })
}

pub fn rename_fields(path: &Path, table: &str, renames: &[(&str, &str)]) -> StoreResult<()> {
    with_store(path, |store| {
        for (old, new) in renames {
            store.rename_column(table, old, new)?;
        }
        Ok(())
    })
}

/// Remove tables, referrers first regardless of the order given.
pub fn remove_tables(path: &Path, names: &[&str]) -> StoreResult<()> {
    with_store(path, |store| {
        let mut remaining: Vec<&str> = names.to_vec();
        while !remaining.is_empty() {
            let mut last_error = None;
            let before = remaining.len();
            remaining.retain(|name| match store.remove_table(name) {
                Ok(()) => false,
                Err(e) => {
                    last_error = Some(e);
                    true
                }
            });
            if remaining.len() == before {
                if let Some(e) = last_error {
                    return Err(e);
                }
            }
        }
        Ok(())
    })
}

pub fn remove_fields(path: &Path, table: &str, names: &[&str]) -> StoreResult<()> {
    with_store(path, |store| {
        for name in names {
            store.remove_column(table, name)?;
        }
        Ok(())
    })
}

/// Export tables of a store file. See [`export_tables`].
pub fn export(path: &Path, format: ExportFormat, out_base: &Path, tables: Option<&[&str]>) -> StoreResult<Vec<PathBuf>> {
    let store = Store::open_read_only(StoreConfig::from_path(path))?;
    export_tables(&store, format, out_base, tables)
}

/// Human-readable listing of a store file's tables and columns.
pub fn architecture(path: &Path) -> StoreResult<String> {
    let store = Store::open_read_only(StoreConfig::from_path(path))?;
    Ok(store.architecture())
}
