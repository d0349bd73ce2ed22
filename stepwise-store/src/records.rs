//! Row writes (insert, batch insert, update) and reads.
//!
//! Every write runs in three stages:
//! ```text
//! 1. extend   unknown fields on an empty table become columns
//! 2. plan     validate + encode every row, nested references first,
//!             allocate ids  (no mutation; any error leaves the store as is)
//! 3. execute  before-handlers ─► one journal frame ─► after-handlers
//! ```
//! Batches are planned row by row and journaled as chunks of at most
//! [`BATCH_CHUNK_SIZE`] rows, all inside the same frame.

use std::collections::{BTreeMap, HashMap};

use crate::codec::{self, CodecError, ColumnKind, Timestamp, Value};
use crate::error::{StoreError, StoreResult};
use crate::journal::{JournalOp, RowOp};
use crate::notifier::{Phase, WriteEvent, WriteKind};
use crate::query::{clamp_row_id, Projection, Selection};
use crate::record::{Batch, BatchInput, ColumnBatch, Datum, Input, Record, Row};
use crate::schema::{ColumnDef, ColumnId, ColumnSpec, TableDef, TableId, TableRole, TIMESTAMP_COLUMN};
use crate::store::Store;
use crate::table::{StoredRow, TableData};

/// Maximum rows per insert op inside a batch frame.
pub const BATCH_CHUNK_SIZE: usize = 100;

struct PlannedWrite {
    table: TableId,
    event: WriteEvent,
}

/// Validated, encoded writes waiting to be executed.
#[derive(Default)]
struct WritePlan {
    ops: Vec<JournalOp>,
    /// Rows planned per table, for id allocation
    planned: HashMap<TableId, i64>,
    writes: Vec<PlannedWrite>,
}

impl WritePlan {
    fn allocate(&mut self, def: &TableDef, data: Option<&TableData>) -> i64 {
        let planned = self.planned.entry(def.id).or_insert(0);
        let id = match data {
            Some(data) => data.next_id(def.role, *planned),
            None => TableData::default().next_id(def.role, *planned),
        };
        *planned += 1;
        id
    }

    fn push_insert(&mut self, table: TableId, row: StoredRow) {
        if let Some(JournalOp::Rows(RowOp::Insert { table: last, rows })) = self.ops.last_mut() {
            if *last == table && rows.len() < BATCH_CHUNK_SIZE {
                rows.push(row);
                return;
            }
        }
        self.ops.push(JournalOp::Rows(RowOp::Insert {
            table,
            rows: vec![row],
        }));
    }

    fn tables(&self) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self.writes.iter().map(|w| w.table).collect();
        tables.sort_unstable();
        tables.dedup();
        tables
    }
}

/// Common length of every field list of a batch.
fn batch_len(table: &str, batch: &Batch) -> StoreResult<usize> {
    let mut lengths = Vec::new();
    for (name, input) in batch.fields() {
        let len = match input {
            BatchInput::Values(values) => values.len(),
            BatchInput::Nested(inner) => batch_len(name, inner)?,
        };
        lengths.push((name.to_string(), len));
    }
    match lengths.first() {
        None => Ok(0),
        Some((_, n)) if lengths.iter().all(|(_, len)| len == n) => Ok(*n),
        Some(_) => Err(StoreError::BatchLengthMismatch {
            table: table.to_string(),
            lengths,
        }),
    }
}

fn encode_cell(def: &TableDef, column: &ColumnDef, value: &Value) -> StoreResult<Option<Vec<u8>>> {
    codec::encode(column.kind, value).map_err(|e| match e {
        CodecError::TypeMismatch { expected, found } => StoreError::TypeMismatch {
            table: def.name.clone(),
            column: column.name.clone(),
            expected,
            found,
        },
        other => StoreError::Codec(other),
    })
}

fn protected(def: &TableDef, name: &str) -> StoreError {
    StoreError::ProtectedColumn {
        table: def.name.clone(),
        column: name.to_string(),
    }
}

impl Store {
    // ─── Writes ──────────────────────────────────────────────

    /// Insert one row and return its id.
    ///
    /// Unknown fields become columns while the table is empty (kind taken
    /// from the value). A nested record on a reference column is inserted
    /// into the referenced table first and its id stored.
    pub fn insert(&mut self, table: &str, record: Record) -> StoreResult<i64> {
        let table_id = self.catalog.require(table)?.id;
        self.ensure_idle(table_id)?;
        self.extend_for_record(table_id, &record)?;
        let mut plan = WritePlan::default();
        let id = self.plan_insert(&mut plan, table_id, &record)?;
        self.execute(plan)?;
        Ok(id)
    }

    /// Insert many rows from columnar input, all or nothing.
    pub fn insert_batch(&mut self, table: &str, batch: Batch) -> StoreResult<Vec<i64>> {
        let def = self.catalog.require(table)?;
        let table_id = def.id;
        batch_len(&def.name, &batch)?;
        self.ensure_idle(table_id)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        self.extend_for_batch(table_id, &batch)?;
        let mut plan = WritePlan::default();
        let ids = self.plan_batch(&mut plan, table_id, &batch)?;
        self.execute(plan)?;
        log::debug!("Inserted batch of {} rows into {table}", ids.len());
        Ok(ids)
    }

    /// Update fields of one row and return the id actually written.
    ///
    /// `row_id` follows the clamping law (`-1` is the last row). A nested
    /// record on a reference column updates the referenced row in place,
    /// or inserts and links it when the reference is null.
    pub fn update(&mut self, table: &str, record: Record, row_id: i64) -> StoreResult<i64> {
        let table_id = self.catalog.require(table)?.id;
        self.ensure_idle(table_id)?;
        let mut plan = WritePlan::default();
        let id = self.plan_update(&mut plan, table_id, &record, row_id)?;
        self.execute(plan)?;
        Ok(id)
    }

    /// Append a row holding only its id (no defaults, no handlers).
    pub fn insert_placeholder(&mut self, table: &str) -> StoreResult<i64> {
        let len = self.count(table)?;
        self.pad_to(table, len + 1)?;
        Ok(len as i64 + 1)
    }

    /// Append placeholder rows until `table` holds `len` rows.
    /// Returns how many were added.
    pub fn pad_to(&mut self, table: &str, len: usize) -> StoreResult<usize> {
        let def = self.catalog.require(table)?;
        let table_id = def.id;
        self.ensure_idle(table_id)?;
        let mut plan = WritePlan::default();
        let current = self.data.get(&table_id).map_or(0, TableData::len);
        let missing = len.saturating_sub(current);
        for _ in 0..missing {
            let id = plan.allocate(def, self.data.get(&table_id));
            plan.push_insert(table_id, StoredRow::placeholder(id));
        }
        self.commit(plan.ops)?;
        Ok(missing)
    }

    fn execute(&mut self, plan: WritePlan) -> StoreResult<()> {
        let tables = plan.tables();
        self.begin_write(&tables)?;
        let result = self.run_plan(plan);
        self.end_write(&tables);
        result
    }

    fn run_plan(&mut self, plan: WritePlan) -> StoreResult<()> {
        let WritePlan { ops, writes, .. } = plan;
        for write in &writes {
            self.fire(write.table, Phase::BeforeWrite, &write.event)?;
        }
        self.commit(ops)?;
        for write in &writes {
            self.fire(write.table, Phase::AfterWrite, &write.event)?;
        }
        Ok(())
    }

    // ─── Schema on write ─────────────────────────────────────

    fn extend_for_record(&mut self, table: TableId, record: &Record) -> StoreResult<()> {
        let def = self.table_by_id(table)?;
        let mut unknown = Vec::new();
        let mut nested = Vec::new();
        for (name, input) in record.fields() {
            if def.is_protected(name) {
                return Err(protected(def, name));
            }
            match (def.column(name), input) {
                (Some(column), Input::Nested(inner)) => {
                    if let Some(target) = column.references {
                        nested.push((target, inner));
                    }
                }
                (Some(_), Input::Value(_)) => {}
                (None, Input::Value(value)) => unknown.push((name.to_string(), value.kind())),
                (None, Input::Nested(_)) => unknown.push((name.to_string(), None)),
            }
        }
        self.add_inferred(table, unknown)?;
        for (target, inner) in nested {
            self.extend_for_record(target, inner)?;
        }
        Ok(())
    }

    fn extend_for_batch(&mut self, table: TableId, batch: &Batch) -> StoreResult<()> {
        let def = self.table_by_id(table)?;
        let mut unknown = Vec::new();
        let mut nested = Vec::new();
        for (name, input) in batch.fields() {
            if def.is_protected(name) {
                return Err(protected(def, name));
            }
            match (def.column(name), input) {
                (Some(column), BatchInput::Nested(inner)) => {
                    if let Some(target) = column.references {
                        nested.push((target, inner));
                    }
                }
                (Some(_), BatchInput::Values(_)) => {}
                (None, BatchInput::Values(values)) => {
                    let kind = values.iter().find_map(Value::kind);
                    unknown.push((name.to_string(), kind));
                }
                (None, BatchInput::Nested(_)) => unknown.push((name.to_string(), None)),
            }
        }
        self.add_inferred(table, unknown)?;
        for (target, inner) in nested {
            self.extend_for_batch(target, inner)?;
        }
        Ok(())
    }

    fn add_inferred(&mut self, table: TableId, unknown: Vec<(String, Option<ColumnKind>)>) -> StoreResult<()> {
        if unknown.is_empty() {
            return Ok(());
        }
        let name = self.table_by_id(table)?.name.clone();
        let has_rows = self.data.get(&table).is_some_and(|d| !d.is_empty());
        let blocked: Vec<String> = unknown
            .iter()
            .filter(|(_, kind)| has_rows || kind.is_none())
            .map(|(n, _)| n.clone())
            .collect();
        if !blocked.is_empty() {
            return Err(StoreError::UndeclaredField {
                table: name,
                fields: blocked,
            });
        }
        self.ensure_idle(table)?;
        let specs: Vec<ColumnSpec> = unknown
            .into_iter()
            .filter_map(|(n, kind)| kind.map(|k| ColumnSpec::new(n, k)))
            .collect();
        log::debug!("Adding {} inferred column(s) to empty table {name}", specs.len());
        let ops = self.catalog.plan_add_columns(&name, &specs)?;
        self.commit_catalog(ops)
    }

    // ─── Planning ────────────────────────────────────────────

    pub(crate) fn table_by_id(&self, table: TableId) -> StoreResult<&TableDef> {
        self.catalog
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    fn reference_target(def: &TableDef, column: &ColumnDef, found: &'static str) -> StoreResult<TableId> {
        column.references.ok_or_else(|| StoreError::TypeMismatch {
            table: def.name.clone(),
            column: column.name.clone(),
            expected: column.kind,
            found,
        })
    }

    fn plan_insert(&self, plan: &mut WritePlan, table: TableId, record: &Record) -> StoreResult<i64> {
        let def = self.table_by_id(table)?;
        let mut cells = BTreeMap::new();
        let mut values = Vec::with_capacity(record.len());
        let mut undeclared = Vec::new();

        for (name, input) in record.fields() {
            if def.is_protected(name) {
                return Err(protected(def, name));
            }
            let Some(column) = def.column(name) else {
                undeclared.push(name.to_string());
                continue;
            };
            let value = match input {
                Input::Value(value) => value.clone(),
                Input::Nested(inner) => {
                    let target = Self::reference_target(def, column, "record")?;
                    Value::Integer(self.plan_insert(plan, target, inner)?)
                }
            };
            if let Some(bytes) = encode_cell(def, column, &value)? {
                cells.insert(column.id, bytes);
            }
            values.push((name.to_string(), value));
        }
        if !undeclared.is_empty() {
            return Err(StoreError::UndeclaredField {
                table: def.name.clone(),
                fields: undeclared,
            });
        }

        for column in def.columns() {
            if record.contains(&column.name) {
                continue;
            }
            if let Some(default) = &column.default {
                if let Some(bytes) = encode_cell(def, column, default)? {
                    cells.insert(column.id, bytes);
                }
                values.push((column.name.clone(), default.clone()));
            }
        }
        if def.role == TableRole::Exchange {
            if let Some(column) = def.column(TIMESTAMP_COLUMN) {
                let now = Value::Timestamp(Timestamp::now());
                if let Some(bytes) = encode_cell(def, column, &now)? {
                    cells.insert(column.id, bytes);
                }
                values.push((TIMESTAMP_COLUMN.to_string(), now));
            }
        }

        let id = plan.allocate(def, self.data.get(&table));
        plan.push_insert(table, StoredRow { id, cells });
        plan.writes.push(PlannedWrite {
            table,
            event: WriteEvent {
                table: def.name.clone(),
                kind: WriteKind::Insert,
                row_id: id,
                values,
            },
        });
        Ok(id)
    }

    fn plan_batch(&self, plan: &mut WritePlan, table: TableId, batch: &Batch) -> StoreResult<Vec<i64>> {
        let def = self.table_by_id(table)?;
        let n = batch_len(&def.name, batch)?;

        // Referenced rows are planned first so their ids exist.
        let mut nested_ids: HashMap<&str, Vec<i64>> = HashMap::new();
        for (name, input) in batch.fields() {
            if let BatchInput::Nested(inner) = input {
                let column = def.column(name).ok_or_else(|| StoreError::UndeclaredField {
                    table: def.name.clone(),
                    fields: vec![name.to_string()],
                })?;
                let target = Self::reference_target(def, column, "batch")?;
                nested_ids.insert(name, self.plan_batch(plan, target, inner)?);
            }
        }

        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let mut record = Record::new();
            for (name, input) in batch.fields() {
                let value = match input {
                    BatchInput::Values(values) => values[i].clone(),
                    BatchInput::Nested(_) => Value::Integer(nested_ids[name][i]),
                };
                record.set(name, Input::Value(value));
            }
            ids.push(self.plan_insert(plan, table, &record)?);
        }
        Ok(ids)
    }

    fn plan_update(&self, plan: &mut WritePlan, table: TableId, record: &Record, row_id: i64) -> StoreResult<i64> {
        let def = self.table_by_id(table)?;
        let data = self.data.get(&table).filter(|d| !d.is_empty()).ok_or_else(|| StoreError::RowNotFound {
            table: def.name.clone(),
            row: row_id,
        })?;
        let id = clamp_row_id(row_id, data.len() as i64);
        let stored = data.row(id).ok_or_else(|| StoreError::RowNotFound {
            table: def.name.clone(),
            row: id,
        })?;

        let undeclared: Vec<String> = record
            .fields()
            .filter(|(name, _)| def.column(name).is_none() && !def.is_protected(name))
            .map(|(name, _)| name.to_string())
            .collect();
        if !undeclared.is_empty() {
            return Err(StoreError::UndeclaredField {
                table: def.name.clone(),
                fields: undeclared,
            });
        }

        let mut cells: Vec<(ColumnId, Option<Vec<u8>>)> = Vec::with_capacity(record.len());
        let mut values = Vec::with_capacity(record.len());
        for (name, input) in record.fields() {
            if def.is_protected(name) {
                return Err(protected(def, name));
            }
            let Some(column) = def.column(name) else {
                continue;
            };
            match input {
                Input::Value(value) => {
                    cells.push((column.id, encode_cell(def, column, value)?));
                    values.push((name.to_string(), value.clone()));
                }
                Input::Nested(inner) => {
                    let target = Self::reference_target(def, column, "record")?;
                    let current = match stored.cells.get(&column.id) {
                        Some(bytes) => codec::decode(column.kind, bytes)?.as_i64(),
                        None => None,
                    };
                    let linked = match current {
                        Some(fk) => {
                            self.require_row(target, fk)?;
                            self.plan_update(plan, target, inner, fk)?
                        }
                        None => {
                            let fk = self.plan_insert(plan, target, inner)?;
                            cells.push((column.id, encode_cell(def, column, &Value::Integer(fk))?));
                            fk
                        }
                    };
                    values.push((name.to_string(), Value::Integer(linked)));
                }
            }
        }
        if values.is_empty() {
            return Ok(id);
        }

        if !cells.is_empty() {
            plan.ops.push(JournalOp::Rows(RowOp::Update {
                table,
                row: id,
                cells,
            }));
        }
        plan.writes.push(PlannedWrite {
            table,
            event: WriteEvent {
                table: def.name.clone(),
                kind: WriteKind::Update,
                row_id: id,
                values,
            },
        });
        Ok(id)
    }

    fn require_row(&self, table: TableId, id: i64) -> StoreResult<&StoredRow> {
        let def = self.table_by_id(table)?;
        self.data
            .get(&table)
            .and_then(|d| d.row(id))
            .ok_or_else(|| StoreError::RowNotFound {
                table: def.name.clone(),
                row: id,
            })
    }

    // ─── Reads ───────────────────────────────────────────────

    /// Read one row. `row_id` follows the clamping law.
    pub fn get_row(&self, table: &str, row_id: i64, projection: &Projection) -> StoreResult<Row> {
        let def = self.catalog.require(table)?;
        let n = self.data.get(&def.id).map_or(0, TableData::len) as i64;
        if n == 0 {
            return Err(StoreError::RowNotFound {
                table: def.name.clone(),
                row: row_id,
            });
        }
        let stored = self.require_row(def.id, clamp_row_id(row_id, n))?;
        let joins = self.resolve_joins(def, projection)?;
        self.materialize(def, stored, projection, &joins)
    }

    /// Last row with every field.
    pub fn last_row(&self, table: &str) -> StoreResult<Row> {
        self.get_row(table, -1, &Projection::all())
    }

    /// Read several rows, row-major.
    pub fn get_rows(&self, table: &str, selection: &Selection, projection: &Projection) -> StoreResult<Vec<Row>> {
        let def = self.catalog.require(table)?;
        let Some(data) = self.data.get(&def.id) else {
            return Ok(Vec::new());
        };
        let joins = self.resolve_joins(def, projection)?;
        selection
            .resolve(data.len() as i64)
            .into_iter()
            .filter_map(|id| data.row(id))
            .map(|stored| self.materialize(def, stored, projection, &joins))
            .collect()
    }

    /// Read several rows, one list per field.
    pub fn get_columns(&self, table: &str, selection: &Selection, projection: &Projection) -> StoreResult<ColumnBatch> {
        Ok(ColumnBatch::from_rows(self.get_rows(table, selection, projection)?))
    }

    /// Exact lookup without clamping; `None` when the row does not exist.
    pub fn row_at(&self, table: &str, id: i64) -> StoreResult<Option<Row>> {
        let def = self.catalog.require(table)?;
        match self.data.get(&def.id).and_then(|d| d.row(id)) {
            Some(stored) => self
                .materialize(def, stored, &Projection::all(), &HashMap::new())
                .map(Some),
            None => Ok(None),
        }
    }

    /// Map each joined table onto the first reference column targeting it.
    fn resolve_joins(&self, def: &TableDef, projection: &Projection) -> StoreResult<HashMap<ColumnId, TableId>> {
        let mut joins = HashMap::new();
        for name in projection.joins() {
            let target = self
                .catalog
                .table_id(name)
                .ok_or_else(|| StoreError::UnknownTable(name.clone()))?;
            match def.references().find(|(_, to)| *to == target) {
                Some((column, _)) => {
                    joins.insert(column.id, target);
                }
                None => log::debug!("{} has no reference to {name}, join ignored", def.name),
            }
        }
        Ok(joins)
    }

    fn materialize(
        &self,
        def: &TableDef,
        stored: &StoredRow,
        projection: &Projection,
        joins: &HashMap<ColumnId, TableId>,
    ) -> StoreResult<Row> {
        let mut row = Row::new(stored.id);
        for column in def.columns() {
            if !projection.includes(&column.name) {
                continue;
            }
            let value = match stored.cells.get(&column.id) {
                Some(bytes) => codec::decode(column.kind, bytes)?,
                None => Value::Null,
            };
            let Some(target) = joins.get(&column.id) else {
                row.push(column.name.clone(), Datum::Value(value));
                continue;
            };
            // Null reference: the key is left out.
            let Some(fk) = value.as_i64() else {
                continue;
            };
            let target_def = self.table_by_id(*target)?;
            if let Some(linked) = self.data.get(target).and_then(|d| d.row(fk)) {
                let joined = self.materialize(target_def, linked, &projection.flattened(), &HashMap::new())?;
                row.push(column.name.clone(), Datum::Row(joined));
            }
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use std::sync::{Arc, Mutex};

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(StoreConfig::for_testing(dir.path(), "test"), false).unwrap();
        (dir, store)
    }

    fn positions(store: &mut Store) {
        store
            .create_table("Stats", TableRole::Storing, &[ColumnSpec::new("mean", ColumnKind::Float)])
            .unwrap();
        store
            .create_table(
                "Positions",
                TableRole::Storing,
                &[
                    ColumnSpec::new("x", ColumnKind::Float).with_default(0.0),
                    ColumnSpec::reference("stats", "Stats"),
                ],
            )
            .unwrap();
    }

    #[test]
    fn test_insert_applies_defaults() {
        let (_dir, mut store) = store();
        positions(&mut store);
        let id = store.insert("Positions", Record::new()).unwrap();
        assert_eq!(id, 1);
        let row = store.get_row("Positions", 1, &Projection::all()).unwrap();
        assert_eq!(row.get("x"), Some(&Value::Float(0.0)));
        assert_eq!(row.get("stats"), Some(&Value::Null));
    }

    #[test]
    fn test_insert_type_mismatch() {
        let (_dir, mut store) = store();
        positions(&mut store);
        let err = store.insert("Positions", Record::new().with("x", "far")).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { expected: ColumnKind::Float, .. }));
        assert_eq!(store.count("Positions").unwrap(), 0);
    }

    #[test]
    fn test_unknown_table() {
        let (_dir, mut store) = store();
        let err = store.insert("Nowhere", Record::new().with("x", 1.0)).unwrap_err();
        assert!(matches!(err, StoreError::UnknownTable(_)));
    }

    #[test]
    fn test_schema_on_write_only_when_empty() {
        let (_dir, mut store) = store();
        store.create_table("T", TableRole::Storing, &[]).unwrap();
        store
            .insert("T", Record::new().with("a", 1).with("label", "first"))
            .unwrap();
        assert_eq!(store.fields("T").unwrap(), vec!["id", "a", "label"]);
        assert_eq!(store.columns("T").unwrap()[0].kind, ColumnKind::Integer);

        let err = store.insert("T", Record::new().with("b", 2.0)).unwrap_err();
        match err {
            StoreError::UndeclaredField { fields, .. } => assert_eq!(fields, vec!["b".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_null_cannot_infer_column() {
        let (_dir, mut store) = store();
        store.create_table("T", TableRole::Storing, &[]).unwrap();
        let err = store.insert("T", Record::new().with("a", Value::Null)).unwrap_err();
        assert!(matches!(err, StoreError::UndeclaredField { .. }));
    }

    #[test]
    fn test_nested_insert_links_reference() {
        let (_dir, mut store) = store();
        positions(&mut store);
        let id = store
            .insert(
                "Positions",
                Record::new()
                    .with("x", 1.0)
                    .with_nested("stats", Record::new().with("mean", 0.5)),
            )
            .unwrap();
        let row = store
            .get_row("Positions", id, &Projection::all().join("Stats"))
            .unwrap();
        let stats = row.joined("stats").unwrap();
        assert_eq!(stats.id, 1);
        assert_eq!(stats.get("mean"), Some(&Value::Float(0.5)));
    }

    #[test]
    fn test_join_with_null_reference_omits_key() {
        let (_dir, mut store) = store();
        positions(&mut store);
        store.insert("Positions", Record::new().with("x", 2.0)).unwrap();
        let row = store
            .get_row("Positions", -1, &Projection::all().join("stats"))
            .unwrap();
        assert!(row.datum("stats").is_none());
        assert_eq!(row.get("x"), Some(&Value::Float(2.0)));
    }

    #[test]
    fn test_update_clamps_and_rejects_new_fields() {
        let (_dir, mut store) = store();
        positions(&mut store);
        for x in [1.0, 2.0, 3.0] {
            store.insert("Positions", Record::new().with("x", x)).unwrap();
        }
        assert_eq!(store.update("Positions", Record::new().with("x", 9.0), -1).unwrap(), 3);
        assert_eq!(store.update("Positions", Record::new().with("x", 8.0), 40).unwrap(), 3);
        assert_eq!(store.update("Positions", Record::new().with("x", 7.0), -3).unwrap(), 1);
        let xs = store
            .get_columns("Positions", &Selection::All, &Projection::fields(["x"]))
            .unwrap();
        assert_eq!(
            xs.get("x").unwrap(),
            &[Value::Float(7.0), Value::Float(2.0), Value::Float(8.0)]
        );

        let err = store
            .update("Positions", Record::new().with("y", 1.0), -1)
            .unwrap_err();
        assert!(matches!(err, StoreError::UndeclaredField { .. }));
    }

    #[test]
    fn test_update_empty_table() {
        let (_dir, mut store) = store();
        positions(&mut store);
        let err = store.update("Positions", Record::new().with("x", 1.0), -1).unwrap_err();
        assert!(matches!(err, StoreError::RowNotFound { .. }));
        assert!(store.get_row("Positions", 1, &Projection::all()).is_err());
    }

    #[test]
    fn test_update_nested_updates_referenced_row() {
        let (_dir, mut store) = store();
        positions(&mut store);
        store
            .insert(
                "Positions",
                Record::new().with_nested("stats", Record::new().with("mean", 1.0)),
            )
            .unwrap();
        store
            .update(
                "Positions",
                Record::new().with_nested("stats", Record::new().with("mean", 4.0)),
                -1,
            )
            .unwrap();
        assert_eq!(store.count("Stats").unwrap(), 1);
        let stats = store.get_row("Stats", 1, &Projection::all()).unwrap();
        assert_eq!(stats.get("mean"), Some(&Value::Float(4.0)));
    }

    #[test]
    fn test_update_nested_links_null_reference() {
        let (_dir, mut store) = store();
        positions(&mut store);
        store.insert("Positions", Record::new()).unwrap();
        store
            .update(
                "Positions",
                Record::new().with_nested("stats", Record::new().with("mean", 2.5)),
                1,
            )
            .unwrap();
        let row = store.get_row("Positions", 1, &Projection::all()).unwrap();
        assert_eq!(row.get("stats"), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_update_null_clears_cell() {
        let (_dir, mut store) = store();
        positions(&mut store);
        store.insert("Positions", Record::new().with("x", 3.0)).unwrap();
        store.update("Positions", Record::new().with("x", Value::Null), 1).unwrap();
        let row = store.get_row("Positions", 1, &Projection::all()).unwrap();
        assert!(row.get("x").unwrap().is_null());
    }

    #[test]
    fn test_batch_insert_chunks_in_one_frame() {
        let (_dir, mut store) = store();
        positions(&mut store);
        let frames_before = store.last_sequence();
        let ids = store
            .insert_batch("Positions", Batch::new().with("x", (0..250).map(|i| i as f64)))
            .unwrap();
        assert_eq!(ids.len(), 250);
        assert_eq!(ids[249], 250);
        assert_eq!(store.last_sequence(), frames_before.map(|s| s + 1));
        assert_eq!(store.count("Positions").unwrap(), 250);
    }

    #[test]
    fn test_batch_length_mismatch_writes_nothing() {
        let (_dir, mut store) = store();
        positions(&mut store);
        let err = store
            .insert_batch(
                "Positions",
                Batch::new()
                    .with("x", [1.0, 2.0, 3.0])
                    .with_nested("stats", Batch::new().with("mean", [0.1, 0.2])),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::BatchLengthMismatch { .. }));
        assert_eq!(store.count("Positions").unwrap(), 0);
        assert_eq!(store.count("Stats").unwrap(), 0);
    }

    #[test]
    fn test_batch_with_nested_references() {
        let (_dir, mut store) = store();
        positions(&mut store);
        store.insert("Stats", Record::new().with("mean", 0.0)).unwrap();
        let ids = store
            .insert_batch(
                "Positions",
                Batch::new()
                    .with("x", [1.0, 2.0])
                    .with_nested("stats", Batch::new().with("mean", [0.1, 0.2])),
            )
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
        let rows = store
            .get_rows("Positions", &Selection::All, &Projection::all().join("Stats"))
            .unwrap();
        assert_eq!(rows[0].joined("stats").unwrap().id, 2);
        assert_eq!(rows[1].joined("stats").unwrap().get("mean"), Some(&Value::Float(0.2)));
    }

    #[test]
    fn test_batch_type_error_is_atomic() {
        let (_dir, mut store) = store();
        positions(&mut store);
        let mut xs: Vec<Value> = (0..150).map(|i| Value::Float(i as f64)).collect();
        xs[120] = Value::from("oops");
        let err = store
            .insert_batch("Positions", Batch::new().with("x", xs))
            .unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
        assert_eq!(store.count("Positions").unwrap(), 0);
    }

    #[test]
    fn test_exchange_insert_replaces() {
        let (_dir, mut store) = store();
        store
            .create_table("Mailbox", TableRole::Exchange, &[ColumnSpec::new("value", ColumnKind::Integer)])
            .unwrap();
        assert_eq!(store.insert("Mailbox", Record::new().with("value", 1)).unwrap(), 1);
        assert_eq!(store.insert("Mailbox", Record::new().with("value", 2)).unwrap(), 1);
        assert_eq!(store.count("Mailbox").unwrap(), 1);
        let row = store.last_row("Mailbox").unwrap();
        assert_eq!(row.get("value"), Some(&Value::Integer(2)));
        assert!(matches!(row.get(TIMESTAMP_COLUMN), Some(Value::Timestamp(_))));

        let err = store
            .insert("Mailbox", Record::new().with(TIMESTAMP_COLUMN, Timestamp::now()))
            .unwrap_err();
        assert!(matches!(err, StoreError::ProtectedColumn { .. }));
    }

    #[test]
    fn test_get_rows_range_and_ids() {
        let (_dir, mut store) = store();
        positions(&mut store);
        store
            .insert_batch("Positions", Batch::new().with("x", [1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let ids = |rows: Vec<Row>| rows.iter().map(|r| r.id).collect::<Vec<_>>();
        let all = Projection::all();
        assert_eq!(ids(store.get_rows("Positions", &Selection::Range(2, -1), &all).unwrap()), vec![2, 3, 4]);
        assert_eq!(ids(store.get_rows("Positions", &Selection::Range(3, 1), &all).unwrap()), vec![3]);
        assert_eq!(ids(store.get_rows("Positions", &Selection::Ids(vec![4, 9, 1]), &all).unwrap()), vec![4, 1]);
    }

    #[test]
    fn test_placeholders_hold_only_id() {
        let (_dir, mut store) = store();
        positions(&mut store);
        assert_eq!(store.pad_to("Positions", 3).unwrap(), 3);
        assert_eq!(store.pad_to("Positions", 2).unwrap(), 0);
        assert_eq!(store.insert_placeholder("Positions").unwrap(), 4);
        let row = store.row_at("Positions", 2).unwrap().unwrap().without_nulls();
        assert!(row.is_empty());
        assert!(store.row_at("Positions", 5).unwrap().is_none());
    }

    #[test]
    fn test_removed_column_hidden_not_reclaimed() {
        let (_dir, mut store) = store();
        positions(&mut store);
        store.insert("Positions", Record::new().with("x", 5.0)).unwrap();
        let size = store.memory_size();
        store.remove_column("Positions", "x").unwrap();
        let row = store.last_row("Positions").unwrap();
        assert!(row.get("x").is_none());
        assert_eq!(store.memory_size(), size);
    }

    #[test]
    fn test_handlers_fire_in_order_after_activate() {
        let (_dir, mut store) = store();
        positions(&mut store);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        store.on_before_write("Positions", move |_, event| {
            log.lock().unwrap().push(format!("before {}", event.row_id));
            Ok(())
        });
        let log = Arc::clone(&seen);
        store.on_after_write("positions", move |_, event| {
            log.lock().unwrap().push(format!("after {}", event.row_id));
            Ok(())
        });
        store.on_after_write("Missing", |_, _| Ok(()));

        store.insert("Positions", Record::new()).unwrap();
        assert!(seen.lock().unwrap().is_empty(), "nothing fires before activation");

        assert_eq!(store.activate(), 2);
        store.insert("Positions", Record::new()).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["before 2", "after 2"]);
    }

    #[test]
    fn test_handler_writes_other_table() {
        let (_dir, mut store) = store();
        positions(&mut store);
        store.on_after_write("Positions", |store, event| {
            let x = event.get("x").and_then(Value::as_f64).unwrap_or_default();
            store.insert("Stats", Record::new().with("mean", x * 2.0))?;
            Ok(())
        });
        store.activate();
        store.insert("Positions", Record::new().with("x", 1.5)).unwrap();
        let stats = store.last_row("Stats").unwrap();
        assert_eq!(stats.get("mean"), Some(&Value::Float(3.0)));
    }

    #[test]
    fn test_reentrant_write_rejected() {
        let (_dir, mut store) = store();
        positions(&mut store);
        store.on_write(Phase::BeforeWrite, "Positions", Some("loop"), |store, _| {
            store.insert("Positions", Record::new())?;
            Ok(())
        });
        store.activate();
        let err = store.insert("Positions", Record::new()).unwrap_err();
        assert!(matches!(err, StoreError::ReentrantWrite(_)));
        assert_eq!(store.count("Positions").unwrap(), 0);

        // The guard is released after the failed write.
        assert_eq!(store.disconnect("loop"), 1);
        store.insert("Positions", Record::new()).unwrap();
    }

    #[test]
    fn test_disconnect_by_tag() {
        let (_dir, mut store) = store();
        positions(&mut store);
        store.on_write(Phase::AfterWrite, "Stats", Some("mirror"), |_, _| Ok(()));
        store.on_write(Phase::AfterWrite, "Stats", None, |_, _| Ok(()));
        store.activate();
        assert_eq!(store.disconnect("mirror"), 1);
        assert_eq!(store.notifier().bound_count(), 1);
    }
}
