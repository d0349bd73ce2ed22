//! Runtime catalog: tables, columns and foreign keys.
//!
//! The catalog is plain data. Every change is first *planned* against the
//! current catalog (validation only, no mutation) into a list of
//! [`CatalogOp`]s, then the ops are journaled and applied in one step.
//! Replaying the journal applies the same ops, so a loaded store has exactly
//! the catalog the original sequence of calls produced.
//!
//! ```text
//! create_table / add_columns / rename / remove
//!          │ plan_*()  (validate, allocate ids)
//!          ▼
//!   Vec<CatalogOp> ──► journal frame ──► Catalog::apply()
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::codec::{ColumnKind, Value};
use crate::error::{StoreError, StoreResult};

pub type TableId = u32;
pub type ColumnId = u32;

/// Implicit auto-increment primary key.
pub const ID_COLUMN: &str = "id";
/// Hidden write-time column of exchange tables.
pub const TIMESTAMP_COLUMN: &str = "_dt_";

/// Table role, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableRole {
    /// Append-only history, dense ids from 1
    Storing,
    /// Single-row mailbox, each insert replaces the previous row
    Exchange,
}

impl fmt::Display for TableRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableRole::Storing => f.write_str("storing"),
            TableRole::Exchange => f.write_str("exchange"),
        }
    }
}

/// Display form of a table name: first character kept, the rest lower-cased.
pub fn display_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_string() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// Case-insensitive lookup key of a table name.
pub fn lookup_key(name: &str) -> String {
    name.to_lowercase()
}

/// Declared type of a column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Kind(ColumnKind),
    /// Foreign key to the named table
    Reference(String),
}

/// Column declaration passed to `create_table` / `add_columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub field_type: FieldType,
    pub default: Option<Value>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Kind(kind),
            default: None,
        }
    }

    pub fn reference(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Reference(table.into()),
            default: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Stored column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Stable id, never reused within a table
    pub id: ColumnId,
    pub name: String,
    pub kind: ColumnKind,
    /// Target table for `Reference` columns
    pub references: Option<TableId>,
    /// Value used when an insert omits the column
    pub default: Option<Value>,
}

/// Stored table definition.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub id: TableId,
    /// Display name
    pub name: String,
    pub role: TableRole,
    columns: Vec<ColumnDef>,
    next_column: ColumnId,
}

impl TableDef {
    fn new(id: TableId, name: String, role: TableRole) -> Self {
        let mut def = Self {
            id,
            name,
            role,
            columns: Vec::new(),
            next_column: 1,
        };
        if role == TableRole::Exchange {
            def.columns.push(ColumnDef {
                id: 0,
                name: TIMESTAMP_COLUMN.to_string(),
                kind: ColumnKind::Timestamp,
                references: None,
                default: None,
            });
        }
        def
    }

    /// Visible columns in declaration order (excluding `id`).
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_by_id(&self, id: ColumnId) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Reference columns as `(column, target table id)`.
    pub fn references(&self) -> impl Iterator<Item = (&ColumnDef, TableId)> {
        self.columns
            .iter()
            .filter_map(|c| c.references.map(|target| (c, target)))
    }

    /// `id` always, `_dt_` on exchange tables.
    pub fn is_protected(&self, name: &str) -> bool {
        name == ID_COLUMN || (self.role == TableRole::Exchange && name == TIMESTAMP_COLUMN)
    }
}

/// One journaled catalog mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CatalogOp {
    CreateTable {
        id: TableId,
        name: String,
        role: TableRole,
    },
    AddColumn {
        table: TableId,
        column: ColumnDef,
    },
    RenameTable {
        table: TableId,
        name: String,
    },
    RenameColumn {
        table: TableId,
        column: ColumnId,
        name: String,
    },
    RemoveColumn {
        table: TableId,
        column: ColumnId,
    },
    DropTable {
        table: TableId,
    },
}

/// All table definitions of a store.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: BTreeMap<TableId, TableDef>,
    keys: HashMap<String, TableId>,
    next_table: TableId,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            next_table: 1,
            ..Self::default()
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.table_id(name).and_then(|id| self.tables.get(&id))
    }

    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.keys.get(&lookup_key(name)).copied()
    }

    pub fn get(&self, id: TableId) -> Option<&TableDef> {
        self.tables.get(&id)
    }

    /// Tables in creation order.
    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// First `(table, column)` with a reference to `target`, other than `target` itself.
    pub fn referencing(&self, target: TableId) -> Option<(&TableDef, &ColumnDef)> {
        self.tables
            .values()
            .filter(|t| t.id != target)
            .find_map(|t| {
                t.references()
                    .find(|(_, to)| *to == target)
                    .map(|(c, _)| (t, c))
            })
    }

    // ─── Planning ────────────────────────────────────────────

    /// Plan `create_table`. Idempotent for an existing table of the same
    /// role (only the missing columns are added).
    pub fn plan_create_table(
        &self,
        name: &str,
        role: TableRole,
        columns: &[ColumnSpec],
    ) -> StoreResult<Vec<CatalogOp>> {
        if let Some(existing) = self.table(name) {
            if existing.role != role {
                return Err(StoreError::DuplicateTable {
                    table: existing.name.clone(),
                    existing: existing.role,
                });
            }
            return self.plan_columns(existing, columns);
        }
        let display = display_name(name);
        if display.is_empty() {
            return Err(StoreError::NameCollision {
                table: display,
                name: name.to_string(),
            });
        }
        let draft = TableDef::new(self.next_table, display.clone(), role);
        let mut ops = vec![CatalogOp::CreateTable {
            id: draft.id,
            name: display,
            role,
        }];
        ops.extend(self.plan_columns(&draft, columns)?);
        Ok(ops)
    }

    /// Plan `add_columns` on an existing table.
    pub fn plan_add_columns(&self, table: &str, columns: &[ColumnSpec]) -> StoreResult<Vec<CatalogOp>> {
        let def = self.require(table)?;
        self.plan_columns(def, columns)
    }

    fn plan_columns(&self, table: &TableDef, columns: &[ColumnSpec]) -> StoreResult<Vec<CatalogOp>> {
        let mut ops = Vec::new();
        let mut seen = HashSet::new();
        let mut next = table.next_column;
        for spec in columns {
            if spec.name.is_empty() || table.is_protected(&spec.name) {
                return Err(StoreError::NameCollision {
                    table: table.name.clone(),
                    name: spec.name.clone(),
                });
            }
            // Re-declaring a column is a no-op.
            if table.column(&spec.name).is_some() || !seen.insert(spec.name.as_str()) {
                continue;
            }
            let (kind, references) = match &spec.field_type {
                FieldType::Kind(kind) => (*kind, None),
                FieldType::Reference(target) => {
                    let target_id = self.table_id(target).ok_or_else(|| StoreError::UnknownReference {
                        table: table.name.clone(),
                        column: spec.name.clone(),
                        target: target.clone(),
                    })?;
                    (ColumnKind::Reference, Some(target_id))
                }
            };
            if let Some(default) = &spec.default {
                if default.is_null() || !kind.accepts(default) {
                    return Err(StoreError::TypeMismatch {
                        table: table.name.clone(),
                        column: spec.name.clone(),
                        expected: kind,
                        found: default.type_name(),
                    });
                }
            }
            ops.push(CatalogOp::AddColumn {
                table: table.id,
                column: ColumnDef {
                    id: next,
                    name: spec.name.clone(),
                    kind,
                    references,
                    default: spec.default.clone(),
                },
            });
            next += 1;
        }
        Ok(ops)
    }

    pub fn plan_rename_table(&self, old: &str, new: &str) -> StoreResult<CatalogOp> {
        let def = self.require(old)?;
        let display = display_name(new);
        if let Some(other) = self.table(new) {
            if other.id != def.id {
                return Err(StoreError::DuplicateTable {
                    table: other.name.clone(),
                    existing: other.role,
                });
            }
        }
        if display.is_empty() {
            return Err(StoreError::NameCollision {
                table: def.name.clone(),
                name: new.to_string(),
            });
        }
        Ok(CatalogOp::RenameTable {
            table: def.id,
            name: display,
        })
    }

    pub fn plan_rename_column(&self, table: &str, old: &str, new: &str) -> StoreResult<CatalogOp> {
        let def = self.require(table)?;
        let column = self.require_mutable_column(def, old)?;
        if new.is_empty() || def.is_protected(new) || def.column(new).is_some() {
            return Err(StoreError::NameCollision {
                table: def.name.clone(),
                name: new.to_string(),
            });
        }
        Ok(CatalogOp::RenameColumn {
            table: def.id,
            column: column.id,
            name: new.to_string(),
        })
    }

    pub fn plan_remove_column(&self, table: &str, name: &str) -> StoreResult<CatalogOp> {
        let def = self.require(table)?;
        let column = self.require_mutable_column(def, name)?;
        Ok(CatalogOp::RemoveColumn {
            table: def.id,
            column: column.id,
        })
    }

    pub fn plan_drop_table(&self, name: &str) -> StoreResult<CatalogOp> {
        let def = self.require(name)?;
        if let Some((other, _)) = self.referencing(def.id) {
            return Err(StoreError::TableInUse {
                table: def.name.clone(),
                referenced_by: other.name.clone(),
            });
        }
        Ok(CatalogOp::DropTable { table: def.id })
    }

    pub(crate) fn require(&self, name: &str) -> StoreResult<&TableDef> {
        self.table(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    fn require_mutable_column<'a>(&self, def: &'a TableDef, name: &str) -> StoreResult<&'a ColumnDef> {
        if def.is_protected(name) {
            return Err(StoreError::ProtectedColumn {
                table: def.name.clone(),
                column: name.to_string(),
            });
        }
        def.column(name).ok_or_else(|| StoreError::UnknownField {
            table: def.name.clone(),
            field: name.to_string(),
        })
    }

    // ─── Apply ───────────────────────────────────────────────

    /// Apply one op. Errors only on ops that do not fit the catalog,
    /// which means the journal is inconsistent.
    pub fn apply(&mut self, op: &CatalogOp) -> Result<(), String> {
        match op {
            CatalogOp::CreateTable { id, name, role } => {
                let key = lookup_key(name);
                if self.tables.contains_key(id) || self.keys.contains_key(&key) {
                    return Err(format!("table {name} created twice"));
                }
                self.tables.insert(*id, TableDef::new(*id, name.clone(), *role));
                self.keys.insert(key, *id);
                self.next_table = self.next_table.max(id + 1);
            }
            CatalogOp::AddColumn { table, column } => {
                let def = self.get_mut(*table)?;
                def.next_column = def.next_column.max(column.id + 1);
                def.columns.push(column.clone());
            }
            CatalogOp::RenameTable { table, name } => {
                let def = self.get_mut(*table)?;
                let old_key = lookup_key(&def.name);
                def.name = name.clone();
                self.keys.remove(&old_key);
                self.keys.insert(lookup_key(name), *table);
            }
            CatalogOp::RenameColumn { table, column, name } => {
                let def = self.get_mut(*table)?;
                let col = def
                    .columns
                    .iter_mut()
                    .find(|c| c.id == *column)
                    .ok_or_else(|| format!("unknown column {column}"))?;
                col.name = name.clone();
            }
            CatalogOp::RemoveColumn { table, column } => {
                let def = self.get_mut(*table)?;
                def.columns.retain(|c| c.id != *column);
            }
            CatalogOp::DropTable { table } => {
                let def = self
                    .tables
                    .remove(table)
                    .ok_or_else(|| format!("unknown table {table}"))?;
                self.keys.remove(&lookup_key(&def.name));
            }
        }
        Ok(())
    }

    fn get_mut(&mut self, id: TableId) -> Result<&mut TableDef, String> {
        self.tables
            .get_mut(&id)
            .ok_or_else(|| format!("unknown table {id}"))
    }
}

impl fmt::Display for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} table(s)", self.tables.len())?;
        for table in self.tables.values() {
            writeln!(f, "  * {} ({})", table.name, table.role)?;
            writeln!(f, "      - {ID_COLUMN}: integer (auto)")?;
            for column in &table.columns {
                write!(f, "      - {}: ", column.name)?;
                match column.references.and_then(|id| self.tables.get(&id)) {
                    Some(target) => write!(f, "reference -> {}", target.name)?,
                    None => write!(f, "{}", column.kind)?,
                }
                if let Some(default) = &column.default {
                    write!(f, " = {default:?}")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
