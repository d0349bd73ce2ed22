//! Store lifecycle, catalog changes and journal replay.
//!
//! Architecture:
//! ```text
//! ┌──────────────── Store (one handle per role) ─────────────────┐
//! │  Catalog ── tables / columns / references                    │
//! │  TableData ── row arena per table (encoded cells)            │
//! │  ChangeNotifier ── before/after write handlers               │
//! │                                                              │
//! │  writer:   plan ─► Journal::append ─► apply in memory        │
//! │  follower: refresh() ─► read new frames ─► apply in memory   │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                ▼
//!                      <dir>/<name>.db (journal)
//! ```
//!
//! A writer handle buffers frames and flushes them on thresholds, on
//! [`Store::flush`] and on close. A read-only follower tails the same file
//! and only ever sees complete frames, so a frame written by one `insert`
//! or `insert_batch` is observed entirely or not at all.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::journal::{self, Journal, JournalConfig, JournalOp, JournalRecord, RowOp, HEADER_LEN};
use crate::notifier::ChangeNotifier;
use crate::schema::{Catalog, CatalogOp, ColumnDef, ColumnSpec, TableDef, TableId, TableRole, ID_COLUMN};
use crate::table::TableData;

/// File extension of store files.
pub const EXTENSION: &str = "db";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the store file
    pub dir: PathBuf,
    /// Store name, without extension
    pub name: String,
    pub journal: JournalConfig,
}

impl StoreConfig {
    /// A trailing extension on `name` is dropped.
    pub fn new(dir: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            dir: dir.into(),
            name: strip_extension(name),
            journal: JournalConfig::default(),
        }
    }

    /// Config for testing (small journal buffers).
    pub fn for_testing(dir: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            journal: JournalConfig::for_testing(),
            ..Self::new(dir, name)
        }
    }

    /// Split a file path into directory and name.
    pub fn from_path(path: &Path) -> Self {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::new(dir, &name)
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", self.name))
    }
}

fn strip_extension(name: &str) -> String {
    match Path::new(name).file_stem() {
        Some(stem) if Path::new(name).extension().is_some() => stem.to_string_lossy().into_owned(),
        _ => name.to_string(),
    }
}

/// Follower read position.
struct Tail {
    file: File,
    offset: u64,
}

/// An adaptive record store backed by one journal file.
pub struct Store {
    config: StoreConfig,
    path: PathBuf,
    store_id: Uuid,
    pub(crate) catalog: Catalog,
    pub(crate) data: HashMap<TableId, TableData>,
    /// `None` for read-only followers
    journal: Option<Journal>,
    tail: Option<Tail>,
    last_sequence: Option<u64>,
    pub(crate) notifier: ChangeNotifier,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("store_id", &self.store_id)
            .field("last_sequence", &self.last_sequence)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create a store at `dir/name.db`.
    ///
    /// An existing file is removed when `remove_existing` is set, otherwise
    /// the name gets the first free counter suffix: `name(1)`, `name(2)`, ...
    pub fn new(dir: impl Into<PathBuf>, name: &str, remove_existing: bool) -> StoreResult<Self> {
        Self::create(StoreConfig::new(dir, name), remove_existing)
    }

    pub fn create(mut config: StoreConfig, remove_existing: bool) -> StoreResult<Self> {
        fs::create_dir_all(&config.dir)?;
        let mut path = config.file_path();
        if path.exists() {
            if remove_existing {
                log::info!("Removing existing store {}", path.display());
                fs::remove_file(&path)?;
            } else {
                let base = config.name.clone();
                let mut counter = 1;
                while path.exists() {
                    config.name = format!("{base}({counter})");
                    path = config.file_path();
                    counter += 1;
                }
                log::info!("Store {base} exists, creating {} instead", config.name);
            }
        }
        let store_id = Uuid::new_v4();
        let journal = Journal::create(&path, store_id, config.journal.clone())?;
        log::info!("Created store {} ({store_id})", path.display());
        Ok(Self::empty(config, path, store_id, Some(journal), None))
    }

    /// Open an existing store for writing. The catalog and rows are rebuilt
    /// from the journal; a torn trailing frame is dropped.
    pub fn load(config: StoreConfig) -> StoreResult<Self> {
        let (mut store, outcome_end, torn) = Self::replay(config, false)?;
        if torn {
            log::warn!(
                "Store {}: dropping torn trailing frame after offset {outcome_end}",
                store.path.display()
            );
        }
        let next = store.last_sequence.map_or(0, |s| s + 1);
        store.journal = Some(Journal::open_append(
            &store.path,
            store.config.journal.clone(),
            outcome_end,
            next,
        )?);
        Ok(store)
    }

    /// Open an existing store as a read-only follower of its writer.
    pub fn open_read_only(config: StoreConfig) -> StoreResult<Self> {
        let (store, _, _) = Self::replay(config, true)?;
        Ok(store)
    }

    fn empty(config: StoreConfig, path: PathBuf, store_id: Uuid, journal: Option<Journal>, tail: Option<Tail>) -> Self {
        Self {
            config,
            path,
            store_id,
            catalog: Catalog::new(),
            data: HashMap::new(),
            journal,
            tail,
            last_sequence: None,
            notifier: ChangeNotifier::default(),
        }
    }

    fn replay(config: StoreConfig, follow: bool) -> StoreResult<(Self, u64, bool)> {
        let path = config.file_path();
        if !path.exists() {
            return Err(StoreError::NotFound(path));
        }
        let mut file = File::open(&path)?;
        let corrupt = |reason: String| StoreError::Corrupt {
            path: path.clone(),
            reason,
        };
        let store_id = journal::read_header(&mut file).map_err(corrupt)?;
        let outcome = journal::read_from(&mut file, HEADER_LEN, None).map_err(corrupt)?;

        let tail = follow.then_some(Tail {
            file,
            offset: outcome.end,
        });
        let mut store = Self::empty(config, path.clone(), store_id, None, tail);
        let frames = outcome.records.len();
        for record in &outcome.records {
            store.apply_record(record).map_err(corrupt)?;
        }
        log::info!(
            "Loaded store {} ({frames} frames, {} tables{})",
            path.display(),
            store.catalog.len(),
            if follow { ", read-only" } else { "" }
        );
        Ok((store, outcome.end, outcome.torn))
    }

    /// Apply frames the writer appended since the last read.
    /// Returns the number of frames applied (always 0 on a writer).
    pub fn refresh(&mut self) -> StoreResult<usize> {
        let Some(tail) = self.tail.as_mut() else {
            return Ok(0);
        };
        let outcome = journal::read_from(&mut tail.file, tail.offset, self.last_sequence).map_err(|reason| {
            StoreError::Corrupt {
                path: self.path.clone(),
                reason,
            }
        })?;
        tail.offset = outcome.end;
        let n = outcome.records.len();
        for record in &outcome.records {
            self.apply_record(record).map_err(|reason| StoreError::Corrupt {
                path: self.path.clone(),
                reason,
            })?;
        }
        if n > 0 {
            log::debug!("Store {}: applied {n} new frame(s)", self.config.name);
        }
        Ok(n)
    }

    /// Write buffered frames to the file so followers can see them.
    pub fn flush(&mut self) -> StoreResult<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.flush()?;
        }
        Ok(())
    }

    /// Flush and release the file, deleting it when `erase_file` is set.
    pub fn close(mut self, erase_file: bool) -> StoreResult<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.close()?;
        }
        self.tail = None;
        if erase_file {
            fs::remove_file(&self.path)?;
            log::info!("Closed and erased store {}", self.path.display());
        } else {
            log::info!("Closed store {}", self.path.display());
        }
        Ok(())
    }

    // ─── Journal plumbing ────────────────────────────────────

    /// Journal `ops` as one frame, then apply them in memory.
    pub(crate) fn commit(&mut self, ops: Vec<JournalOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let journal = self.journal.as_mut().ok_or(StoreError::ReadOnly)?;
        let (sequence, flush_due) = journal.append(ops.clone())?;
        if flush_due {
            journal.flush()?;
        }
        self.last_sequence = Some(sequence);
        for op in &ops {
            self.apply_op(op).map_err(|reason| StoreError::Corrupt {
                path: self.path.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    pub(crate) fn commit_catalog(&mut self, ops: Vec<CatalogOp>) -> StoreResult<()> {
        self.commit(ops.into_iter().map(JournalOp::Catalog).collect())
    }

    fn apply_record(&mut self, record: &JournalRecord) -> Result<(), String> {
        for op in &record.ops {
            self.apply_op(op)?;
        }
        self.last_sequence = Some(record.sequence);
        Ok(())
    }

    fn apply_op(&mut self, op: &JournalOp) -> Result<(), String> {
        match op {
            JournalOp::Catalog(op) => {
                self.catalog.apply(op)?;
                match op {
                    CatalogOp::CreateTable { id, .. } => {
                        self.data.insert(*id, TableData::default());
                    }
                    CatalogOp::DropTable { table } => {
                        self.data.remove(table);
                    }
                    _ => {}
                }
            }
            JournalOp::Rows(RowOp::Insert { table, rows }) => {
                let role = self
                    .catalog
                    .get(*table)
                    .map(|t| t.role)
                    .ok_or_else(|| format!("insert into unknown table {table}"))?;
                let data = self.data.entry(*table).or_default();
                for row in rows {
                    data.insert(role, row.clone())?;
                }
            }
            JournalOp::Rows(RowOp::Update { table, row, cells }) => {
                self.data
                    .get_mut(table)
                    .ok_or_else(|| format!("update of unknown table {table}"))?
                    .update(*row, cells)?;
            }
        }
        Ok(())
    }

    // ─── Schema ──────────────────────────────────────────────

    /// Create a table, or add missing columns to an existing table of the
    /// same role.
    pub fn create_table(&mut self, name: &str, role: TableRole, columns: &[ColumnSpec]) -> StoreResult<()> {
        if let Some(id) = self.catalog.table_id(name) {
            self.ensure_idle(id)?;
        }
        let ops = self.catalog.plan_create_table(name, role, columns)?;
        if matches!(ops.first(), Some(CatalogOp::CreateTable { .. })) {
            log::debug!("Creating {role} table {name}");
        }
        self.commit_catalog(ops)
    }

    /// Add columns to an existing table, rows present or not. Existing rows
    /// read the new columns as null.
    pub fn add_columns(&mut self, table: &str, columns: &[ColumnSpec]) -> StoreResult<()> {
        let def = self.catalog.require(table)?;
        self.ensure_idle(def.id)?;
        let ops = self.catalog.plan_add_columns(table, columns)?;
        self.commit_catalog(ops)
    }

    pub fn rename_table(&mut self, old: &str, new: &str) -> StoreResult<()> {
        let op = self.catalog.plan_rename_table(old, new)?;
        if let CatalogOp::RenameTable { table, .. } = &op {
            self.ensure_idle(*table)?;
        }
        self.commit_catalog(vec![op])
    }

    pub fn rename_column(&mut self, table: &str, old: &str, new: &str) -> StoreResult<()> {
        let op = self.catalog.plan_rename_column(table, old, new)?;
        if let CatalogOp::RenameColumn { table, .. } = &op {
            self.ensure_idle(*table)?;
        }
        self.commit_catalog(vec![op])
    }

    /// Hide a column. Its stored cells are not reclaimed.
    pub fn remove_column(&mut self, table: &str, name: &str) -> StoreResult<()> {
        let op = self.catalog.plan_remove_column(table, name)?;
        if let CatalogOp::RemoveColumn { table, .. } = &op {
            self.ensure_idle(*table)?;
        }
        self.commit_catalog(vec![op])
    }

    /// Drop a table that no other table references.
    pub fn remove_table(&mut self, name: &str) -> StoreResult<()> {
        let op = self.catalog.plan_drop_table(name)?;
        if let CatalogOp::DropTable { table } = &op {
            self.ensure_idle(*table)?;
            self.notifier.forget(*table);
        }
        self.commit_catalog(vec![op])
    }

    // ─── Introspection ───────────────────────────────────────

    /// Table display names in creation order.
    pub fn tables(&self) -> Vec<String> {
        self.catalog.tables().map(|t| t.name.clone()).collect()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.catalog.table(name).is_some()
    }

    pub fn table_def(&self, name: &str) -> StoreResult<&TableDef> {
        self.catalog.require(name)
    }

    pub fn role(&self, table: &str) -> StoreResult<TableRole> {
        Ok(self.catalog.require(table)?.role)
    }

    /// `id` followed by the visible columns.
    pub fn fields(&self, table: &str) -> StoreResult<Vec<String>> {
        let def = self.catalog.require(table)?;
        Ok(std::iter::once(ID_COLUMN.to_string())
            .chain(def.columns().iter().map(|c| c.name.clone()))
            .collect())
    }

    pub fn columns(&self, table: &str) -> StoreResult<&[ColumnDef]> {
        Ok(self.catalog.require(table)?.columns())
    }

    /// `(column, referenced table)` pairs of a table.
    pub fn foreign_keys(&self, table: &str) -> StoreResult<Vec<(String, String)>> {
        let def = self.catalog.require(table)?;
        Ok(def
            .references()
            .filter_map(|(column, target)| {
                self.catalog
                    .get(target)
                    .map(|t| (column.name.clone(), t.name.clone()))
            })
            .collect())
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Human-readable listing of tables and columns.
    pub fn architecture(&self) -> String {
        format!("Store '{}': {}", self.config.name, self.catalog)
    }

    pub fn count(&self, table: &str) -> StoreResult<usize> {
        let def = self.catalog.require(table)?;
        Ok(self.data.get(&def.id).map_or(0, TableData::len))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn store_id(&self) -> Uuid {
        self.store_id
    }

    /// Sequence of the last frame committed or applied.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn is_read_only(&self) -> bool {
        self.journal.is_none()
    }

    /// Size of the store file once buffered frames are flushed.
    pub fn file_size(&self) -> StoreResult<u64> {
        match &self.journal {
            Some(journal) => Ok(journal.logical_len()),
            None => Ok(fs::metadata(&self.path)?.len()),
        }
    }

    /// Approximate bytes held in memory by rows.
    pub fn memory_size(&self) -> usize {
        self.data.values().map(TableData::byte_size).sum()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = journal.close() {
                log::error!("Failed to close store {}: {e}", self.path.display());
            }
        }
    }
}
