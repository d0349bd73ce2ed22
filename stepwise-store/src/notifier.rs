//! Before/after write handlers per table.
//!
//! ```text
//! on_before_write / on_after_write ──► pending
//!                                        │ activate()
//!                                        ▼
//!                             bound[table][phase] ──► fired on writes
//! ```
//!
//! Handlers get `&mut Store` and may write other tables. While a write to
//! table T is in flight (handlers included), writes and schema changes on T
//! fail with `ReentrantWrite`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::codec::Value;
use crate::error::{StoreError, StoreResult};
use crate::schema::TableId;
use crate::store::Store;

/// When a handler runs relative to the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    BeforeWrite,
    AfterWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
}

/// What a handler is told about a write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEvent {
    /// Display name of the written table
    pub table: String,
    pub kind: WriteKind,
    /// Row being written (assigned before the before-write phase)
    pub row_id: i64,
    /// Written values, references as row ids
    pub values: Vec<(String, Value)>,
}

impl WriteEvent {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Write handler.
pub type Handler = Box<dyn FnMut(&mut Store, &WriteEvent) -> StoreResult<()> + Send>;

struct Registration {
    table: String,
    phase: Phase,
    tag: Option<String>,
    handler: Handler,
}

pub(crate) struct Bound {
    tag: Option<String>,
    handler: Handler,
}

/// Handler registry plus the set of tables currently being written.
#[derive(Default)]
pub struct ChangeNotifier {
    pending: Vec<Registration>,
    bound: HashMap<(TableId, Phase), Vec<Bound>>,
    writing: HashSet<TableId>,
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("pending", &self.pending.len())
            .field("bound", &self.bound_count())
            .field("writing", &self.writing)
            .finish()
    }
}

impl ChangeNotifier {
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn bound_count(&self) -> usize {
        self.bound.values().map(Vec::len).sum()
    }

    pub(crate) fn forget(&mut self, table: TableId) {
        self.bound.retain(|(t, _), _| *t != table);
    }

    fn take(&mut self, table: TableId, phase: Phase) -> Vec<Bound> {
        self.bound.remove(&(table, phase)).unwrap_or_default()
    }

    /// Put handlers back after firing, ahead of any bound meanwhile.
    fn restore(&mut self, table: TableId, phase: Phase, mut handlers: Vec<Bound>) {
        if let Some(added) = self.bound.remove(&(table, phase)) {
            handlers.extend(added);
        }
        if !handlers.is_empty() {
            self.bound.insert((table, phase), handlers);
        }
    }
}

impl Store {
    /// Queue a handler run before each write to `table`.
    pub fn on_before_write<F>(&mut self, table: &str, handler: F)
    where
        F: FnMut(&mut Store, &WriteEvent) -> StoreResult<()> + Send + 'static,
    {
        self.on_write(Phase::BeforeWrite, table, None, handler);
    }

    /// Queue a handler run after each write to `table`.
    pub fn on_after_write<F>(&mut self, table: &str, handler: F)
    where
        F: FnMut(&mut Store, &WriteEvent) -> StoreResult<()> + Send + 'static,
    {
        self.on_write(Phase::AfterWrite, table, None, handler);
    }

    /// Queue a handler. Nothing fires until [`Store::activate`].
    pub fn on_write<F>(&mut self, phase: Phase, table: &str, tag: Option<&str>, handler: F)
    where
        F: FnMut(&mut Store, &WriteEvent) -> StoreResult<()> + Send + 'static,
    {
        self.notifier.pending.push(Registration {
            table: table.to_string(),
            phase,
            tag: tag.map(str::to_string),
            handler: Box::new(handler),
        });
    }

    /// Bind pending handlers. Handlers naming a missing table are dropped.
    /// Returns the number bound.
    pub fn activate(&mut self) -> usize {
        let pending = std::mem::take(&mut self.notifier.pending);
        let mut bound = 0;
        for reg in pending {
            match self.catalog.table_id(&reg.table) {
                Some(id) => {
                    self.notifier
                        .bound
                        .entry((id, reg.phase))
                        .or_default()
                        .push(Bound {
                            tag: reg.tag,
                            handler: reg.handler,
                        });
                    bound += 1;
                }
                None => {
                    log::warn!(
                        "Dropping {:?} handler for missing table '{}'",
                        reg.phase,
                        reg.table
                    );
                }
            }
        }
        bound
    }

    /// Remove bound handlers registered with `tag`. Returns how many.
    pub fn disconnect(&mut self, tag: &str) -> usize {
        let mut removed = 0;
        for handlers in self.notifier.bound.values_mut() {
            let before = handlers.len();
            handlers.retain(|b| b.tag.as_deref() != Some(tag));
            removed += before - handlers.len();
        }
        self.notifier.bound.retain(|_, h| !h.is_empty());
        removed
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub(crate) fn ensure_idle(&self, table: TableId) -> StoreResult<()> {
        if self.notifier.writing.contains(&table) {
            let name = self
                .catalog
                .get(table)
                .map_or_else(|| table.to_string(), |t| t.name.clone());
            return Err(StoreError::ReentrantWrite(name));
        }
        Ok(())
    }

    /// Mark `tables` as being written. Fails if any already is.
    pub(crate) fn begin_write(&mut self, tables: &[TableId]) -> StoreResult<()> {
        for table in tables {
            self.ensure_idle(*table)?;
        }
        self.notifier.writing.extend(tables.iter().copied());
        Ok(())
    }

    pub(crate) fn end_write(&mut self, tables: &[TableId]) {
        for table in tables {
            self.notifier.writing.remove(table);
        }
    }

    /// Run the bound handlers of one table and phase, stopping at the
    /// first error.
    pub(crate) fn fire(&mut self, table: TableId, phase: Phase, event: &WriteEvent) -> StoreResult<()> {
        let mut handlers = self.notifier.take(table, phase);
        if handlers.is_empty() {
            return Ok(());
        }
        let mut result = Ok(());
        for bound in handlers.iter_mut() {
            if let Err(e) = (bound.handler)(self, event) {
                result = Err(e);
                break;
            }
        }
        self.notifier.restore(table, phase, handlers);
        result
    }
}
