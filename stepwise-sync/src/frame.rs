//! Step frames: what changed for each tracked object at one step, and the
//! seam through which a viewer consumes them.

use std::collections::HashSet;

use stepwise_store::{Row, Store, StoreResult};

use crate::tracked::{tracked_tables, TrackedName};

/// Non-null fields one object wrote at a step.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDelta {
    pub name: TrackedName,
    /// First frame this reader delivers for the object
    pub created: bool,
    pub row: Row,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepFrame {
    /// `None` when the frame covers every client (replay)
    pub client: Option<i32>,
    pub step: i64,
    pub objects: Vec<ObjectDelta>,
}

impl StepFrame {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn object(&self, table: &str) -> Option<&ObjectDelta> {
        self.objects.iter().find(|o| o.name.table_name() == table)
    }
}

/// What the viewer wants after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Continue,
    /// The viewer was closed; every producer gets `exit`.
    Quit,
}

/// Receives step frames. Rendering backends implement this.
pub trait StepApplier {
    fn apply(&mut self, frame: &StepFrame) -> ApplyOutcome;
}

impl<F> StepApplier for F
where
    F: FnMut(&StepFrame) -> ApplyOutcome,
{
    fn apply(&mut self, frame: &StepFrame) -> ApplyOutcome {
        self(frame)
    }
}

/// Builds step frames from a store, remembering which objects were
/// already delivered.
#[derive(Debug, Default)]
pub struct FrameReader {
    seen: HashSet<TrackedName>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame of `step` for one client (or all of them).
    ///
    /// A table without row `step`, or whose row holds only nulls, has no
    /// delta at this step and is left out of the frame.
    pub fn read_step(&mut self, store: &Store, client: Option<i32>, step: i64) -> StoreResult<StepFrame> {
        let mut objects = Vec::new();
        for name in tracked_tables(store.tables(), client) {
            let Some(row) = store.row_at(&name.table_name(), step)? else {
                continue;
            };
            let row = row.without_nulls();
            if row.is_empty() {
                continue;
            }
            let created = self.seen.insert(name.clone());
            objects.push(ObjectDelta { name, created, row });
        }
        Ok(StepFrame { client, step, objects })
    }

    /// Forget delivered objects; the next frames mark them created again.
    pub fn reset(&mut self) {
        self.seen.clear();
    }
}
