//! Offline replay of a finished run, without any socket.
//!
//! `Idle → Stepping(1) → … → Stepping(max_step) → Idle`; `restart()` goes
//! back to `Idle` so the next frame is step 1 again.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use stepwise_store::{Store, StoreConfig, StoreResult};

use crate::frame::{ApplyOutcome, FrameReader, StepApplier, StepFrame};
use crate::tracked::{tracked_tables, TrackedName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    /// Last step delivered
    Stepping(i64),
}

pub struct Replay {
    store: Store,
    /// Row count of each tracked table, read once at open
    samples: BTreeMap<TrackedName, usize>,
    max_step: i64,
    state: ReplayState,
    reader: FrameReader,
}

impl Replay {
    /// Open a store file read-only for replay.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        Self::from_store(Store::open_read_only(config)?)
    }

    pub fn from_store(store: Store) -> StoreResult<Self> {
        let mut samples = BTreeMap::new();
        for name in tracked_tables(store.tables(), None) {
            let count = store.count(&name.table_name())?;
            samples.insert(name, count);
        }
        let max_step = samples.values().copied().max().unwrap_or(0) as i64;
        log::info!(
            "Replay of {}: {} object(s), {max_step} step(s)",
            store.name(),
            samples.len()
        );
        Ok(Self {
            store,
            samples,
            max_step,
            state: ReplayState::Idle,
            reader: FrameReader::new(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    pub fn max_step(&self) -> i64 {
        self.max_step
    }

    /// Samples recorded for one object table.
    pub fn nb_samples(&self, table: &str) -> Option<usize> {
        let name = TrackedName::parse(table)?;
        self.samples.get(&name).copied()
    }

    /// Next frame, or `None` (back to `Idle`) after the last step.
    pub fn next_frame(&mut self) -> StoreResult<Option<StepFrame>> {
        let step = match self.state {
            ReplayState::Idle => 1,
            ReplayState::Stepping(n) => n + 1,
        };
        if step > self.max_step {
            self.state = ReplayState::Idle;
            return Ok(None);
        }
        let frame = self.reader.read_step(&self.store, None, step)?;
        self.state = ReplayState::Stepping(step);
        Ok(Some(frame))
    }

    pub fn restart(&mut self) {
        self.state = ReplayState::Idle;
        self.reader.reset();
    }

    /// Apply every remaining step as fast as possible. Returns the number
    /// of frames applied.
    pub fn run<A: StepApplier>(&mut self, applier: &mut A) -> StoreResult<u64> {
        let mut applied = 0;
        while let Some(frame) = self.next_frame()? {
            applied += 1;
            if applier.apply(&frame) == ApplyOutcome::Quit {
                break;
            }
        }
        Ok(applied)
    }

    /// Like [`Replay::run`], paced at `fps` frames per second (1 to 100).
    pub async fn play<A: StepApplier>(&mut self, applier: &mut A, fps: u32) -> StoreResult<u64> {
        let period = Duration::from_secs_f64(1.0 / fps.clamp(1, 100) as f64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut applied = 0;
        loop {
            ticker.tick().await;
            let Some(frame) = self.next_frame()? else {
                break;
            };
            applied += 1;
            if applier.apply(&frame) == ApplyOutcome::Quit {
                break;
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_store::{ColumnKind, ColumnSpec, Record, TableRole, Value};

    fn recorded_run(dir: &std::path::Path) -> StoreConfig {
        let mut store = Store::new(dir, "run", false).unwrap();
        let columns = [ColumnSpec::new("alpha", ColumnKind::Float)];
        store.create_table("Mesh_0_0", TableRole::Storing, &columns).unwrap();
        store.create_table("Points_0_1", TableRole::Storing, &columns).unwrap();
        for alpha in [0.1, 0.2, 0.3] {
            store.insert("Mesh_0_0", Record::new().with("alpha", alpha)).unwrap();
        }
        store.insert("Points_0_1", Record::new().with("alpha", 1.0)).unwrap();
        let config = store.config().clone();
        store.close(false).unwrap();
        config
    }

    #[test]
    fn test_samples_and_max_step() {
        let dir = tempfile::tempdir().unwrap();
        let replay = Replay::open(recorded_run(dir.path())).unwrap();
        assert_eq!(replay.max_step(), 3);
        assert_eq!(replay.nb_samples("Mesh_0_0"), Some(3));
        assert_eq!(replay.nb_samples("Points_0_1"), Some(1));
        assert_eq!(replay.nb_samples("Stats"), None);
    }

    #[test]
    fn test_steps_then_idle_then_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut replay = Replay::open(recorded_run(dir.path())).unwrap();

        let first = replay.next_frame().unwrap().unwrap();
        assert_eq!(first.objects.len(), 2);
        assert_eq!(replay.state(), ReplayState::Stepping(1));

        let third = {
            replay.next_frame().unwrap();
            replay.next_frame().unwrap().unwrap()
        };
        assert_eq!(third.objects.len(), 1);
        assert_eq!(
            third.object("Mesh_0_0").unwrap().row.get("alpha"),
            Some(&Value::Float(0.3))
        );
        assert!(replay.next_frame().unwrap().is_none());
        assert_eq!(replay.state(), ReplayState::Idle);

        replay.restart();
        let again = replay.next_frame().unwrap().unwrap();
        assert_eq!(again.step, 1);
        assert!(again.objects.iter().all(|o| o.created));
    }

    #[test]
    fn test_run_stops_on_quit() {
        let dir = tempfile::tempdir().unwrap();
        let mut replay = Replay::open(recorded_run(dir.path())).unwrap();
        let mut applier = |frame: &StepFrame| {
            if frame.step == 2 {
                ApplyOutcome::Quit
            } else {
                ApplyOutcome::Continue
            }
        };
        assert_eq!(replay.run(&mut applier).unwrap(), 2);
        assert_eq!(replay.run(&mut applier).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_play_paces_all_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mut replay = Replay::open(recorded_run(dir.path())).unwrap();
        let mut steps = Vec::new();
        let mut applier = |frame: &StepFrame| {
            steps.push(frame.step);
            ApplyOutcome::Continue
        };
        assert_eq!(replay.play(&mut applier, 100).await.unwrap(), 3);
        assert_eq!(steps, vec![1, 2, 3]);
    }
}
