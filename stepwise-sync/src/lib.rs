//! # stepwise-sync — step synchronization between producers and a viewer
//!
//! Producers write one row per tracked object per step into a shared store
//! file; the consumer follows the file and shows each step only after the
//! producer that wrote it says it is complete.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   i32 step    ┌──────────────┐
//! │ SyncEndpoint │ ────────────► │ SyncHub      │
//! │ (producer 0) │ ◄──────────── │ (consumer)   │
//! └──────┬───────┘    "done"     └──────┬───────┘
//!        │ writes                       │ refresh + read_step
//!        ▼                              ▼
//!   Store (writer) ──► <name>.db ──► Store (follower) ──► StepApplier
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — 4-byte messages: registration, step, `done`, `exit`
//! - [`tracked`] — `<Kind>_<client>_<object>` table names
//! - [`frame`] — step frames and the [`StepApplier`] viewer seam
//! - [`endpoint`] — producer side
//! - [`hub`] — consumer side
//! - [`replay`] — offline replay of a finished run
//! - [`launch`] — starting the consumer as its own process

pub mod endpoint;
pub mod error;
pub mod frame;
pub mod hub;
pub mod launch;
pub mod protocol;
pub mod replay;
pub mod tracked;

pub use endpoint::{EndpointConfig, RenderStatus, SharedStore, SyncEndpoint};
pub use error::{SyncError, SyncResult};
pub use frame::{ApplyOutcome, FrameReader, ObjectDelta, StepApplier, StepFrame};
pub use hub::{HubConfig, HubReport, StopPolicy, SyncHub};
pub use launch::{spawn_consumer, LaunchSpec};
pub use protocol::Message;
pub use replay::{Replay, ReplayState};
pub use tracked::TrackedName;
