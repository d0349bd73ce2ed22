//! # stepwise-store — adaptive record store for simulation output
//!
//! Tables whose schema keeps growing while a simulation runs: columns and
//! foreign keys can be added, renamed or hidden after rows exist, and a
//! whole store lives in one append-only file.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  insert / update   ┌───────────────────────┐
//! │  producer    │ ─────────────────► │ Store (writer)        │
//! └──────────────┘                    │  Catalog + TableData  │
//!                                     │  ChangeNotifier       │
//!                                     └──────────┬────────────┘
//!                                                │ journal frames
//!                                                ▼
//!                                         <dir>/<name>.db
//!                                                │ refresh()
//!                                                ▼
//!                                     ┌───────────────────────┐
//!                                     │ Store (read-only)     │
//!                                     │  live viewer / replay │
//!                                     └───────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — column kinds, values, cell encoding (arrays LZ4-compressed)
//! - [`schema`] — runtime catalog of tables, columns and references
//! - [`journal`] — single-file frame format and buffered writer
//! - [`store`] — lifecycle, catalog changes, follower refresh
//! - [`records`] — inserts, batches, updates, reads and joins
//! - [`notifier`] — before/after write handlers
//! - [`maintenance`] / [`export`] — merge, rename, remove, JSON/CSV export
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Insert (10 scalar fields) | <5μs |
//! | Batch insert (10k rows) | <20ms |
//! | Reopen + replay (100k rows) | <200ms |

pub mod codec;
pub mod error;
pub mod export;
pub mod journal;
pub mod maintenance;
pub mod notifier;
pub mod query;
pub mod record;
pub mod records;
pub mod schema;
pub mod store;
pub mod table;

pub use codec::{ColumnKind, Elements, NdArray, Timestamp, Value};
pub use error::{StoreError, StoreResult};
pub use export::ExportFormat;
pub use journal::JournalConfig;
pub use notifier::{Phase, WriteEvent, WriteKind};
pub use query::{Projection, Selection};
pub use record::{Batch, BatchInput, Column, ColumnBatch, Datum, Input, Record, Row};
pub use records::BATCH_CHUNK_SIZE;
pub use schema::{ColumnDef, ColumnSpec, FieldType, TableDef, TableRole, ID_COLUMN, TIMESTAMP_COLUMN};
pub use store::{Store, StoreConfig};
