use std::path::PathBuf;
use thiserror::Error;

use crate::codec::{CodecError, ColumnKind};
use crate::schema::TableRole;

/// Errors raised by the store. Schema and record errors are returned
/// to the caller as-is; nothing is retried internally.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table '{0}' does not exist")]
    UnknownTable(String),

    #[error("column '{column}' of '{table}' references missing table '{target}'")]
    UnknownReference {
        table: String,
        column: String,
        target: String,
    },

    #[error("table '{table}' has no column '{field}'")]
    UnknownField { table: String, field: String },

    #[error("fields {fields:?} are not declared in non-empty table '{table}'")]
    UndeclaredField { table: String, fields: Vec<String> },

    #[error("name '{name}' is already used or reserved in table '{table}'")]
    NameCollision { table: String, name: String },

    #[error("column '{column}' of '{table}' is protected")]
    ProtectedColumn { table: String, column: String },

    #[error("batch for '{table}' has fields of different lengths: {lengths:?}")]
    BatchLengthMismatch {
        table: String,
        lengths: Vec<(String, usize)>,
    },

    #[error("table '{table}' already exists as a {existing} table")]
    DuplicateTable { table: String, existing: TableRole },

    #[error("column '{column}' of '{table}' expects {expected}, got {found}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: ColumnKind,
        found: &'static str,
    },

    #[error("table '{table}' has no row {row}")]
    RowNotFound { table: String, row: i64 },

    #[error("table '{0}' is already being written")]
    ReentrantWrite(String),

    #[error("table '{table}' is referenced by '{referenced_by}'")]
    TableInUse { table: String, referenced_by: String },

    #[error("store is opened read-only")]
    ReadOnly,

    #[error("store file {0} does not exist")]
    NotFound(PathBuf),

    #[error("store file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
