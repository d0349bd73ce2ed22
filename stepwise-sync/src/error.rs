use std::time::Duration;

use stepwise_store::StoreError;
use thiserror::Error;

/// Errors of the step-synchronization layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Reset, broken pipe or any other socket failure. Terminal for a
    /// producer; the hub only drops the affected client.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connection closed by the consumer")]
    Closed,

    #[error("no consumer listening after {0:?}")]
    Timeout(Duration),

    #[error("client index {0} registered twice")]
    DuplicateClient(i32),

    #[error("no object with id {0}")]
    UnknownObject(i64),

    #[error("object {id} is a {actual}, not a {requested}")]
    KindMismatch {
        id: usize,
        actual: String,
        requested: String,
    },

    #[error("invalid object kind '{0}'")]
    InvalidKind(String),

    #[error("step {0} collides with a protocol token")]
    StepOverflow(i64),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cannot launch consumer: {0}")]
    Launch(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::ConnectionLost(e.to_string())
    }
}
