//! Store error type
//! Every fallible operation in the crate reports one of these variants

use thiserror::Error;

/// Errors surfaced by the goal store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("durable slot error: {0}")]
    Slot(String),
    #[error("snapshot codec error: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("value {0:?} is not numeric")]
    InvalidValue(String),
    #[error("connection lock poisoned")]
    LockPoisoned,
}
