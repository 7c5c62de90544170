//! Error taxonomy for the engine.
//!
//! Three domain families (validation, conflict, not-found) plus storage and
//! internal faults. Callers match on the family to map failures onto their
//! own surface (HTTP status, dialog, retry).

use thiserror::Error;

/// Error returned by every public engine operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or out-of-range input: bad quantities, non-positive
    /// amounts, split configurations that do not add up.
    #[error("{0}")]
    Validation(String),

    /// State-machine violation: opening a second shift, paying into a
    /// frozen account, recording cash with no open shift.
    #[error("{0}")]
    Conflict(String),

    /// A referenced checkout/account/shift/payment does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Poisoned lock or broken stored data (e.g. unreadable split rule).
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        EngineError::Conflict(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("serialization: {e}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
