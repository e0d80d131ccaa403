//! Failures surfaced by the redb-backed pool, worker and secret tables.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// A failed read or write against the Kiln store.
///
/// Backend variants carry the redb or serde_json message as text.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    /// A pool, worker or secret record could not be encoded.
    #[error("serialization error: {0}")]
    Serialize(String),

    /// A stored record no longer matches its type, e.g. after a schema change.
    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// No record under the table key (`namespace/name` or
    /// `namespace/pool/worker`). Worker deletion counts this as already done.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record already sits under the table key. CA bootstrap and secret
    /// creation read this as another reconciler winning the race.
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}
