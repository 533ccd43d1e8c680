//! Typed errors for the persistence contract.
//!
//! Uses `thiserror` for library errors (not `anyhow`), mirroring the
//! rest of the pipeline's crates.

use thiserror::Error;

/// Errors that can occur while reading or writing aggregation entities.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The underlying storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A referenced event does not exist.
    #[error("event not found: {0}")]
    EventNotFound(i64),

    /// A referenced event is not in the expected status.
    #[error("event {event_id} has status {status:?}, expected active")]
    EventNotActive { event_id: i64, status: EventStatus },

    /// A transaction could not be committed and was rolled back.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;

pub use crate::types::EventStatus;
