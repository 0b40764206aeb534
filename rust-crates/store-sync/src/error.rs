use crate::schema::TableId;
use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Errors surfaced by the store, the ingestion pipeline and their collaborators.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A log or API call referenced a column outside the table schema, a key of the
    /// wrong arity, or a table that was never registered.
    #[error("schema violation on table {table}: {reason}")]
    SchemaViolation { table: TableId, reason: String },

    /// A batch for a block that is not newer than the last applied block.
    #[error("batch for block {block} is not newer than current block {current}")]
    OutOfOrderBatch { block: u64, current: u64 },

    /// A payload could not be decoded against the declared column types.
    #[error("failed to decode log for table {table}: {reason}")]
    DecodeFailure { table: TableId, reason: String },

    /// A subscriber callback panicked while being notified.
    #[error("subscriber {subscriber} failed: {reason}")]
    SubscriberError { subscriber: u64, reason: String },

    /// Ingestion is paused after a failed batch and must be resumed explicitly.
    #[error("ingestion halted, resume from block {resume_from}: {reason}")]
    Halted { resume_from: u64, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("log source error: {0:#}")]
    Source(anyhow::Error),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl SyncError {
    pub fn schema(table: &TableId, reason: impl Into<String>) -> Self {
        SyncError::SchemaViolation {
            table: table.clone(),
            reason: reason.into(),
        }
    }

    pub fn decode(table: &TableId, reason: impl Into<String>) -> Self {
        SyncError::DecodeFailure {
            table: table.clone(),
            reason: reason.into(),
        }
    }

    /// Errors that stop the pipeline until it is resumed.
    pub fn halts_ingestion(&self) -> bool {
        matches!(
            self,
            SyncError::SchemaViolation { .. }
                | SyncError::DecodeFailure { .. }
                | SyncError::Storage(_)
        )
    }
}
