use thiserror::Error;

use crate::data_store::row::RowId;

#[derive(Error, Debug)]
pub enum IsoprobeError {
    #[error("Row not found: {id}")]
    NotFound { id: RowId },

    #[error("Wait interrupted: {0}")]
    InterruptedWait(String),

    #[error("Assertion failed: {0}")]
    AssertionFailure(String),

    #[error("Transaction {id} is no longer active")]
    TransactionAborted { id: u64 },

    #[error("Deadlock detected: txn {txn} would wait on a lock held by txn {holder}")]
    Deadlock { txn: u64, holder: u64 },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Arrow manipulation error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, IsoprobeError>;
