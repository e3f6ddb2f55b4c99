//! Transaction-specific error types.

use thiserror::Error;

use crate::buffer::BufferError;
use crate::log::LogError;

pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("log engine error: {0}")]
    Log(#[from] LogError),

    #[error("buffer cache error: {0}")]
    Buffer(#[from] BufferError),

    /// `commit()` called on a transaction that never logged an item.
    #[error("transaction has no dirty items to commit")]
    Empty,

    /// The transaction was already committed or canceled.
    #[error("transaction already finished")]
    AlreadyFinished,
}
