//! Crate-wide error taxonomy.
//!
//! Each subsystem (buffer cache, log engine, transaction manager, recovery)
//! defines its own `thiserror` enum so call sites can match on the errors
//! relevant to them; [`PagebufError`] unifies all of them behind `#[from]`
//! conversions for code that crosses subsystem boundaries (e.g. a
//! transaction commit touching both the log engine and the buffer cache).

use thiserror::Error;

use crate::buffer::BufferError;
use crate::log::LogError;
use crate::recovery::RecoveryError;
use crate::transaction::TransactionError;

pub type Result<T> = std::result::Result<T, PagebufError>;

#[derive(Error, Debug)]
pub enum PagebufError {
    #[error("buffer cache error: {0}")]
    Buffer(#[from] BufferError),

    #[error("log engine error: {0}")]
    Log(#[from] LogError),

    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}
