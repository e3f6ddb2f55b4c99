//! pagebuf — an aggregated page buffer cache and write-ahead log /
//! transaction engine, ported from XFS's `pagebuf` and `xfs_log`/
//! `xfs_trans` subsystems onto a generic page-cache-backed host.
//!
//! The crate is organized around two tightly coupled halves:
//!
//! - [`buffer`]/[`page_store`]/[`block_io`]: the page buffer cache,
//!   layered atop an abstract page store and block I/O port, with a
//!   hash-indexed lookup table ([`buffer::BufferCache`]) and a
//!   delayed-write flusher daemon ([`buffer::DelwriFlusher`]).
//! - [`log`]/[`transaction`]/[`log_item`]/[`ail`]: the in-core circular
//!   log ([`log::LogEngine`]), the transaction facility
//!   ([`transaction::Transaction`]), and the Active Item List
//!   ([`ail::Ail`]) that drives tail recovery.
//!
//! [`recovery`] replays the log after an unclean mount, and [`mount`]
//! ties every piece together behind one handle.

pub mod ail;
pub mod block_io;
pub mod buffer;
pub mod common;
pub mod error;
pub mod log;
pub mod log_item;
pub mod mount;
pub mod page_store;
pub mod recovery;
pub mod transaction;

pub use error::{PagebufError, Result};
pub use mount::{MountConfig, MountState};
