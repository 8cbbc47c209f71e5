//! extentfs: read path of a remote-file client cache.
//!
//! Reads are dispatched to a page cache for cache-mapped files, or served from
//! locally resident extents that are populated on demand from a remote source and
//! read back with scatter/gather I/O.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extent;
pub mod file;
pub mod io;
pub mod sidechannel;
pub mod source;
pub mod store;
pub(crate) mod utils;

pub use config::Config;
pub use dispatch::{ReadDispatcher, ReadFlags, ReadOutcome, ReadReply, ReadRequest};
pub use error::{ErrorKind, ReadError};
