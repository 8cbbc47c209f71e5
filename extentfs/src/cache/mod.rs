//! Cached read path.
//!
//! Reads against a cache-mapped file go through a [`CacheManager`], which serves them
//! from its own pages and fills misses through the [`CacheCallbacks`] registered when
//! the file was mapped. Two managers exist: [`PageCache`], a byte-budgeted page cache,
//! and [`DirectCache`], which sends every read straight to the callbacks.

pub mod direct;
pub mod page;

pub use direct::DirectCache;
pub use page::PageCache;

use crate::error::Result;
use crate::file::FileState;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Sizes handed to the cache manager when a file is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFileSizes {
    pub file_size: u64,
    pub allocation_size: u64,
    pub valid_data_length: u64,
}

impl CacheFileSizes {
    pub fn for_size(size: u64, extent_size: u64) -> Self {
        Self {
            file_size: size,
            allocation_size: crate::utils::align_up(size, extent_size.max(1)),
            valid_data_length: size,
        }
    }
}

/// How a cache manager reads data it does not hold.
#[async_trait]
pub trait CacheCallbacks: Send + Sync {
    /// Reads `[offset, offset + len)` of `file` underneath the cache. These are paging
    /// reads: they never take the file's main lock and stop at end of file.
    async fn read_pages(&self, file: &Arc<FileState>, offset: u64, len: usize) -> Result<Bytes>;
}

#[async_trait]
pub trait CacheManager: Send + Sync {
    /// Registers `file` with the cache. Called once, before its first cached read.
    async fn init_mapping(
        &self,
        file: &Arc<FileState>,
        sizes: CacheFileSizes,
        callbacks: Arc<dyn CacheCallbacks>,
        read_ahead_granularity: u64,
    ) -> Result<()>;

    /// Copies up to `len` bytes at `offset` out of the cache; the result is short at
    /// end of file.
    async fn copy_read(&self, file: &Arc<FileState>, offset: u64, len: usize) -> Result<Bytes>;

    /// Forgets the file and everything cached for it.
    fn uninit_mapping(&self, file: &FileState);

    fn is_mapped(&self, file: &FileState) -> bool;
}
