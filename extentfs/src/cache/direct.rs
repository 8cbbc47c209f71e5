use super::{CacheCallbacks, CacheFileSizes, CacheManager};
use crate::error::{ReadError, Result};
use crate::file::FileState;
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

/// Cache manager without a cache: every copy is a read through the callbacks.
#[derive(Default)]
pub struct DirectCache {
    files: DashMap<u64, Arc<dyn CacheCallbacks>>,
}

impl DirectCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheManager for DirectCache {
    async fn init_mapping(
        &self,
        file: &Arc<FileState>,
        _sizes: CacheFileSizes,
        callbacks: Arc<dyn CacheCallbacks>,
        _read_ahead_granularity: u64,
    ) -> Result<()> {
        self.files.insert(file.id(), callbacks);
        Ok(())
    }

    async fn copy_read(&self, file: &Arc<FileState>, offset: u64, len: usize) -> Result<Bytes> {
        let callbacks = self
            .files
            .get(&file.id())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ReadError::io(anyhow!("file {} is not cache mapped", file.id())))?;
        callbacks.read_pages(file, offset, len).await
    }

    fn uninit_mapping(&self, file: &FileState) {
        self.files.remove(&file.id());
    }

    fn is_mapped(&self, file: &FileState) -> bool {
        self.files.contains_key(&file.id())
    }
}
