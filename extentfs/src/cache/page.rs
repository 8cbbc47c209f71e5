use super::{CacheCallbacks, CacheFileSizes, CacheManager};
use crate::error::{ReadError, Result};
use crate::file::FileState;
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use moka::future::Cache;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

// (file id, mapping generation, granule index)
type PageKey = (u64, u64, u64);

struct FileMapping {
    callbacks: Arc<dyn CacheCallbacks>,
    granularity: u64,
    generation: u64,
}

/// Page cache over granules of `read_ahead_granularity` bytes.
///
/// Pages are keyed by a per-mapping generation, so unmapping a file only has to drop
/// its mapping: its old pages can no longer be hit and age out of the cache.
/// Concurrent misses on one page are coalesced into a single fill.
pub struct PageCache {
    pages: Cache<PageKey, Bytes>,
    files: DashMap<u64, Arc<FileMapping>>,
    generation: AtomicU64,
    fills: AtomicU64,
}

impl PageCache {
    pub fn new(capacity: u64) -> Self {
        let pages = Cache::builder()
            .max_capacity(capacity)
            .weigher(|_key: &PageKey, page: &Bytes| -> u32 {
                page.len().try_into().unwrap_or(u32::MAX)
            })
            .build();
        Self {
            pages,
            files: DashMap::new(),
            generation: AtomicU64::new(0),
            fills: AtomicU64::new(0),
        }
    }

    /// Number of pages loaded through the callbacks so far.
    pub fn fills(&self) -> u64 {
        self.fills.load(Ordering::Relaxed)
    }

    fn mapping(&self, file: &FileState) -> Result<Arc<FileMapping>> {
        self.files
            .get(&file.id())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ReadError::io(anyhow!("file {} is not cache mapped", file.id())))
    }

    /// Returns page `index`, filling it on a miss. A cached page shorter than the file
    /// now allows was filled before the file grew; it is dropped and filled again.
    async fn page(
        &self,
        file: &Arc<FileState>,
        mapping: &FileMapping,
        index: u64,
        size: u64,
    ) -> Result<Bytes> {
        let start = index * mapping.granularity;
        let len = mapping.granularity.min(size.saturating_sub(start)) as usize;
        let key = (file.id(), mapping.generation, index);
        let page = self.fill(file, mapping, key, start, len).await?;
        if page.len() >= len {
            return Ok(page);
        }
        trace!(file = file.id(), start, cached = page.len(), len, "refilling short page");
        self.pages.invalidate(&key).await;
        self.fill(file, mapping, key, start, len).await
    }

    async fn fill(
        &self,
        file: &Arc<FileState>,
        mapping: &FileMapping,
        key: PageKey,
        start: u64,
        len: usize,
    ) -> Result<Bytes> {
        self.pages
            .try_get_with(key, async {
                self.fills.fetch_add(1, Ordering::Relaxed);
                trace!(file = file.id(), start, len, "filling page");
                mapping.callbacks.read_pages(file, start, len).await
            })
            .await
            .map_err(|e| (*e).clone())
    }
}

#[async_trait]
impl CacheManager for PageCache {
    async fn init_mapping(
        &self,
        file: &Arc<FileState>,
        sizes: CacheFileSizes,
        callbacks: Arc<dyn CacheCallbacks>,
        read_ahead_granularity: u64,
    ) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            file = file.id(),
            size = sizes.file_size,
            granularity = read_ahead_granularity,
            "cache mapping initialized"
        );
        self.files.insert(
            file.id(),
            Arc::new(FileMapping {
                callbacks,
                granularity: read_ahead_granularity.max(1),
                generation,
            }),
        );
        Ok(())
    }

    async fn copy_read(&self, file: &Arc<FileState>, offset: u64, len: usize) -> Result<Bytes> {
        let mapping = self.mapping(file)?;
        let size = file.size();
        let end = offset.saturating_add(len as u64).min(size);
        if offset >= end {
            return Ok(Bytes::new());
        }
        let g = mapping.granularity;
        let mut out = BytesMut::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let index = pos / g;
            let page = self.page(file, &mapping, index, size).await?;
            let in_page = (pos - index * g) as usize;
            if in_page >= page.len() {
                break;
            }
            let take = page.len().min(in_page + (end - pos) as usize);
            out.extend_from_slice(&page[in_page..take]);
            pos += (take - in_page) as u64;
        }
        Ok(out.freeze())
    }

    fn uninit_mapping(&self, file: &FileState) {
        if self.files.remove(&file.id()).is_some() {
            debug!(file = file.id(), "cache mapping removed");
        }
    }

    fn is_mapped(&self, file: &FileState) -> bool {
        self.files.contains_key(&file.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadConfig;
    use crate::extent::{ExtentMap, PopulationEngine};
    use crate::file::NodeKind;
    use crate::source::InMemorySource;
    use crate::store::InMemoryLocalStore;
    use parking_lot::Mutex;

    /// Serves a fixed pattern and logs every page request.
    struct PatternPages {
        calls: Mutex<Vec<(u64, usize)>>,
    }

    #[async_trait]
    impl CacheCallbacks for PatternPages {
        async fn read_pages(
            &self,
            file: &Arc<FileState>,
            offset: u64,
            len: usize,
        ) -> Result<Bytes> {
            self.calls.lock().push((offset, len));
            let end = (offset + len as u64).min(file.size());
            Ok((offset..end).map(|i| (i % 256) as u8).collect::<Vec<_>>().into())
        }
    }

    fn file(size: u64) -> Arc<FileState> {
        let engine = Arc::new(PopulationEngine::new(
            Arc::new(InMemorySource::new()),
            Arc::new(InMemoryLocalStore::new()),
            &ReadConfig::default(),
        ));
        Arc::new(FileState::new(
            7,
            NodeKind::File,
            size,
            Arc::new(ExtentMap::new("f", engine)),
        ))
    }

    #[tokio::test]
    async fn test_copy_read_spans_pages_and_reuses_them() {
        let cache = PageCache::new(1 << 20);
        let f = file(1000);
        let pages = Arc::new(PatternPages {
            calls: Mutex::new(Vec::new()),
        });
        cache
            .init_mapping(&f, CacheFileSizes::for_size(1000, 4096), pages.clone(), 256)
            .await
            .unwrap();

        let got = cache.copy_read(&f, 200, 400).await.unwrap();
        let expected: Vec<u8> = (200..600u64).map(|i| (i % 256) as u8).collect();
        assert_eq!(&got[..], &expected[..]);
        assert_eq!(*pages.calls.lock(), vec![(0, 256), (256, 256), (512, 256)]);

        // Overlapping EOF: short result, last page clamped to the file size.
        let tail = cache.copy_read(&f, 900, 400).await.unwrap();
        assert_eq!(tail.len(), 100);
        assert_eq!(pages.calls.lock().last(), Some(&(768, 232)));

        cache.copy_read(&f, 300, 10).await.unwrap();
        assert_eq!(cache.fills(), 4);
    }

    #[tokio::test]
    async fn test_unmapped_file_is_rejected_and_remap_refills() {
        let cache = PageCache::new(1 << 20);
        let f = file(100);
        assert!(cache.copy_read(&f, 0, 10).await.is_err());

        let pages = Arc::new(PatternPages {
            calls: Mutex::new(Vec::new()),
        });
        let sizes = CacheFileSizes::for_size(100, 4096);
        cache.init_mapping(&f, sizes, pages.clone(), 64).await.unwrap();
        cache.copy_read(&f, 0, 10).await.unwrap();
        assert!(cache.is_mapped(&f));
        cache.uninit_mapping(&f);
        assert!(!cache.is_mapped(&f));
        cache.init_mapping(&f, sizes, pages.clone(), 64).await.unwrap();
        cache.copy_read(&f, 0, 10).await.unwrap();
        assert_eq!(pages.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_tail_page_is_refilled_after_growth() {
        let cache = PageCache::new(1 << 20);
        let f = file(1000);
        let pages = Arc::new(PatternPages {
            calls: Mutex::new(Vec::new()),
        });
        cache
            .init_mapping(&f, CacheFileSizes::for_size(1000, 4096), pages.clone(), 4096)
            .await
            .unwrap();
        assert_eq!(cache.copy_read(&f, 900, 100).await.unwrap().len(), 100);

        f.set_size(2000).await;
        let got = cache.copy_read(&f, 900, 600).await.unwrap();
        let expected: Vec<u8> = (900..1500u64).map(|i| (i % 256) as u8).collect();
        assert_eq!(&got[..], &expected[..]);
        assert_eq!(*pages.calls.lock(), vec![(0, 1000), (0, 2000)]);

        // Shrinking needs no refill: reads stop at the new size.
        f.set_size(1200).await;
        assert_eq!(cache.copy_read(&f, 900, 600).await.unwrap().len(), 300);
        assert_eq!(cache.fills(), 2);
    }
}
