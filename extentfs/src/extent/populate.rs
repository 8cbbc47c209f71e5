//! On-demand population of missing extents from the remote source.
//!
//! A request computes the parts of its range that are neither resident nor already
//! being fetched, claims them, and fetches each claimed piece on its own task. Small
//! claims are awaited by the requester (`MappedNow`); larger ones are left running
//! in the background (`Pending`) and the requester waits on the extent map's epoch.
//! Every finished piece, successful or not, bumps the epoch and wakes all waiters.

use super::ExtentMap;
use crate::config::ReadConfig;
use crate::error::{ReadError, Result, SharedError};
use crate::source::RemoteSource;
use crate::store::LocalStore;
use crate::utils::{align_down, align_up};
use anyhow::{Context, anyhow};
use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Population {
    /// Everything requested is resident now.
    MappedNow,
    /// Some of it is still being fetched; wait and query again.
    Pending,
}

pub struct PopulationEngine {
    source: Arc<dyn RemoteSource>,
    store: Arc<dyn LocalStore>,
    extent_size: u64,
    sync_fetch_limit: u64,
}

impl PopulationEngine {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        store: Arc<dyn LocalStore>,
        config: &ReadConfig,
    ) -> Self {
        Self {
            source,
            store,
            extent_size: config.extent_size.max(1),
            sync_fetch_limit: config.sync_fetch_limit,
        }
    }

    pub fn store(&self) -> Arc<dyn LocalStore> {
        Arc::clone(&self.store)
    }

    pub fn extent_size(&self) -> u64 {
        self.extent_size
    }

    #[tracing::instrument(level = "trace", skip(self, map), fields(key = map.key()))]
    pub(crate) async fn request(
        self: &Arc<Self>,
        map: &Arc<ExtentMap>,
        offset: u64,
        len: u64,
        file_size: u64,
        allow_inline: bool,
    ) -> Result<Population> {
        let end = offset.saturating_add(len).min(file_size);
        if offset >= end {
            return Ok(Population::MappedNow);
        }
        let start = align_down(offset, self.extent_size);
        let aligned_end = align_up(end, self.extent_size).min(file_size);

        let generation = map.generation();
        let (claimed, missing) = map.claim_missing(start, aligned_end, self.extent_size);
        if !missing {
            return Ok(Population::MappedNow);
        }
        if claimed.is_empty() {
            trace!(offset, len, "range already being populated");
            return Ok(Population::Pending);
        }

        let total: u64 = claimed.iter().map(|(l, r)| r - l).sum();
        let inline = allow_inline && total <= self.sync_fetch_limit;
        debug!(
            offset,
            len,
            pieces = claimed.len(),
            bytes = total,
            inline,
            "populating extents"
        );

        let handles: Vec<_> = claimed
            .into_iter()
            .map(|(l, r)| {
                let engine = Arc::clone(self);
                let map = Arc::clone(map);
                tokio::spawn(async move { engine.fetch(&map, l, r, generation).await })
            })
            .collect();

        if !inline {
            return Ok(Population::Pending);
        }

        let mut first_err: Option<SharedError> = None;
        for joined in join_all(handles).await {
            let res = joined.map_err(|e| Arc::new(anyhow!("population task failed: {e}")));
            if let Err(e) = res.and_then(|r| r) {
                first_err.get_or_insert(e);
            }
        }
        if let Some(err) = first_err {
            return Err(ReadError::PopulationFailed(err));
        }
        // Pieces claimed by another reader may still be on their way.
        match map.query(offset, end - offset) {
            super::Mapping::FullyMapped => Ok(Population::MappedNow),
            _ => Ok(Population::Pending),
        }
    }

    async fn fetch(
        &self,
        map: &ExtentMap,
        start: u64,
        end: u64,
        generation: u64,
    ) -> std::result::Result<(), SharedError> {
        let claim = Claim {
            map,
            start,
            end,
            settled: false,
            failure: None,
        };
        let res = self
            .fetch_piece(map, start, end, generation)
            .await
            .map_err(Arc::new);
        claim.settle(&res);
        res
    }

    async fn fetch_piece(
        &self,
        map: &ExtentMap,
        start: u64,
        end: u64,
        generation: u64,
    ) -> anyhow::Result<()> {
        map.note_fetch();
        let len = end - start;
        let data = self
            .source
            .fetch(map.key(), start, len)
            .await
            .with_context(|| format!("fetch {} at {start} (+{len})", map.key()))?;
        let data = fit_to_len(data, len as usize);

        let storage = self
            .store
            .allocate(len)
            .with_context(|| format!("allocate {len} bytes of local storage"))?;
        if let Err(e) = self.store.write_at(storage, &data).await {
            self.store.release(storage, len);
            return Err(e.context(format!("write extent at {start} to local storage")));
        }
        if map.insert(start, len, storage, generation) {
            trace!(key = map.key(), start, len, storage, "extent populated");
        }
        Ok(())
    }
}

// Remote objects may end before the file size we were told; the tail reads as zeros.
fn fit_to_len(data: Bytes, len: usize) -> Bytes {
    if data.len() >= len {
        return data.slice(..len);
    }
    let mut buf = BytesMut::zeroed(len);
    buf[..data.len()].copy_from_slice(&data);
    buf.freeze()
}

/// An in-flight range. Dropping it releases the claim and wakes waiters; a claim
/// dropped before it was settled (task panic, runtime shutdown) counts as a failure.
struct Claim<'a> {
    map: &'a ExtentMap,
    start: u64,
    end: u64,
    settled: bool,
    failure: Option<SharedError>,
}

impl Claim<'_> {
    fn settle(mut self, res: &std::result::Result<(), SharedError>) {
        if let Err(e) = res {
            warn!(
                key = self.map.key(),
                start = self.start,
                end = self.end,
                error = %e,
                "population failed"
            );
            self.failure = Some(Arc::clone(e));
        }
        self.settled = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.map.release_claim(self.start, self.end);
        let failure = match self.failure.take() {
            Some(e) => Some(e),
            None if !self.settled => Some(Arc::new(anyhow!(
                "population of {}..{} aborted",
                self.start,
                self.end
            ))),
            None => None,
        };
        match failure {
            Some(e) => self.map.record_failure(self.start, self.end, e),
            None => self.map.bump_epoch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Mapping;
    use crate::source::InMemorySource;
    use crate::store::InMemoryLocalStore;
    use std::time::Duration;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn setup(
        source: Arc<InMemorySource>,
        config: ReadConfig,
    ) -> (Arc<ExtentMap>, Arc<InMemoryLocalStore>) {
        let store = Arc::new(InMemoryLocalStore::new());
        let engine = Arc::new(PopulationEngine::new(source, store.clone(), &config));
        (Arc::new(ExtentMap::new("obj", engine)), store)
    }

    #[tokio::test]
    async fn test_small_range_is_fetched_inline() {
        let source = Arc::new(InMemorySource::new());
        source.insert("obj", pattern(10_000));
        let config = ReadConfig::new().extent_size(4096).sync_fetch_limit(8192);
        let (map, store) = setup(source.clone(), config);

        let res = map.request_population(100, 5000, 10_000).await.unwrap();
        assert_eq!(res, Population::MappedNow);
        assert_eq!(map.query(0, 8192), Mapping::FullyMapped);
        assert_eq!(map.extents(), vec![(0, 4096, 0), (4096, 4096, 0)]);

        let mut buf = vec![0u8; 4096];
        let ext = map.try_pin(4096, 1).unwrap();
        let storage = ext.extents()[0].storage_offset();
        store.read_at(storage, &mut buf).await.unwrap();
        assert_eq!(buf, pattern(10_000)[4096..8192]);
        assert_eq!(map.stats().populated_bytes, 8192);
        assert_eq!(map.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_tail_extent_is_clamped_to_file_size() {
        let source = Arc::new(InMemorySource::new());
        source.insert("obj", pattern(5000));
        let config = ReadConfig::new().extent_size(4096).sync_fetch_limit(u64::MAX);
        let (map, _) = setup(source.clone(), config);

        let res = map.request_population(4500, 10_000, 5000).await.unwrap();
        assert_eq!(res, Population::MappedNow);
        assert_eq!(map.extents(), vec![(4096, 904, 0)]);
        assert_eq!(source.fetch_log(), vec![("obj".to_string(), 4096, 904)]);
    }

    #[tokio::test]
    async fn test_large_range_populates_in_background() {
        let source = Arc::new(InMemorySource::with_latency(Duration::from_millis(20)));
        source.insert("obj", pattern(64 * 1024));
        let config = ReadConfig::new().extent_size(16 * 1024).sync_fetch_limit(0);
        let (map, _) = setup(source.clone(), config);

        let since = map.epoch();
        let res = map.request_population(0, 64 * 1024, 64 * 1024).await.unwrap();
        assert_eq!(res, Population::Pending);

        // Everything is claimed; a second request must not fetch again.
        let again = map.request_population(0, 64 * 1024, 64 * 1024).await.unwrap();
        assert_eq!(again, Population::Pending);

        let mut since = since;
        while map.query(0, 64 * 1024) != Mapping::FullyMapped {
            map.wait_for_population(0, 64 * 1024, since).await.unwrap();
            since = map.epoch();
        }
        assert_eq!(source.fetch_count(), 4);
    }

    #[tokio::test]
    async fn test_inline_failure_is_reported() {
        let source = Arc::new(InMemorySource::new());
        source.insert("obj", pattern(1000));
        source.set_failing("obj", true);
        let (map, store) = setup(source.clone(), ReadConfig::new().extent_size(512));

        let err = map.request_population(0, 1000, 1000).await.unwrap_err();
        assert!(matches!(err, ReadError::PopulationFailed(_)));
        assert_eq!(map.inflight_count(), 0);
        assert_eq!(store.bytes_in_use(), 0);
        assert_eq!(map.stats().failures, 2);

        source.set_failing("obj", false);
        let res = map.request_population(0, 1000, 1000).await.unwrap();
        assert_eq!(res, Population::MappedNow);
    }

    #[tokio::test]
    async fn test_background_failure_reaches_waiter() {
        let source = Arc::new(InMemorySource::with_latency(Duration::from_millis(10)));
        source.insert("obj", pattern(1000));
        source.set_failing("obj", true);
        let config = ReadConfig::new().extent_size(4096).sync_fetch_limit(0);
        let (map, _) = setup(source, config);

        let since = map.epoch();
        let res = map.request_population(0, 1000, 1000).await.unwrap();
        assert_eq!(res, Population::Pending);
        let err = map.wait_for_population(0, 1000, since).await.unwrap_err();
        assert!(err.to_string().contains("fetch obj at 0"));
    }

    #[tokio::test]
    async fn test_fetch_racing_invalidation_is_dropped() {
        let source = Arc::new(InMemorySource::with_latency(Duration::from_millis(20)));
        source.insert("obj", pattern(4096));
        let config = ReadConfig::new().extent_size(4096).sync_fetch_limit(0);
        let (map, store) = setup(source, config);

        let since = map.epoch();
        map.request_population(0, 4096, 4096).await.unwrap();
        map.invalidate();
        let mut since = since;
        while map.inflight_count() > 0 {
            map.wait_for_population(0, 4096, since).await.unwrap();
            since = map.epoch();
        }
        assert_eq!(map.extent_count(), 0);
        assert_eq!(store.bytes_in_use(), 0);
    }

    #[test]
    fn test_short_fetch_is_zero_filled() {
        let got = fit_to_len(Bytes::from_static(b"abc"), 5);
        assert_eq!(&got[..], b"abc\0\0");
        assert_eq!(&fit_to_len(Bytes::from_static(b"abcdef"), 2)[..], b"ab");
    }
}
