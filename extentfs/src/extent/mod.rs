//! Per-file extent map.
//!
//! An [`Extent`] is a resident range of a remote file, stored at some offset of the
//! [`LocalStore`]. The map indexes extents by file offset under one `RwLock` (the
//! "extents lock"): shared for queries and pinning, exclusive for insert, evict and
//! invalidate. The lock is a `parking_lot` lock on purpose: its guards are not `Send`,
//! so none of them can be held across an `.await`.
//!
//! Readers pin the extents backing a range with [`ExtentMap::try_pin`], which bumps the
//! reference count of every covering extent inside the same critical section that
//! observed them mapped. The returned [`ExtentRefs`] drops the references again.
//! Eviction only removes extents whose count is zero; invalidation unmaps referenced
//! extents and leaves their storage to be reclaimed by the last dereference.

pub mod populate;

pub use populate::{Population, PopulationEngine};

use crate::error::{ReadError, Result, SharedError};
use crate::store::LocalStore;
use crate::utils::Intervals;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Failures older than this many entries are forgotten.
const MAX_RECORDED_FAILURES: usize = 64;

#[derive(Debug)]
pub struct Extent {
    offset: u64,
    len: u64,
    storage_offset: u64,
    refs: AtomicU32,
    mapped: AtomicBool,
    released: AtomicBool,
}

impl Extent {
    pub(crate) fn new(offset: u64, len: u64, storage_offset: u64) -> Self {
        Self {
            offset,
            len,
            storage_offset,
            refs: AtomicU32::new(0),
            mapped: AtomicBool::new(true),
            released: AtomicBool::new(false),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn storage_offset(&self) -> u64 {
        self.storage_offset
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::SeqCst)
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.offset < end && start < self.end()
    }

    /// Hands the storage back exactly once, whoever gets here first.
    fn release_storage(&self, store: &dyn LocalStore) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        store.release(self.storage_offset, self.len);
        true
    }
}

/// Result of [`ExtentMap::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    FullyMapped,
    PartiallyMapped { first_gap: u64 },
    Unmapped,
}

#[derive(Debug, Default)]
struct ExtentStats {
    populated_bytes: AtomicU64,
    fetches: AtomicU64,
    evicted_bytes: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentStatsSnapshot {
    pub populated_bytes: u64,
    pub fetches: u64,
    pub evicted_bytes: u64,
    /// Query/wait iterations readers needed beyond their first attempt.
    pub retries: u64,
    pub failures: u64,
}

#[derive(Debug)]
struct PopulationFailure {
    start: u64,
    end: u64,
    epoch: u64,
    error: SharedError,
}

pub struct ExtentMap {
    key: String,
    extents: RwLock<BTreeMap<u64, Arc<Extent>>>,
    store: Arc<dyn LocalStore>,
    engine: Arc<PopulationEngine>,
    // Ranges some task is currently fetching.
    inflight: Mutex<Vec<(u64, u64)>>,
    failures: Mutex<Vec<PopulationFailure>>,
    // Bumped on every extent state change; waiters compare against it.
    epoch: AtomicU64,
    // Bumped on invalidation; fetches claimed under an older generation are dropped.
    generation: AtomicU64,
    changed: Notify,
    stats: ExtentStats,
}

impl ExtentMap {
    pub fn new(key: impl Into<String>, engine: Arc<PopulationEngine>) -> Self {
        Self {
            key: key.into(),
            extents: RwLock::new(BTreeMap::new()),
            store: engine.store(),
            engine,
            inflight: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            changed: Notify::new(),
            stats: ExtentStats::default(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn engine(&self) -> &Arc<PopulationEngine> {
        &self.engine
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Classifies how much of `[offset, offset + len)` is resident.
    pub fn query(&self, offset: u64, len: u64) -> Mapping {
        let extents = self.extents.read();
        Self::classify(&extents, offset, offset.saturating_add(len))
    }

    fn classify(extents: &BTreeMap<u64, Arc<Extent>>, start: u64, end: u64) -> Mapping {
        if start >= end {
            return Mapping::FullyMapped;
        }
        let mut pos = start;
        let mut touched = false;
        for ext in Self::overlapping(extents, start, end) {
            if !ext.is_mapped() {
                continue;
            }
            touched = true;
            if ext.offset() > pos {
                return Mapping::PartiallyMapped { first_gap: pos };
            }
            pos = pos.max(ext.end());
            if pos >= end {
                return Mapping::FullyMapped;
            }
        }
        if touched {
            Mapping::PartiallyMapped { first_gap: pos }
        } else {
            Mapping::Unmapped
        }
    }

    fn overlapping(
        extents: &BTreeMap<u64, Arc<Extent>>,
        start: u64,
        end: u64,
    ) -> impl Iterator<Item = &Arc<Extent>> {
        // The extent starting at or before `start` may still reach into the range.
        let first = extents
            .range(..=start)
            .next_back()
            .map(|(off, _)| *off)
            .unwrap_or(start);
        extents
            .range(first..end.max(first))
            .map(|(_, ext)| ext)
            .filter(move |ext| ext.overlaps(start, end))
    }

    /// Sub-ranges of `[start, end)` not covered by a mapped extent, in file order.
    pub(crate) fn gaps(&self, start: u64, end: u64) -> Intervals<u64> {
        let extents = self.extents.read();
        let mut gaps = Intervals::new(start, end.max(start));
        for ext in Self::overlapping(&extents, start, end) {
            if ext.is_mapped() {
                gaps.cut(ext.offset(), ext.end());
            }
        }
        gaps
    }

    /// Pins every extent backing `[offset, offset + len)` if the range is fully mapped;
    /// otherwise reports how it is mapped and pins nothing.
    pub fn try_pin(
        self: &Arc<Self>,
        offset: u64,
        len: u64,
    ) -> std::result::Result<ExtentRefs, Mapping> {
        let end = offset.saturating_add(len);
        let extents = self.extents.read();
        match Self::classify(&extents, offset, end) {
            Mapping::FullyMapped => {}
            other => return Err(other),
        }
        let pinned: Vec<Arc<Extent>> = Self::overlapping(&extents, offset, end)
            .filter(|ext| ext.is_mapped())
            .cloned()
            .collect();
        Self::reference(&pinned);
        drop(extents);
        trace!(key = %self.key, offset, len, extents = pinned.len(), "pinned extents");
        Ok(ExtentRefs {
            map: Arc::clone(self),
            extents: pinned,
        })
    }

    // Callers hold the extents lock and have just seen every extent mapped.
    fn reference(extents: &[Arc<Extent>]) {
        for ext in extents {
            ext.refs.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drops one reference from each extent. An extent unmapped by invalidation has its
    /// storage reclaimed when its last reference goes.
    pub(crate) fn dereference(&self, extents: &[Arc<Extent>]) {
        for ext in extents {
            let prev = ext.refs.fetch_sub(1, Ordering::SeqCst);
            debug_assert!(prev > 0, "extent reference count underflow");
            if prev == 1 && !ext.is_mapped() && ext.release_storage(self.store.as_ref()) {
                trace!(key = %self.key, offset = ext.offset(), "reaped unmapped extent");
            }
        }
    }

    /// Adds a freshly populated extent. Returns false (and frees the storage) when the
    /// fetch was claimed before an invalidation or the range is already resident.
    pub(crate) fn insert(
        &self,
        offset: u64,
        len: u64,
        storage_offset: u64,
        generation: u64,
    ) -> bool {
        let ext = Arc::new(Extent::new(offset, len, storage_offset));
        let mut extents = self.extents.write();
        let stale = generation != self.generation();
        let overlap = Self::overlapping(&extents, offset, offset + len).next().is_some();
        if stale || overlap {
            drop(extents);
            debug!(key = %self.key, offset, len, stale, "discarding populated extent");
            ext.release_storage(self.store.as_ref());
            return false;
        }
        extents.insert(offset, ext);
        self.stats.populated_bytes.fetch_add(len, Ordering::Relaxed);
        true
    }

    /// Copies `data` into local storage and maps it at `offset`, as if it had been
    /// fetched from the remote source.
    pub async fn prime(&self, offset: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        let storage = self
            .store
            .allocate(len)
            .map_err(|e| ReadError::ResourceExhausted(format!("{e:#}")))?;
        if let Err(e) = self.store.write_at(storage, data).await {
            self.store.release(storage, len);
            return Err(ReadError::io(e));
        }
        if !self.insert(offset, len, storage, self.generation()) {
            return Err(ReadError::InvalidRange(format!(
                "range at {offset} (+{len}) is already resident"
            )));
        }
        self.bump_epoch();
        Ok(())
    }

    /// Removes unreferenced extents overlapping `[offset, offset + len)`; returns the
    /// number of bytes freed.
    pub fn evict(&self, offset: u64, len: u64) -> u64 {
        let end = offset.saturating_add(len);
        let mut extents = self.extents.write();
        let victims: Vec<u64> = Self::overlapping(&extents, offset, end)
            .filter(|ext| ext.refs() == 0)
            .map(|ext| ext.offset())
            .collect();
        let mut freed = 0;
        for off in victims {
            if let Some(ext) = extents.remove(&off) {
                // No reader can pin it: that needs the lock we hold exclusively.
                ext.mapped.store(false, Ordering::SeqCst);
                if ext.release_storage(self.store.as_ref()) {
                    freed += ext.len();
                }
            }
        }
        drop(extents);
        if freed > 0 {
            self.stats.evicted_bytes.fetch_add(freed, Ordering::Relaxed);
            debug!(key = %self.key, offset, len, freed, "evicted extents");
            self.bump_epoch();
        }
        freed
    }

    /// Drops every extent. Referenced extents are unmapped and reclaimed by their last
    /// dereference; fetches already in flight will not be inserted.
    pub fn invalidate(&self) {
        let mut extents = self.extents.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut deferred = 0;
        for (_, ext) in std::mem::take(&mut *extents) {
            ext.mapped.store(false, Ordering::SeqCst);
            if ext.refs.load(Ordering::SeqCst) == 0 {
                ext.release_storage(self.store.as_ref());
            } else {
                deferred += 1;
            }
        }
        drop(extents);
        debug!(key = %self.key, deferred, "invalidated extent map");
        self.bump_epoch();
    }

    pub fn resident_bytes(&self) -> u64 {
        self.extents.read().values().map(|ext| ext.len()).sum()
    }

    pub fn extent_count(&self) -> usize {
        self.extents.read().len()
    }

    /// Snapshot of `(offset, len, refs)` for every extent, in file order.
    pub fn extents(&self) -> Vec<(u64, u64, u32)> {
        self.extents
            .read()
            .values()
            .map(|ext| (ext.offset(), ext.len(), ext.refs()))
            .collect()
    }

    pub fn stats(&self) -> ExtentStatsSnapshot {
        ExtentStatsSnapshot {
            populated_bytes: self.stats.populated_bytes.load(Ordering::Relaxed),
            fetches: self.stats.fetches.load(Ordering::Relaxed),
            evicted_bytes: self.stats.evicted_bytes.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn note_retry(&self) {
        self.stats.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_fetch(&self) {
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Records a failed fetch of `[start, end)` and publishes it with a new epoch.
    ///
    /// The epoch is bumped under the failure lock, so a waiter that observes the new
    /// epoch also finds the failure.
    pub(crate) fn record_failure(&self, start: u64, end: u64, error: SharedError) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        {
            let mut failures = self.failures.lock();
            if failures.len() >= MAX_RECORDED_FAILURES {
                failures.remove(0);
            }
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            failures.push(PopulationFailure {
                start,
                end,
                epoch,
                error,
            });
        }
        self.changed.notify_waiters();
    }

    fn failure_since(&self, start: u64, end: u64, since: u64) -> Option<SharedError> {
        self.failures
            .lock()
            .iter()
            .rev()
            .find(|f| f.epoch > since && f.start < end && start < f.end)
            .map(|f| Arc::clone(&f.error))
    }

    /// Waits until the extent state has changed since `since` (an earlier
    /// [`ExtentMap::epoch`]). Fails if a fetch overlapping the range failed meanwhile.
    ///
    /// Returning `Ok` says nothing about the range itself; callers query again.
    pub async fn wait_for_population(&self, offset: u64, len: u64, since: u64) -> Result<()> {
        loop {
            // Registered before the epoch check so a bump in between is not missed.
            let notified = self.changed.notified();
            if self.epoch() != since {
                break;
            }
            notified.await;
        }
        match self.failure_since(offset, offset.saturating_add(len), since) {
            Some(err) => Err(ReadError::PopulationFailed(err)),
            None => Ok(()),
        }
    }

    /// Asks for every missing part of `[offset, offset + len)` (clamped to `file_size`)
    /// to be fetched. See [`PopulationEngine::request`].
    pub async fn request_population(
        self: &Arc<Self>,
        offset: u64,
        len: u64,
        file_size: u64,
    ) -> Result<Population> {
        let engine = Arc::clone(&self.engine);
        engine.request(self, offset, len, file_size, true).await
    }

    /// Like [`ExtentMap::request_population`] but never fetches on the caller's task.
    pub async fn request_population_async(
        self: &Arc<Self>,
        offset: u64,
        len: u64,
        file_size: u64,
    ) -> Result<Population> {
        let engine = Arc::clone(&self.engine);
        engine.request(self, offset, len, file_size, false).await
    }

    /// Claims the parts of `[start, end)` that are neither resident nor being fetched.
    /// Returns the claimed ranges and whether anything was missing at all.
    pub(crate) fn claim_missing(
        &self,
        start: u64,
        end: u64,
        max_piece: u64,
    ) -> (Vec<(u64, u64)>, bool) {
        let mut inflight = self.inflight.lock();
        let mut gaps = self.gaps(start, end);
        if gaps.is_empty() {
            return (Vec::new(), false);
        }
        for &(l, r) in inflight.iter() {
            gaps.cut(l, r);
        }
        let mut claimed = Vec::new();
        for (l, r) in gaps.collect() {
            let mut pos = l;
            while pos < r {
                let piece_end = (crate::utils::align_down(pos, max_piece) + max_piece).min(r);
                claimed.push((pos, piece_end));
                pos = piece_end;
            }
        }
        inflight.extend(claimed.iter().copied());
        (claimed, true)
    }

    pub(crate) fn release_claim(&self, start: u64, end: u64) {
        let mut inflight = self.inflight.lock();
        if let Some(idx) = inflight.iter().position(|&r| r == (start, end)) {
            inflight.swap_remove(idx);
        }
    }

    /// Ranges currently being fetched.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl Drop for ExtentMap {
    fn drop(&mut self) {
        // Nothing can hold references any more: each ExtentRefs keeps the map alive.
        for (_, ext) in std::mem::take(self.extents.get_mut()) {
            ext.release_storage(self.store.as_ref());
        }
    }
}

/// References on the extents backing one request. Dropping it dereferences them.
pub struct ExtentRefs {
    map: Arc<ExtentMap>,
    extents: Vec<Arc<Extent>>,
}

impl ExtentRefs {
    pub fn extents(&self) -> &[Arc<Extent>] {
        &self.extents
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
}

impl std::fmt::Debug for ExtentRefs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentRefs")
            .field("key", &self.map.key)
            .field("extents", &self.extents.len())
            .finish()
    }
}

impl Drop for ExtentRefs {
    fn drop(&mut self) {
        self.map.dereference(&self.extents);
    }
}
