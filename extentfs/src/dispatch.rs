//! Entry point of the read path.
//!
//! [`ReadDispatcher`] owns the open files and decides, per request, which path serves
//! it: the side channel for pseudo-files, the cache manager for normal reads of
//! cache-mapped files, and the extent path (population, runs, gather I/O) for paging
//! reads and non-cached reads.

use crate::cache::{CacheCallbacks, CacheFileSizes, CacheManager, DirectCache, PageCache};
use crate::config::{Config, ReadConfig};
use crate::error::{FileCondition, ReadError, Result};
use crate::extent::{ExtentMap, PopulationEngine};
use crate::file::{FileIdentity, FileState, NodeKind};
use crate::io::{Completion, ExtentReader};
use crate::sidechannel::{SideChannel, SideChannelOp, SideChannelRequest};
use crate::source::RemoteSource;
use crate::store::LocalStore;
use anyhow::anyhow;
use bitflags::bitflags;
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReadFlags: u32 {
        /// Issued by the memory manager to fill pages.
        const PAGING_IO = 1;
        /// Bypass the cache manager.
        const NON_CACHED = 1 << 1;
        /// The handle tracks a current position.
        const SYNCHRONOUS_IO = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub offset: u64,
    pub len: usize,
    pub flags: ReadFlags,
    /// Byte-range lock owner the read is issued on behalf of.
    pub owner: u64,
}

impl ReadRequest {
    pub fn new(offset: u64, len: usize) -> Self {
        Self {
            offset,
            len,
            flags: ReadFlags::empty(),
            owner: 0,
        }
    }

    pub fn flags(self, flags: ReadFlags) -> Self {
        Self {
            flags: self.flags | flags,
            ..self
        }
    }

    pub fn paging(self) -> Self {
        self.flags(ReadFlags::PAGING_IO)
    }

    pub fn non_cached(self) -> Self {
        self.flags(ReadFlags::NON_CACHED)
    }

    pub fn synchronous_io(self) -> Self {
        self.flags(ReadFlags::SYNCHRONOUS_IO)
    }

    pub fn owner(self, owner: u64) -> Self {
        Self { owner, ..self }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadReply {
    pub data: Bytes,
}

impl ReadReply {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn transferred(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug)]
pub enum ReadOutcome {
    Complete(ReadReply),
    /// Issued; the continuation passed to [`ReadDispatcher::read_async`] gets the result.
    Pending,
}

pub type ReadContinuation = Box<dyn FnOnce(Result<ReadReply>) + Send + 'static>;

pub struct ReadDispatcher {
    config: Config,
    read_config: Arc<ReadConfig>,
    source: Arc<dyn RemoteSource>,
    store: Arc<dyn LocalStore>,
    engine: Arc<PopulationEngine>,
    reader: Arc<ExtentReader>,
    cache: Arc<dyn CacheManager>,
    side_channel: Option<Arc<dyn SideChannel>>,
    files: DashMap<u64, Arc<FileState>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl ReadDispatcher {
    pub fn new(
        config: Config,
        source: Arc<dyn RemoteSource>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        let read_config = Arc::new(config.read.clone());
        let engine = Arc::new(PopulationEngine::new(
            Arc::clone(&source),
            Arc::clone(&store),
            &read_config,
        ));
        let reader = Arc::new(ExtentReader::new(Arc::clone(&store), Arc::clone(&read_config)));
        let cache: Arc<dyn CacheManager> = if config.cache.enabled {
            Arc::new(PageCache::new(config.cache.capacity))
        } else {
            Arc::new(DirectCache::new())
        };
        Self {
            config,
            read_config,
            source,
            store,
            engine,
            reader,
            cache,
            side_channel: None,
            files: DashMap::new(),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn with_side_channel(self, side_channel: Arc<dyn SideChannel>) -> Self {
        Self {
            side_channel: Some(side_channel),
            ..self
        }
    }

    pub fn with_cache_manager(self, cache: Arc<dyn CacheManager>) -> Self {
        Self { cache, ..self }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn reader(&self) -> &Arc<ExtentReader> {
        &self.reader
    }

    pub fn cache(&self) -> &Arc<dyn CacheManager> {
        &self.cache
    }

    pub fn file(&self, id: u64) -> Option<Arc<FileState>> {
        self.files.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    fn register(
        &self,
        key: &str,
        build: impl FnOnce(u64, Arc<ExtentMap>) -> FileState,
    ) -> Arc<FileState> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let map = Arc::new(ExtentMap::new(key, Arc::clone(&self.engine)));
        let file = Arc::new(build(id, map));
        self.files.insert(id, Arc::clone(&file));
        debug!(file = id, key, kind = ?file.kind(), size = file.size(), "opened");
        file
    }

    /// Opens remote object `key`, taking its size from the remote source.
    pub async fn open(&self, key: &str) -> Result<Arc<FileState>> {
        let size = self.source.size(key).await.map_err(ReadError::io)?;
        Ok(self.open_node(key, NodeKind::File, size))
    }

    pub fn open_node(&self, key: &str, kind: NodeKind, size: u64) -> Arc<FileState> {
        self.register(key, |id, map| FileState::new(id, kind, size, map))
    }

    /// Opens a pseudo-file whose reads go to the side channel on behalf of `parent`.
    pub fn open_pseudo(
        &self,
        name: &str,
        parent: FileIdentity,
        op: SideChannelOp,
    ) -> Arc<FileState> {
        self.register(name, |id, map| FileState::pseudo(id, parent, op, map))
    }

    /// Final close: tears down the cache mapping and drops the file's extents.
    pub fn close(&self, file: &FileState) {
        self.files.remove(&file.id());
        if file.clear_cache_mapping() {
            self.cache.uninit_mapping(file);
        }
        file.unlock_all_owners();
        file.extents().invalidate();
        debug!(file = file.id(), "closed");
    }

    /// Drops everything cached for `file` after its remote contents changed. The file
    /// stays open; later reads fetch again.
    pub async fn invalidate_file(&self, file: &FileState, new_size: Option<u64>) {
        let _locks = file.lock_exclusive().await;
        if file.clear_cache_mapping() {
            self.cache.uninit_mapping(file);
        }
        file.extents().invalidate();
        if let Some(size) = new_size {
            file.store_size(size);
        }
        file.clear_invalid();
        debug!(file = file.id(), size = file.size(), "invalidated");
    }

    /// Rejects every later read with `ServiceUnavailable`.
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!(open_files = self.files.len(), "read dispatcher shutting down");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Reads and waits for the result.
    pub async fn read(&self, file: &Arc<FileState>, req: ReadRequest) -> Result<ReadReply> {
        match self.dispatch(file, req, None).await? {
            ReadOutcome::Complete(reply) => Ok(reply),
            ReadOutcome::Pending => Err(ReadError::io(anyhow!("synchronous read left pending"))),
        }
    }

    /// Reads without waiting for the extent I/O. `continuation` is called exactly once
    /// if and only if this returns `Ok(ReadOutcome::Pending)`; every other outcome is
    /// returned directly.
    pub async fn read_async(
        &self,
        file: &Arc<FileState>,
        req: ReadRequest,
        continuation: ReadContinuation,
    ) -> Result<ReadOutcome> {
        self.dispatch(file, req, Some(continuation)).await
    }

    #[tracing::instrument(level = "debug", skip(self, file, continuation), fields(file = file.id()))]
    async fn dispatch(
        &self,
        file: &Arc<FileState>,
        req: ReadRequest,
        continuation: Option<ReadContinuation>,
    ) -> Result<ReadOutcome> {
        if self.is_shutting_down() {
            return Err(ReadError::ServiceUnavailable("shutting down"));
        }
        file.check_usable()?;
        match file.kind() {
            NodeKind::Directory => return Err(ReadError::InvalidState(FileCondition::NotAFile)),
            NodeKind::PseudoFile => {
                return self.side_channel_read(file, req).await.map(ReadOutcome::Complete);
            }
            NodeKind::File => {}
        }
        if !self.store.is_available() {
            return Err(ReadError::ServiceUnavailable("local cache not ready"));
        }
        if req.len == 0 {
            return Ok(ReadOutcome::Complete(ReadReply::default()));
        }
        if req.len as u64 > self.read_config.max_io {
            return Err(ReadError::InvalidRange(format!(
                "read of {} bytes exceeds the {} byte limit",
                req.len, self.read_config.max_io
            )));
        }

        let paging = req.flags.contains(ReadFlags::PAGING_IO);
        let guard = file.read_lock(paging).await;
        if !paging {
            if let Err(e) = file.check_read_access(req.owner, req.offset, req.len as u64) {
                debug!(owner = req.owner, offset = req.offset, "byte-range lock conflict");
                return Err(e);
            }
        }
        // Flags may have changed while we waited for the lock.
        file.check_usable()?;

        let size = file.size();
        if req.offset >= size {
            return Err(ReadError::EndOfFile {
                offset: req.offset,
                size,
            });
        }
        let len = req.len.min((size - req.offset) as usize);
        if len < req.len {
            trace!(requested = req.len, len, size, "truncated at end of file");
        }
        if !paging {
            file.record_reader(req.owner);
        }

        let non_cached = paging
            || (req.flags.contains(ReadFlags::NON_CACHED) && !file.is_cache_mapped());
        if !non_cached {
            let reply = self.cached_read(file, req, len).await?;
            drop(guard);
            return Ok(ReadOutcome::Complete(reply));
        }

        match continuation {
            None => {
                let data = self.reader.read(file, req.offset, len).await?;
                drop(guard);
                if !paging && req.flags.contains(ReadFlags::SYNCHRONOUS_IO) {
                    file.set_position(req.offset + req.len as u64);
                }
                Ok(ReadOutcome::Complete(ReadReply::new(data)))
            }
            Some(continuation) => {
                let completion = Completion::Continuation(Box::new(move |result| {
                    drop(guard);
                    continuation(result.map(ReadReply::new));
                }));
                self.reader
                    .start_read(file, req.offset, len, completion)
                    .await?;
                Ok(ReadOutcome::Pending)
            }
        }
    }

    async fn cached_read(
        &self,
        file: &Arc<FileState>,
        req: ReadRequest,
        len: usize,
    ) -> Result<ReadReply> {
        let size = file.size();
        // Start pulling the extents in while the cache manager gets going.
        if let Err(e) = file
            .extents()
            .request_population_async(req.offset, len as u64, size)
            .await
        {
            debug!(error = %e, "extent prefetch request failed");
        }

        let this = self;
        file.ensure_cache_mapping(move || async move {
            let sizes = CacheFileSizes::for_size(file.size(), this.read_config.extent_size);
            let callbacks: Arc<dyn CacheCallbacks> = this.reader.clone();
            let granularity = this.config.cache.read_ahead_granularity;
            this.cache
                .init_mapping(file, sizes, callbacks, granularity)
                .await
        })
        .await?;

        let data = AssertUnwindSafe(self.cache.copy_read(file, req.offset, len))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ReadError::io(anyhow!("fault while copying from the cache"))))
            .inspect_err(|e| {
                warn!(file = file.id(), offset = req.offset, error = %e, "cached read failed")
            })?;

        if req.flags.contains(ReadFlags::SYNCHRONOUS_IO) {
            file.set_position(req.offset + data.len() as u64);
        }
        Ok(ReadReply::new(data))
    }

    async fn side_channel_read(&self, file: &FileState, req: ReadRequest) -> Result<ReadReply> {
        let channel = self
            .side_channel
            .as_ref()
            .ok_or(ReadError::ServiceUnavailable("side channel not connected"))?;
        let request = SideChannelRequest {
            opcode: file.side_channel_op().unwrap_or(SideChannelOp::ControlRead),
            parent: file.parent().unwrap_or_default(),
            request_id: file.next_request_id(),
            offset: req.offset,
            payload: Bytes::new(),
            length: req.len,
        };
        trace!(file = file.id(), request_id = request.request_id, "side channel read");
        let response = channel.request(request).await.map_err(ReadError::io)?;
        response.into_data(req.offset).map(ReadReply::new)
    }
}
