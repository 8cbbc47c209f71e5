//! Backing local store: the block-addressable space extents live in.
//!
//! Extents own a slot of the store from population until eviction. I/O runs address
//! the store by `(storage_offset, len)` only.

use anyhow::{Context, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Reserves `len` bytes of storage and returns their offset.
    fn allocate(&self, len: u64) -> anyhow::Result<u64>;

    /// Returns a slot obtained from [`LocalStore::allocate`].
    fn release(&self, offset: u64, len: u64);

    async fn write_at(&self, offset: u64, data: &[u8]) -> anyhow::Result<()>;

    /// Reads into `buf` starting at `offset`; returns the number of bytes read, which
    /// is short only when the store ends early.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize>;

    /// False while the store cannot serve reads (not mounted yet, shutting down).
    fn is_available(&self) -> bool {
        true
    }
}

/// Bump allocator with exact-size reuse of released slots.
///
/// Extents are almost always `extent_size` long, so reusing only exact matches keeps
/// fragmentation low without a real free-space tree.
#[derive(Debug, Default)]
pub struct SlotAllocator {
    inner: Mutex<SlotState>,
    capacity: Option<u64>,
}

#[derive(Debug, Default)]
struct SlotState {
    next: u64,
    free: HashMap<u64, Vec<u64>>, // len -> offsets
    in_use: u64,
}

impl SlotAllocator {
    pub fn new(capacity: Option<u64>) -> Self {
        Self {
            inner: Mutex::new(SlotState::default()),
            capacity,
        }
    }

    pub fn allocate(&self, len: u64) -> anyhow::Result<u64> {
        if len == 0 {
            bail!("zero-length allocation");
        }
        let mut state = self.inner.lock();
        if let Some(offset) = state.free.get_mut(&len).and_then(|slots| slots.pop()) {
            state.in_use += len;
            return Ok(offset);
        }
        let end = state
            .next
            .checked_add(len)
            .context("local store address space exhausted")?;
        if self.capacity.is_some_and(|cap| end > cap) {
            bail!(
                "local store full: {} bytes in use, requested {len}",
                state.in_use
            );
        }
        let offset = state.next;
        state.next = end;
        state.in_use += len;
        Ok(offset)
    }

    pub fn release(&self, offset: u64, len: u64) {
        let mut state = self.inner.lock();
        state.in_use = state.in_use.saturating_sub(len);
        state.free.entry(len).or_default().push(offset);
    }

    pub fn in_use(&self) -> u64 {
        self.inner.lock().in_use
    }
}

/// In-memory store, for tests and diskless setups.
#[derive(Debug, Default)]
pub struct InMemoryLocalStore {
    data: tokio::sync::RwLock<Vec<u8>>,
    slots: SlotAllocator,
    unavailable: AtomicBool,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            slots: SlotAllocator::new(Some(capacity)),
            ..Self::default()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.slots.in_use()
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    fn allocate(&self, len: u64) -> anyhow::Result<u64> {
        self.slots.allocate(len)
    }

    fn release(&self, offset: u64, len: u64) {
        self.slots.release(offset, len)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let start = usize::try_from(offset).context("offset exceeds address space")?;
        let end = start + data.len();
        let mut buf = self.data.write().await;
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn read_at(&self, offset: u64, out: &mut [u8]) -> anyhow::Result<usize> {
        let start = usize::try_from(offset).context("offset exceeds address space")?;
        let buf = self.data.read().await;
        if start >= buf.len() {
            return Ok(0);
        }
        let n = out.len().min(buf.len() - start);
        out[..n].copy_from_slice(&buf[start..start + n]);
        Ok(n)
    }

    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::Acquire)
    }
}

/// Store backed by one sparse cache file.
pub struct FileLocalStore {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    slots: SlotAllocator,
}

impl FileLocalStore {
    /// Creates (or truncates) the cache file at `path`.
    pub async fn create<P: AsRef<Path>>(path: P, capacity: Option<u64>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create cache dir {}", dir.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .with_context(|| format!("open cache file {}", path.display()))?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            slots: SlotAllocator::new(capacity),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LocalStore for FileLocalStore {
    fn allocate(&self, len: u64) -> anyhow::Result<u64> {
        self.slots.allocate(len)
    }

    fn release(&self, offset: u64, len: u64) {
        self.slots.release(offset, len)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut f = self.file.lock().await;
        f.seek(SeekFrom::Start(offset)).await?;
        f.write_all(data).await?;
        f.flush().await?;
        Ok(())
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize> {
        let mut f = self.file.lock().await;
        f.seek(SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = f.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}
