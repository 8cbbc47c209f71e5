//! Per-open-file state shared by every reader of the file.

use crate::error::{FileCondition, ReadError, Result};
use crate::extent::ExtentMap;
use crate::sidechannel::SideChannelOp;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::{OwnedRwLockReadGuard, RwLock, RwLockWriteGuard};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileFlags: u32 {
        const DELETED = 1;
        const INVALID = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    /// Served by the side channel instead of extents.
    PseudoFile,
    Directory,
}

/// Identity of a node on the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileIdentity {
    pub volume: u64,
    pub vnode: u64,
    pub unique: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRangeLock {
    pub offset: u64,
    pub len: u64,
    pub owner: u64,
    pub exclusive: bool,
}

impl ByteRangeLock {
    fn overlaps(&self, offset: u64, len: u64) -> bool {
        self.offset < offset.saturating_add(len) && offset < self.offset.saturating_add(self.len)
    }
}

#[derive(Debug)]
struct PseudoFile {
    parent: FileIdentity,
    op: SideChannelOp,
    next_request: AtomicU64,
}

pub struct FileState {
    id: u64,
    key: String,
    kind: NodeKind,
    size: AtomicU64,
    flags: AtomicU32,
    position: AtomicU64,
    last_reader: AtomicU64,
    // Held shared by normal reads, exclusive by size changes.
    main_lock: Arc<RwLock<()>>,
    // Held shared by paging reads instead of the main lock.
    paging_lock: Arc<RwLock<()>>,
    extents: Arc<ExtentMap>,
    range_locks: Mutex<Vec<ByteRangeLock>>,
    cache_mapped: AtomicBool,
    cache_init: tokio::sync::Mutex<()>,
    pseudo: Option<PseudoFile>,
}

/// Guard returned by [`FileState::lock_exclusive`].
pub struct ExclusiveGuard<'a> {
    _main: RwLockWriteGuard<'a, ()>,
    _paging: RwLockWriteGuard<'a, ()>,
}

impl FileState {
    pub fn new(id: u64, kind: NodeKind, size: u64, extents: Arc<ExtentMap>) -> Self {
        Self {
            id,
            key: extents.key().to_string(),
            kind,
            size: AtomicU64::new(size),
            flags: AtomicU32::new(0),
            position: AtomicU64::new(0),
            last_reader: AtomicU64::new(0),
            main_lock: Arc::new(RwLock::new(())),
            paging_lock: Arc::new(RwLock::new(())),
            extents,
            range_locks: Mutex::new(Vec::new()),
            cache_mapped: AtomicBool::new(false),
            cache_init: tokio::sync::Mutex::new(()),
            pseudo: None,
        }
    }

    /// A pseudo-file whose reads are answered by the side channel on behalf of `parent`.
    pub fn pseudo(
        id: u64,
        parent: FileIdentity,
        op: SideChannelOp,
        extents: Arc<ExtentMap>,
    ) -> Self {
        Self {
            pseudo: Some(PseudoFile {
                parent,
                op,
                next_request: AtomicU64::new(1),
            }),
            ..Self::new(id, NodeKind::PseudoFile, 0, extents)
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn extents(&self) -> &Arc<ExtentMap> {
        &self.extents
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Changes the file size, serialized against in-progress reads.
    pub async fn set_size(&self, size: u64) {
        let _locks = self.lock_exclusive().await;
        let old = self.size.swap(size, Ordering::AcqRel);
        if size < old {
            self.extents.evict(size, old - size);
        }
    }

    // Callers already hold both locks through `lock_exclusive`.
    pub(crate) fn store_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn flags(&self) -> FileFlags {
        FileFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn mark_deleted(&self) {
        self.flags.fetch_or(FileFlags::DELETED.bits(), Ordering::AcqRel);
    }

    pub fn mark_invalid(&self) {
        self.flags.fetch_or(FileFlags::INVALID.bits(), Ordering::AcqRel);
    }

    pub fn clear_invalid(&self) {
        self.flags.fetch_and(!FileFlags::INVALID.bits(), Ordering::AcqRel);
    }

    /// Fails if the file is deleted or invalidated.
    pub fn check_usable(&self) -> Result<()> {
        let flags = self.flags();
        if flags.contains(FileFlags::DELETED) {
            return Err(ReadError::InvalidState(FileCondition::Deleted));
        }
        if flags.contains(FileFlags::INVALID) {
            return Err(ReadError::InvalidState(FileCondition::Invalid));
        }
        Ok(())
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    pub fn last_reader(&self) -> u64 {
        self.last_reader.load(Ordering::Relaxed)
    }

    pub(crate) fn record_reader(&self, owner: u64) {
        self.last_reader.store(owner, Ordering::Relaxed);
    }

    /// Shared main or paging lock. The guard is owned so an asynchronous read can keep
    /// it until its gather completes.
    pub(crate) async fn read_lock(&self, paging: bool) -> OwnedRwLockReadGuard<()> {
        let lock = if paging {
            &self.paging_lock
        } else {
            &self.main_lock
        };
        Arc::clone(lock).read_owned().await
    }

    /// Main and paging locks held exclusively, for metadata changes that must not race
    /// any read. Taken in the same order as [`FileState::set_size`].
    pub async fn lock_exclusive(&self) -> ExclusiveGuard<'_> {
        let main = self.main_lock.write().await;
        let paging = self.paging_lock.write().await;
        ExclusiveGuard {
            _main: main,
            _paging: paging,
        }
    }

    /// Takes a byte-range lock for `owner`. Overlapping locks of other owners conflict
    /// unless both are shared.
    pub fn lock_range(&self, owner: u64, offset: u64, len: u64, exclusive: bool) -> Result<()> {
        let mut locks = self.range_locks.lock();
        let conflict = locks.iter().any(|l| {
            l.owner != owner && (l.exclusive || exclusive) && l.overlaps(offset, len)
        });
        if conflict {
            return Err(ReadError::LockConflict { offset, len });
        }
        locks.push(ByteRangeLock {
            offset,
            len,
            owner,
            exclusive,
        });
        Ok(())
    }

    pub fn unlock_range(&self, owner: u64, offset: u64, len: u64) -> bool {
        let mut locks = self.range_locks.lock();
        match locks
            .iter()
            .position(|l| l.owner == owner && l.offset == offset && l.len == len)
        {
            Some(idx) => {
                locks.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn unlock_all(&self, owner: u64) {
        self.range_locks.lock().retain(|l| l.owner != owner);
    }

    pub(crate) fn unlock_all_owners(&self) {
        self.range_locks.lock().clear();
    }

    /// Fails if another owner holds an exclusive lock overlapping the range.
    pub fn check_read_access(&self, owner: u64, offset: u64, len: u64) -> Result<()> {
        let locks = self.range_locks.lock();
        if locks
            .iter()
            .any(|l| l.owner != owner && l.exclusive && l.overlaps(offset, len))
        {
            return Err(ReadError::LockConflict { offset, len });
        }
        Ok(())
    }

    pub fn is_cache_mapped(&self) -> bool {
        self.cache_mapped.load(Ordering::Acquire)
    }

    /// Runs `init` once, on the first cached read of the file.
    pub(crate) async fn ensure_cache_mapping<F, Fut>(&self, init: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.is_cache_mapped() {
            return Ok(());
        }
        let _guard = self.cache_init.lock().await;
        if self.is_cache_mapped() {
            return Ok(());
        }
        init().await?;
        self.cache_mapped.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn clear_cache_mapping(&self) -> bool {
        self.cache_mapped.swap(false, Ordering::AcqRel)
    }

    pub fn parent(&self) -> Option<FileIdentity> {
        self.pseudo.as_ref().map(|p| p.parent)
    }

    pub fn side_channel_op(&self) -> Option<SideChannelOp> {
        self.pseudo.as_ref().map(|p| p.op)
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.pseudo
            .as_ref()
            .map(|p| p.next_request.fetch_add(1, Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileState")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("size", &self.size())
            .field("flags", &self.flags())
            .finish()
    }
}
