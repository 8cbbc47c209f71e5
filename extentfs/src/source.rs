//! Remote extent sources: where missing file ranges are fetched from.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetches up to `len` bytes of object `key` starting at `offset`. A shorter result
    /// means the object ends inside the range.
    async fn fetch(&self, key: &str, offset: u64, len: u64) -> anyhow::Result<Bytes>;

    /// Current length of object `key`.
    async fn size(&self, key: &str) -> anyhow::Result<u64>;
}

/// Objects kept in memory. Records every fetch so tests can assert what was pulled.
#[derive(Default)]
pub struct InMemorySource {
    objects: RwLock<HashMap<String, Bytes>>,
    failing: RwLock<HashSet<String>>,
    fetches: Mutex<Vec<(String, u64, u64)>>,
    fetched_bytes: AtomicU64,
    latency: Option<Duration>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every fetch, which widens race windows in concurrency tests.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.write().insert(key.into(), data.into());
    }

    /// Makes every later fetch of `key` fail (or succeed again).
    pub fn set_failing(&self, key: &str, failing: bool) {
        let mut set = self.failing.write();
        if failing {
            set.insert(key.to_string());
        } else {
            set.remove(key);
        }
    }

    pub fn fetch_log(&self) -> Vec<(String, u64, u64)> {
        self.fetches.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }

    pub fn fetched_bytes(&self) -> u64 {
        self.fetched_bytes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RemoteSource for InMemorySource {
    async fn fetch(&self, key: &str, offset: u64, len: u64) -> anyhow::Result<Bytes> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.fetches.lock().push((key.to_string(), offset, len));
        if self.failing.read().contains(key) {
            return Err(anyhow!("fetch of {key} at {offset} failed"));
        }
        let data = self
            .objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("object {key} not found"))?;
        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(len) as usize).min(data.len());
        self.fetched_bytes
            .fetch_add((end - start) as u64, Ordering::Relaxed);
        Ok(data.slice(start..end))
    }

    async fn size(&self, key: &str) -> anyhow::Result<u64> {
        self.objects
            .read()
            .get(key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| anyhow!("object {key} not found"))
    }
}

/// Objects are plain files under a root directory.
pub struct LocalDirSource {
    root: PathBuf,
}

impl LocalDirSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl RemoteSource for LocalDirSource {
    async fn fetch(&self, key: &str, offset: u64, len: u64) -> anyhow::Result<Bytes> {
        let path = self.path_for(key);
        let mut f = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("open {}", path.display()))?;
        f.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len as usize);
        f.take(len).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn size(&self, key: &str) -> anyhow::Result<u64> {
        let path = self.path_for(key);
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        Ok(meta.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fetch_clamps_to_object() {
        let src = InMemorySource::new();
        src.insert("a", vec![7u8; 100]);
        let got = src.fetch("a", 90, 50).await.unwrap();
        assert_eq!(got.len(), 10);
        assert_eq!(src.fetch_log(), vec![("a".to_string(), 90, 50)]);
        assert_eq!(src.fetched_bytes(), 10);

        src.set_failing("a", true);
        assert!(src.fetch("a", 0, 1).await.is_err());
        assert!(src.fetch("missing", 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_local_dir_fetch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("vol")).unwrap();
        std::fs::write(dir.path().join("vol/data"), b"0123456789").unwrap();
        let src = LocalDirSource::new(dir.path());
        assert_eq!(src.size("/vol/data").await.unwrap(), 10);
        let got = src.fetch("vol/data", 3, 4).await.unwrap();
        assert_eq!(&got[..], b"3456");
        let tail = src.fetch("vol/data", 8, 100).await.unwrap();
        assert_eq!(&tail[..], b"89");
    }
}
