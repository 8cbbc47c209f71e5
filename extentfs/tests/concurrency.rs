use async_trait::async_trait;
use extentfs::config::{Config, ReadConfig};
use extentfs::source::InMemorySource;
use extentfs::store::{InMemoryLocalStore, LocalStore};
use extentfs::{ReadDispatcher, ReadRequest};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

const KEY: &str = "shared.bin";

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 13 + i / 509) % 256) as u8).collect()
}

/// Local store that knows which slots are live and flags any read of storage that has
/// already been handed back, and any double release.
#[derive(Default)]
struct TrackingStore {
    inner: InMemoryLocalStore,
    live: Mutex<BTreeMap<u64, u64>>,
    stale_reads: AtomicUsize,
    double_releases: AtomicUsize,
}

impl TrackingStore {
    fn covered(&self, offset: u64, len: u64) -> bool {
        let live = self.live.lock();
        match live.range(..=offset).next_back() {
            Some((&start, &slot_len)) => offset + len <= start + slot_len,
            None => false,
        }
    }

    fn live_bytes(&self) -> u64 {
        self.live.lock().values().sum()
    }
}

#[async_trait]
impl LocalStore for TrackingStore {
    fn allocate(&self, len: u64) -> anyhow::Result<u64> {
        let offset = self.inner.allocate(len)?;
        self.live.lock().insert(offset, len);
        Ok(offset)
    }

    fn release(&self, offset: u64, len: u64) {
        if self.live.lock().remove(&offset).is_none() {
            self.double_releases.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.release(offset, len);
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        self.inner.write_at(offset, data).await
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize> {
        if !self.covered(offset, buf.len() as u64) {
            self.stale_reads.fetch_add(1, Ordering::SeqCst);
        }
        // Give evictors a chance to run while the read is in flight.
        tokio::task::yield_now().await;
        let n = self.inner.read_at(offset, buf).await?;
        if !self.covered(offset, buf.len() as u64) {
            self.stale_reads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(n)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_unmapped_reads_all_see_correct_data() {
    const SIZE: usize = 256 * 1024;
    let data = Arc::new(pattern(SIZE));
    let source = Arc::new(InMemorySource::with_latency(Duration::from_millis(5)));
    source.insert(KEY, data.as_ref().clone());
    let store = Arc::new(InMemoryLocalStore::new());
    let config = Config::default().read_config(
        ReadConfig::new()
            .extent_size(16 * 1024)
            .sync_fetch_limit(32 * 1024),
    );
    let dispatcher = Arc::new(ReadDispatcher::new(config, source.clone(), store));
    let file = dispatcher.open(KEY).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8u64 {
        let dispatcher = dispatcher.clone();
        let file = file.clone();
        let data = data.clone();
        tasks.push(tokio::spawn(async move {
            let offset = i * 16_000;
            let len = 150_000usize;
            let req = ReadRequest::new(offset, len).non_cached();
            let reply = dispatcher.read(&file, req).await.unwrap();
            let end = (offset as usize + len).min(SIZE);
            assert_eq!(&reply.data[..], &data[offset as usize..end]);
        }));
    }
    tokio::time::timeout(Duration::from_secs(30), async {
        for task in tasks {
            task.await.unwrap();
        }
    })
    .await
    .expect("readers deadlocked");

    // Each extent was fetched once, no matter how many readers wanted it.
    let fetched: u64 = source.fetch_log().iter().map(|(_, _, len)| len).sum();
    assert_eq!(fetched, SIZE as u64);
    assert!(file.extents().extents().iter().all(|&(_, _, refs)| refs == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pinned_extents_survive_randomized_eviction() {
    const SIZE: usize = 128 * 1024;
    let data = Arc::new(pattern(SIZE));
    let source = Arc::new(InMemorySource::new());
    source.insert(KEY, data.as_ref().clone());
    let store = Arc::new(TrackingStore::default());
    let config = Config::default().read_config(ReadConfig::new().extent_size(4096));
    let dispatcher = Arc::new(ReadDispatcher::new(config, source, store.clone()));
    let file = dispatcher.open(KEY).await.unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for seed in 0..6u64 {
        let dispatcher = dispatcher.clone();
        let file = file.clone();
        let data = data.clone();
        readers.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..200 {
                let offset = rng.random_range(0..SIZE as u64);
                let len = rng.random_range(1..20_000usize);
                let req = ReadRequest::new(offset, len).non_cached();
                let reply = dispatcher.read(&file, req).await.unwrap();
                let end = (offset as usize + len).min(SIZE);
                assert_eq!(&reply.data[..], &data[offset as usize..end]);
            }
        }));
    }

    let evictor = {
        let file = file.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(99);
            let mut rounds = 0u64;
            while !stop.load(Ordering::SeqCst) {
                if rng.random_range(0..20) == 0 {
                    file.extents().invalidate();
                } else {
                    let offset = rng.random_range(0..SIZE as u64);
                    file.extents().evict(offset, rng.random_range(1..32_768));
                }
                rounds += 1;
                // Bursts of churn, with pauses that let readers make progress.
                if rounds % 8 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                } else {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    tokio::time::timeout(Duration::from_secs(60), async {
        for reader in readers {
            reader.await.unwrap();
        }
    })
    .await
    .expect("readers stalled");
    stop.store(true, Ordering::SeqCst);
    evictor.await.unwrap();

    assert_eq!(store.stale_reads.load(Ordering::SeqCst), 0);
    assert_eq!(store.double_releases.load(Ordering::SeqCst), 0);

    dispatcher.close(&file);
    assert_eq!(store.live_bytes(), 0);
    assert_eq!(store.double_releases.load(Ordering::SeqCst), 0);
}
