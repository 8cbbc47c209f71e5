//! Fan-out/fan-in completion for the runs of one logical read.
//!
//! The pending counter starts at `1 + runs` before any run is issued. Each run
//! decrements it when it completes and the issuing side decrements it once more after
//! the last run went out, so the count cannot reach zero while issuing is still in
//! progress. Whoever brings it to zero finalizes: the first failure observed wins,
//! otherwise the run segments are stitched back into one buffer, and the result is
//! either sent to a waiting reader or handed to the caller's continuation.

use super::run::{IoRun, IoRuns};
use crate::error::{ReadError, Result};
use crate::extent::ExtentRefs;
use crate::store::LocalStore;
use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub type GatherContinuation = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;

/// How the logical request learns about its result.
pub enum Completion {
    /// A reader is blocked on the receiving half.
    Signal(oneshot::Sender<Result<Bytes>>),
    /// The request completes from whichever context finalizes it.
    Continuation(GatherContinuation),
}

impl Completion {
    fn deliver(self, result: Result<Bytes>) {
        match self {
            Completion::Signal(tx) => {
                // The reader may have given up waiting; nothing left to do then.
                let _ = tx.send(result);
            }
            Completion::Continuation(f) => f(result),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherState {
    Issuing = 0,
    InFlight = 1,
    Finalizing = 2,
    Done = 3,
}

impl GatherState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => GatherState::Issuing,
            1 => GatherState::InFlight,
            2 => GatherState::Finalizing,
            _ => GatherState::Done,
        }
    }
}

pub struct GatherIo {
    pending: AtomicUsize,
    state: AtomicU8,
    status: Mutex<Option<ReadError>>,
    segments: Mutex<Vec<Option<BytesMut>>>,
    refs: Mutex<Option<ExtentRefs>>,
    completion: Mutex<Option<Completion>>,
}

impl GatherIo {
    pub(crate) fn new(
        runs: usize,
        refs: Option<ExtentRefs>,
        completion: Completion,
    ) -> Arc<Self> {
        let mut segments = Vec::with_capacity(runs);
        segments.resize_with(runs, || None);
        Arc::new(Self {
            pending: AtomicUsize::new(runs + 1),
            state: AtomicU8::new(GatherState::Issuing as u8),
            status: Mutex::new(None),
            segments: Mutex::new(segments),
            refs: Mutex::new(refs),
            completion: Mutex::new(Some(completion)),
        })
    }

    pub fn state(&self) -> GatherState {
        GatherState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Records the outcome of run `index`; its buffer segment is handed back either way.
    pub(crate) fn complete_run(&self, index: usize, segment: BytesMut, result: Result<()>) {
        if let Some(slot) = self.segments.lock().get_mut(index) {
            *slot = Some(segment);
        }
        if let Err(e) = result {
            trace!(index, error = %e, "i/o run failed");
            self.status.lock().get_or_insert(e);
        }
        self.decrement();
    }

    /// The issuing side's own decrement, after the last run was submitted.
    pub(crate) fn finish_issuing(&self) {
        let _ = self.state.compare_exchange(
            GatherState::Issuing as u8,
            GatherState::InFlight as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.decrement();
    }

    fn decrement(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        self.state
            .store(GatherState::Finalizing as u8, Ordering::Release);
        let result = match self.status.lock().take() {
            Some(err) => Err(err),
            None => self.assemble(),
        };
        // Unpin before anyone can observe the result.
        drop(self.refs.lock().take());
        let completion = self.completion.lock().take();
        match &result {
            Ok(data) => debug!(bytes = data.len(), "gather i/o complete"),
            Err(e) => debug!(error = %e, "gather i/o failed"),
        }
        if let Some(completion) = completion {
            completion.deliver(result);
        }
        self.state.store(GatherState::Done as u8, Ordering::Release);
    }

    fn assemble(&self) -> Result<Bytes> {
        let segments = std::mem::take(&mut *self.segments.lock());
        let mut out = BytesMut::new();
        for (index, seg) in segments.into_iter().enumerate() {
            let seg = seg.ok_or_else(|| ReadError::io(anyhow!("i/o run {index} left no data")))?;
            // Segments are split off one buffer in order, so this only re-joins them.
            out.unsplit(seg);
        }
        Ok(out.freeze())
    }
}

/// Issues every run of one read against `store` and returns without waiting.
///
/// `refs` keeps the backing extents pinned until the request finalizes. The request
/// belongs to the completion path once this returns.
pub(crate) fn start_ios(
    store: Arc<dyn LocalStore>,
    runs: IoRuns,
    len: usize,
    refs: ExtentRefs,
    completion: Completion,
) {
    let gather = GatherIo::new(runs.len(), Some(refs), completion);
    let mut buf = BytesMut::zeroed(len);
    trace!(runs = runs.len(), len, "issuing i/o runs");
    for (index, run) in runs.into_iter().enumerate() {
        let segment = buf.split_to(run.len.min(buf.len()));
        let store = Arc::clone(&store);
        let gather = Arc::clone(&gather);
        tokio::spawn(async move {
            let mut segment = segment;
            let result = AssertUnwindSafe(read_run(store.as_ref(), run, &mut segment))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(ReadError::io(anyhow!(
                        "i/o run at storage offset {} panicked: {}",
                        run.storage_offset,
                        panic_message(panic.as_ref())
                    )))
                });
            gather.complete_run(index, segment, result);
        });
    }
    gather.finish_issuing();
}

async fn read_run(store: &dyn LocalStore, run: IoRun, segment: &mut BytesMut) -> Result<()> {
    let n = store
        .read_at(run.storage_offset, &mut segment[..])
        .await
        .map_err(ReadError::io)?;
    if n < segment.len() {
        return Err(ReadError::io(anyhow!(
            "short read from local storage at {}: {n} of {} bytes",
            run.storage_offset,
            segment.len()
        )));
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every ordering of `0..n`, by Heap's algorithm.
    fn permutations(n: usize) -> Vec<Vec<usize>> {
        fn heap(k: usize, items: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
            if k <= 1 {
                out.push(items.clone());
                return;
            }
            for i in 0..k - 1 {
                heap(k - 1, items, out);
                if k % 2 == 0 {
                    items.swap(i, k - 1);
                } else {
                    items.swap(0, k - 1);
                }
            }
            heap(k - 1, items, out);
        }
        let mut items: Vec<usize> = (0..n).collect();
        let mut out = Vec::new();
        heap(n, &mut items, &mut out);
        out
    }

    type Delivered = Arc<Mutex<Vec<Result<Bytes>>>>;

    fn counting_gather(runs: usize) -> (Arc<GatherIo>, Delivered) {
        let delivered: Delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let gather = GatherIo::new(
            runs,
            None,
            Completion::Continuation(Box::new(move |res| sink.lock().push(res))),
        );
        (gather, delivered)
    }

    #[test]
    fn test_permutations_helper() {
        let perms = permutations(4);
        assert_eq!(perms.len(), 24);
        let mut dedup = perms.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 24);
    }

    #[test]
    fn test_finalizes_once_in_every_completion_order() {
        for runs in 0..=4usize {
            let engine_event = runs;
            for order in permutations(runs + 1) {
                let (gather, delivered) = counting_gather(runs);
                for (step, &event) in order.iter().enumerate() {
                    assert_eq!(delivered.lock().len(), 0, "finalized early: {order:?}");
                    assert_ne!(gather.state(), GatherState::Done);
                    if event == engine_event {
                        gather.finish_issuing();
                    } else {
                        let seg = BytesMut::from(&[event as u8; 3][..]);
                        gather.complete_run(event, seg, Ok(()));
                    }
                    assert_eq!(gather.pending(), runs - step);
                }
                let delivered = delivered.lock();
                assert_eq!(delivered.len(), 1, "order {order:?}");
                let data = delivered[0].as_ref().unwrap();
                let expected: Vec<u8> = (0..runs).flat_map(|i| [i as u8; 3]).collect();
                assert_eq!(&data[..], &expected[..]);
                assert_eq!(gather.state(), GatherState::Done);
            }
        }
    }

    #[test]
    fn test_first_failure_observed_wins() {
        for order in permutations(4) {
            let (gather, delivered) = counting_gather(3);
            let mut first_failure = None;
            for &event in &order {
                match event {
                    3 => gather.finish_issuing(),
                    0 => gather.complete_run(0, BytesMut::zeroed(1), Ok(())),
                    failing => {
                        first_failure.get_or_insert(failing);
                        let err = ReadError::io(anyhow!("run {failing} failed"));
                        gather.complete_run(failing, BytesMut::zeroed(1), Err(err));
                    }
                }
            }
            let delivered = delivered.lock();
            assert_eq!(delivered.len(), 1);
            let err = delivered[0].as_ref().unwrap_err();
            let expected = format!("run {} failed", first_failure.unwrap());
            assert!(err.to_string().contains(&expected), "{order:?}: {err}");
        }
    }

    #[tokio::test]
    async fn test_signal_completion_reaches_waiter() {
        let (tx, rx) = oneshot::channel();
        let gather = GatherIo::new(1, None, Completion::Signal(tx));
        gather.complete_run(0, BytesMut::from(&b"abc"[..]), Ok(()));
        assert_eq!(gather.state(), GatherState::Issuing);
        gather.finish_issuing();
        assert_eq!(&rx.await.unwrap().unwrap()[..], b"abc");
    }

    struct PanickingStore;

    #[async_trait::async_trait]
    impl LocalStore for PanickingStore {
        fn allocate(&self, _len: u64) -> anyhow::Result<u64> {
            Ok(0)
        }

        fn release(&self, _offset: u64, _len: u64) {}

        async fn write_at(&self, _offset: u64, _data: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize> {
            if offset == 13 {
                panic!("disk on fire");
            }
            buf.fill(7);
            Ok(buf.len())
        }
    }

    #[tokio::test]
    async fn test_panicking_run_becomes_io_failure() {
        use crate::config::ReadConfig;
        use crate::extent::{ExtentMap, PopulationEngine};
        use crate::source::InMemorySource;
        use crate::store::InMemoryLocalStore;

        let store = Arc::new(InMemoryLocalStore::new());
        let engine = Arc::new(PopulationEngine::new(
            Arc::new(InMemorySource::new()),
            store.clone(),
            &ReadConfig::default(),
        ));
        let map = Arc::new(ExtentMap::new("f", engine));
        map.prime(0, &[1u8; 8]).await.unwrap();
        let refs = map.try_pin(0, 8).unwrap();

        let runs: IoRuns = [
            IoRun {
                buffer_offset: 0,
                storage_offset: 0,
                len: 4,
            },
            IoRun {
                buffer_offset: 4,
                storage_offset: 13,
                len: 4,
            },
        ]
        .into_iter()
        .collect();
        let (tx, rx) = oneshot::channel();
        start_ios(Arc::new(PanickingStore), runs, 8, refs, Completion::Signal(tx));
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnderlyingIoFailure);
        assert!(err.to_string().contains("disk on fire"));
        // References were dropped at finalization.
        assert_eq!(map.extents(), vec![(0, 8, 0)]);
    }
}
