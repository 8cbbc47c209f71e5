//! Non-cached read path: extents, runs and gather I/O.
//!
//! [`ExtentReader::map_extents`] runs the optimistic query/populate/wait loop until it
//! holds references on every extent backing the range. The range is then split into
//! runs and handed to the gather engine, which completes the read either by waking the
//! reader or by calling its continuation.

pub mod gather;
pub mod run;

pub use gather::{Completion, GatherContinuation, GatherIo, GatherState};
pub use run::{IoRun, IoRuns, build_runs};

use crate::cache::CacheCallbacks;
use crate::config::ReadConfig;
use crate::error::{ReadError, Result};
use crate::extent::{ExtentRefs, Population};
use crate::file::FileState;
use crate::store::LocalStore;
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{trace, warn};

pub struct ExtentReader {
    store: Arc<dyn LocalStore>,
    config: Arc<ReadConfig>,
}

impl ExtentReader {
    pub fn new(store: Arc<dyn LocalStore>, config: Arc<ReadConfig>) -> Self {
        Self { store, config }
    }

    /// Pins the extents backing `[offset, offset + len)`, populating whatever is missing.
    ///
    /// The loop only ends once the whole range is resident or a population fails. It
    /// relies on the remote source making progress; every extra iteration is counted in
    /// the extent map's stats and logged once per `retry_warn_threshold` iterations.
    /// Each iteration waits for the extent state to change, so a range that can never
    /// become resident (the file shrank under the reader) ends with `EndOfFile`
    /// instead of spinning.
    #[tracing::instrument(level = "trace", skip(self, file), fields(file = file.id()))]
    pub async fn map_extents(&self, file: &FileState, offset: u64, len: u64) -> Result<ExtentRefs> {
        let map = file.extents();
        let threshold = self.config.retry_warn_threshold.max(1);
        let mut attempts: u64 = 0;
        loop {
            let since = map.epoch();
            let size = file.size();
            if offset.saturating_add(len) > size {
                return Err(ReadError::EndOfFile { offset, size });
            }
            let mapping = match map.try_pin(offset, len) {
                Ok(refs) => return Ok(refs),
                Err(mapping) => mapping,
            };
            trace!(?mapping, attempts, "range not resident");

            match map.request_population(offset, len, size).await? {
                // Fetched inline, or raced with another reader: query again right away.
                Population::MappedNow if map.epoch() != since => {}
                Population::MappedNow | Population::Pending => {
                    map.wait_for_population(offset, len, since).await?
                }
            }

            attempts += 1;
            map.note_retry();
            if attempts % threshold == 0 {
                warn!(
                    key = map.key(),
                    offset,
                    len,
                    attempts,
                    "read still waiting for extent population"
                );
            }
        }
    }

    /// Maps the range and issues its runs. Errors are returned before any I/O is sent;
    /// afterwards the outcome only reaches `completion`.
    pub(crate) async fn start_read(
        &self,
        file: &FileState,
        offset: u64,
        len: usize,
        completion: Completion,
    ) -> Result<()> {
        let refs = self.map_extents(file, offset, len as u64).await?;
        let runs = build_runs(offset, len, refs.extents())?;
        trace!(file = file.id(), offset, len, runs = runs.len(), "built i/o runs");
        gather::start_ios(Arc::clone(&self.store), runs, len, refs, completion);
        Ok(())
    }

    /// Reads `[offset, offset + len)`, which the caller has already clipped to the file
    /// size, and waits for the gather to finish.
    pub async fn read(&self, file: &FileState, offset: u64, len: usize) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let (tx, rx) = oneshot::channel();
        self.start_read(file, offset, len, Completion::Signal(tx)).await?;
        rx.await
            .map_err(|_| ReadError::io(anyhow!("gather i/o finished without a result")))?
    }

    /// Paging read: takes the paging lock instead of the main lock and stops at end of
    /// file.
    pub async fn paging_read(&self, file: &FileState, offset: u64, len: usize) -> Result<Bytes> {
        let _paging = file.read_lock(true).await;
        file.check_usable()?;
        let size = file.size();
        if offset >= size {
            return Ok(Bytes::new());
        }
        let len = len.min((size - offset) as usize);
        self.read(file, offset, len).await
    }
}

#[async_trait]
impl CacheCallbacks for ExtentReader {
    async fn read_pages(&self, file: &Arc<FileState>, offset: u64, len: usize) -> Result<Bytes> {
        self.paging_read(file, offset, len).await
    }
}
