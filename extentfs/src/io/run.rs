//! Scatter/gather descriptors for one read.

use crate::config::MAX_STACK_IO_RUNS;
use crate::error::{ReadError, Result};
use crate::extent::Extent;
use smallvec::SmallVec;
use std::sync::Arc;

/// One contiguous transfer from local storage into the request buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRun {
    pub buffer_offset: usize,
    pub storage_offset: u64,
    pub len: usize,
}

pub type IoRuns = SmallVec<[IoRun; MAX_STACK_IO_RUNS]>;

/// Splits `[offset, offset + len)` at extent boundaries into runs, in buffer order.
///
/// `extents` must be sorted by file offset and cover the whole range. Neighbouring
/// pieces that are also adjacent in local storage are merged into one run. Lists
/// longer than [`MAX_STACK_IO_RUNS`] are reserved on the heap up front, so the only
/// allocation failure happens before any run is built.
pub fn build_runs(offset: u64, len: usize, extents: &[Arc<Extent>]) -> Result<IoRuns> {
    let mut runs = IoRuns::new();
    if len == 0 {
        return Ok(runs);
    }
    if extents.len() > MAX_STACK_IO_RUNS {
        runs.try_reserve_exact(extents.len()).map_err(|e| {
            ReadError::ResourceExhausted(format!("{} i/o runs: {e:?}", extents.len()))
        })?;
    }

    let end = offset + len as u64;
    let mut pos = offset;
    for ext in extents {
        if ext.end() <= pos {
            continue;
        }
        if ext.offset() > pos {
            break;
        }
        let seg_end = ext.end().min(end);
        let run = IoRun {
            buffer_offset: (pos - offset) as usize,
            storage_offset: ext.storage_offset() + (pos - ext.offset()),
            len: (seg_end - pos) as usize,
        };
        match runs.last_mut() {
            Some(last)
                if last.storage_offset + last.len as u64 == run.storage_offset
                    && last.buffer_offset + last.len == run.buffer_offset =>
            {
                last.len += run.len;
            }
            _ => runs.push(run),
        }
        pos = seg_end;
        if pos >= end {
            break;
        }
    }

    if pos < end {
        return Err(ReadError::InvalidRange(format!(
            "no extent covers offset {pos} of read at {offset} (+{len})"
        )));
    }
    Ok(runs)
}
