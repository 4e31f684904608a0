use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::LoadError;
use crate::types::{Block, ColumnGroupSpec, LoadKind, Row, TabletId};

/// Identifies one writer's contribution stream within a load campaign.
#[derive(Clone, Copy, Debug)]
pub struct SliceInfo {
    pub tablet_id: TabletId,
    pub kind: LoadKind,
    pub context_id: u64,
    pub slice_id: u64,
    /// Routes the slice to the lob sub-tablet owned by this tablet's
    /// context instead of the tablet itself.
    pub is_lob_slice: bool,
}

/// Accumulates one writer's sorted row run for a tablet load.
///
/// Rows must arrive in ascending key order within the slice. `close` seals
/// the accumulated rows into content-checksummed blocks; the blocks stay
/// available on the writer until it is evicted so that column-group
/// projection can run after the global row ordering is known.
pub struct SliceWriter {
    slice_id: u64,
    start_seq: u64,
    block_rows: usize,
    state: Mutex<WriterState>,
    // Global row offset assigned by range computation; negative while unset.
    row_offset: AtomicI64,
    row_count: AtomicU64,
    closed: AtomicBool,
    cancelled: AtomicBool,
}

#[derive(Default)]
struct WriterState {
    rows: Vec<Row>,
    blocks: Vec<Block>,
    end_key: Option<Bytes>,
}

impl SliceWriter {
    pub(crate) fn new(slice_id: u64, start_seq: u64, block_rows: usize) -> Self {
        Self {
            slice_id,
            start_seq,
            block_rows: block_rows.max(1),
            state: Mutex::new(WriterState::default()),
            row_offset: AtomicI64::new(-1),
            row_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn slice_id(&self) -> u64 {
        self.slice_id
    }

    pub fn start_seq(&self) -> u64 {
        self.start_seq
    }

    /// Appends rows from the iterator, returning the number accepted.
    pub fn fill(&self, rows: impl Iterator<Item = Row>) -> Result<u64, LoadError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(LoadError::InvalidArgument("slice writer cancelled"));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(LoadError::InvalidArgument("slice writer already closed"));
        }
        let mut state = self.state.lock();
        let mut affected_rows = 0u64;
        for row in rows {
            if let Some(last) = state.rows.last() {
                if row.key <= last.key {
                    return Err(LoadError::InvalidArgument(
                        "slice rows must be in ascending key order",
                    ));
                }
            }
            state.rows.push(row);
            affected_rows += 1;
        }
        self.row_count.fetch_add(affected_rows, Ordering::Release);
        Ok(affected_rows)
    }

    /// Seals the accumulated rows into blocks. Must be called exactly once.
    pub fn close(&self) -> Result<(), LoadError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(LoadError::InvalidArgument("slice writer cancelled"));
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(LoadError::InvalidArgument("slice writer already closed"));
        }
        let mut state = self.state.lock();
        let rows = std::mem::take(&mut state.rows);
        state.end_key = rows.last().map(|r| r.key.clone());
        let mut blocks = Vec::new();
        for chunk in rows.chunks(self.block_rows) {
            blocks.push(Block::seal(chunk.to_vec())?);
        }
        state.blocks = blocks;
        Ok(())
    }

    /// Discards all accumulated state. Safe to call at any point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let mut state = self.state.lock();
        state.rows.clear();
        state.blocks.clear();
        state.end_key = None;
    }

    /// A slice that never contributed rows is invalid for range purposes.
    pub fn is_empty(&self) -> bool {
        self.row_count.load(Ordering::Acquire) == 0
    }

    pub fn row_count(&self) -> u64 {
        self.row_count.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// End key of the sealed run; `None` until closed or when empty.
    pub fn end_key(&self) -> Option<Bytes> {
        self.state.lock().end_key.clone()
    }

    pub fn row_offset(&self) -> i64 {
        self.row_offset.load(Ordering::Acquire)
    }

    pub fn set_row_offset(&self, offset: i64) {
        self.row_offset.store(offset, Ordering::Release);
    }

    /// The sealed base blocks. Only valid after `close`.
    pub fn blocks(&self) -> Result<Vec<Block>, LoadError> {
        if !self.closed.load(Ordering::Acquire) {
            return Err(LoadError::InvalidArgument("slice writer not closed"));
        }
        Ok(self.state.lock().blocks.clone())
    }

    /// Projects the sealed rows onto one column group, preserving block
    /// boundaries so the end keys stay stable across layouts.
    pub fn project_column_group(&self, spec: &ColumnGroupSpec) -> Result<Vec<Block>, LoadError> {
        if !self.closed.load(Ordering::Acquire) {
            return Err(LoadError::InvalidArgument("slice writer not closed"));
        }
        let state = self.state.lock();
        let mut projected = Vec::with_capacity(state.blocks.len());
        for block in &state.blocks {
            let rows = block
                .rows()
                .iter()
                .map(|row| {
                    let columns = spec
                        .columns
                        .iter()
                        .map(|&idx| {
                            row.columns
                                .get(idx)
                                .cloned()
                                .ok_or(LoadError::InvalidArgument(
                                    "column group index out of range",
                                ))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Row {
                        key: row.key.clone(),
                        columns,
                    })
                })
                .collect::<Result<Vec<_>, LoadError>>()?;
            projected.push(Block::seal(rows)?);
        }
        Ok(projected)
    }
}
