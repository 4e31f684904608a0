use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::LoadError;
use crate::types::{Block, Csn, CsnRange};

/// Immutable snapshot of write activity for a csn half-open interval
/// `[start, end)`. Multiple frozen buffers plus any prior on-disk segments
/// must together cover a contiguous csn range before a merge may run.
#[derive(Debug)]
pub struct FrozenBuffer {
    range: CsnRange,
    base_blocks: Vec<Block>,
    cg_blocks: BTreeMap<u16, Vec<Block>>,
}

impl FrozenBuffer {
    pub fn range(&self) -> CsnRange {
        self.range
    }

    pub fn base_blocks(&self) -> &[Block] {
        &self.base_blocks
    }

    pub fn column_group_blocks(&self, index: u16) -> &[Block] {
        self.cg_blocks.get(&index).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn column_group_indexes(&self) -> impl Iterator<Item = u16> + '_ {
        self.cg_blocks.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.base_blocks.is_empty() && self.cg_blocks.values().all(|v| v.is_empty())
    }
}

#[derive(Default)]
struct ActiveBuffer {
    // (column group, record csn, block); base layout blocks use `None`.
    blocks: Vec<(Option<u16>, Csn, Block)>,
}

struct BufferInner {
    active: ActiveBuffer,
    frozen: VecDeque<Arc<FrozenBuffer>>,
    // End of the last frozen range; the next freeze starts here so the
    // chain of buffer ranges never leaves a gap.
    last_frozen_end: Csn,
    armed: bool,
}

/// Owns the active write buffer and the frozen queue for one tablet load.
///
/// `arm` resets the chain at the campaign's start csn. `freeze_up_to`
/// seals everything below a boundary into an immutable buffer whose range
/// chains onto the previous one. `release_through` drops buffers a merge
/// has fully absorbed.
pub struct BufferManager {
    inner: Mutex<BufferInner>,
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                active: ActiveBuffer::default(),
                frozen: VecDeque::new(),
                last_frozen_end: Csn::MIN,
                armed: false,
            }),
        }
    }

    /// Starts (or restarts) the buffer chain at the campaign's start csn.
    /// Everything accumulated for an older campaign is discarded.
    pub fn arm(&self, start_csn: Csn) {
        let mut inner = self.inner.lock();
        inner.active = ActiveBuffer::default();
        inner.frozen.clear();
        inner.last_frozen_end = start_csn;
        inner.armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().armed
    }

    /// Records one csn-stamped block for the base layout (`None`) or a
    /// column group.
    pub fn append(
        &self,
        column_group: Option<u16>,
        csn: Csn,
        block: Block,
    ) -> Result<(), LoadError> {
        let mut inner = self.inner.lock();
        if !inner.armed {
            return Err(LoadError::NotInitialized);
        }
        if csn < inner.last_frozen_end {
            // a record older than the frozen boundary implies a lost freeze
            return Err(LoadError::Unexpected("block csn below frozen boundary"));
        }
        inner.active.blocks.push((column_group, csn, block));
        Ok(())
    }

    /// Seals the active buffer into a frozen one covering
    /// `[last_frozen_end, boundary)`. A no-op when the active buffer is
    /// empty and the boundary has already been reached.
    pub fn freeze_up_to(&self, boundary: Csn) -> Result<(), LoadError> {
        let mut inner = self.inner.lock();
        if !inner.armed {
            return Err(LoadError::NotInitialized);
        }
        if boundary <= inner.last_frozen_end {
            if !inner.active.blocks.is_empty() {
                return Err(LoadError::Unexpected(
                    "active blocks behind the freeze boundary",
                ));
            }
            return Ok(());
        }
        let active = std::mem::take(&mut inner.active);
        if active.blocks.iter().any(|(_, csn, _)| *csn >= boundary) {
            return Err(LoadError::Unexpected("block csn beyond freeze boundary"));
        }
        let mut base_blocks = Vec::new();
        let mut cg_blocks: BTreeMap<u16, Vec<Block>> = BTreeMap::new();
        for (cg, _, block) in active.blocks {
            match cg {
                None => base_blocks.push(block),
                Some(idx) => cg_blocks.entry(idx).or_default().push(block),
            }
        }
        let range = CsnRange::new(inner.last_frozen_end, boundary);
        inner.frozen.push_back(Arc::new(FrozenBuffer {
            range,
            base_blocks,
            cg_blocks,
        }));
        inner.last_frozen_end = boundary;
        Ok(())
    }

    /// All frozen buffers in range order.
    pub fn frozen(&self) -> Vec<Arc<FrozenBuffer>> {
        self.inner.lock().frozen.iter().cloned().collect()
    }

    /// Releases frozen buffers fully absorbed by a merge, i.e. those whose
    /// range end does not exceed `end_csn`.
    pub fn release_through(&self, end_csn: Csn) {
        let mut inner = self.inner.lock();
        while let Some(front) = inner.frozen.front() {
            if front.range().end <= end_csn {
                inner.frozen.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn last_frozen_end(&self) -> Csn {
        self.inner.lock().last_frozen_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Row;
    use bytes::Bytes;

    fn block(key: &[u8]) -> Block {
        Block::seal(vec![Row::new(
            Bytes::copy_from_slice(key),
            vec![Bytes::from_static(b"v")],
        )])
        .unwrap()
    }

    #[test]
    fn test_append_requires_arming() {
        let mgr = BufferManager::new();
        assert!(matches!(
            mgr.append(None, Csn::new(5), block(b"a")),
            Err(LoadError::NotInitialized)
        ));
    }

    #[test]
    fn test_freeze_chains_ranges_without_gaps() {
        let mgr = BufferManager::new();
        mgr.arm(Csn::new(10));
        mgr.append(None, Csn::new(11), block(b"a")).unwrap();
        mgr.freeze_up_to(Csn::new(12)).unwrap();
        mgr.append(None, Csn::new(13), block(b"b")).unwrap();
        mgr.freeze_up_to(Csn::new(14)).unwrap();

        let frozen = mgr.frozen();
        assert_eq!(frozen.len(), 2);
        assert_eq!(frozen[0].range(), CsnRange::new(Csn::new(10), Csn::new(12)));
        assert_eq!(frozen[1].range(), CsnRange::new(Csn::new(12), Csn::new(14)));
    }

    #[test]
    fn test_freeze_is_noop_when_caught_up() {
        let mgr = BufferManager::new();
        mgr.arm(Csn::new(10));
        mgr.freeze_up_to(Csn::new(10)).unwrap();
        assert!(mgr.frozen().is_empty());
    }

    #[test]
    fn test_release_through_drops_absorbed_buffers() {
        let mgr = BufferManager::new();
        mgr.arm(Csn::new(1));
        mgr.append(None, Csn::new(2), block(b"a")).unwrap();
        mgr.freeze_up_to(Csn::new(3)).unwrap();
        mgr.append(None, Csn::new(4), block(b"b")).unwrap();
        mgr.freeze_up_to(Csn::new(5)).unwrap();

        mgr.release_through(Csn::new(3));
        let frozen = mgr.frozen();
        assert_eq!(frozen.len(), 1);
        assert_eq!(frozen[0].range().end, Csn::new(5));
    }

    #[test]
    fn test_rearming_discards_the_old_campaign() {
        let mgr = BufferManager::new();
        mgr.arm(Csn::new(1));
        mgr.append(None, Csn::new(2), block(b"a")).unwrap();
        mgr.freeze_up_to(Csn::new(3)).unwrap();

        mgr.arm(Csn::new(100));
        assert!(mgr.frozen().is_empty());
        assert_eq!(mgr.last_frozen_end(), Csn::new(100));
    }

    #[test]
    fn test_column_group_blocks_are_kept_separate() {
        let mgr = BufferManager::new();
        mgr.arm(Csn::new(1));
        mgr.append(None, Csn::new(2), block(b"a")).unwrap();
        mgr.append(Some(0), Csn::new(3), block(b"a")).unwrap();
        mgr.append(Some(1), Csn::new(4), block(b"a")).unwrap();
        mgr.freeze_up_to(Csn::new(5)).unwrap();

        let frozen = mgr.frozen();
        assert_eq!(frozen[0].base_blocks().len(), 1);
        assert_eq!(frozen[0].column_group_blocks(0).len(), 1);
        assert_eq!(frozen[0].column_group_blocks(1).len(), 1);
        assert_eq!(frozen[0].column_group_blocks(9).len(), 0);
    }
}
