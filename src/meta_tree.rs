use std::collections::BTreeMap;

use bytes::Bytes;
use log::debug;

use crate::types::Block;

/// Ordered index over physical blocks, keyed by each block's maximum key.
///
/// A merge feeds every contributing source through the tree; a block whose
/// end key is already present is skipped rather than overwritten, so a
/// block reaches the deduplicated output at most once even when several
/// overlapping sources contribute it.
pub struct BlockMetaTree {
    tree: BTreeMap<Bytes, Block>,
}

impl Default for BlockMetaTree {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockMetaTree {
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
        }
    }

    /// Inserts a block unless one with the same end key is already present.
    /// Returns whether the block was inserted.
    pub fn insert(&mut self, block: Block) -> bool {
        if self.tree.contains_key(block.end_key()) {
            debug!(
                "skipping duplicate block [end_key={:?}, checksum={}]",
                block.end_key(),
                block.checksum()
            );
            return false;
        }
        self.tree.insert(block.end_key().clone(), block);
        true
    }

    pub fn insert_all(&mut self, blocks: impl IntoIterator<Item = Block>) {
        for block in blocks {
            self.insert(block);
        }
    }

    pub fn contains(&self, end_key: &Bytes) -> bool {
        self.tree.contains_key(end_key)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// The deduplicated blocks in end-key order.
    pub fn sorted_blocks(self) -> Vec<Block> {
        self.tree.into_values().collect()
    }
}
