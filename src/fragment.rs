//! Fragment accumulation: packs file tails shorter than the block size
//! into shared fragment blocks, deduplicating identical tails before they
//! ever reach the work queue.

use crate::block::{Block, BlockFlags, BlockSignature};
use crate::dedup::{FragmentIndex, FragmentIndexEntry};
use crate::file::FragmentRef;

pub struct FragmentAccumulator {
    block_size: u32,
    buffer: Vec<u8>,
    fill: u32,
    /// Equal to the number of fragment blocks sealed so far. Stable at
    /// seal time because fragment blocks are never deduplicated — every
    /// sealed block is eventually committed, in seal order, so this
    /// count always matches the writer's fragment table length when that
    /// block actually commits.
    next_fragment_block_index: u32,
}

impl FragmentAccumulator {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            buffer: Vec::with_capacity(block_size as usize),
            fill: 0,
            next_fragment_block_index: 0,
        }
    }

    /// Accepts a file's trailing bytes. Returns the fragment reference to
    /// record on the owning file, plus a freshly sealed fragment block
    /// the caller must enqueue, if accepting this tail required sealing
    /// the in-progress one first.
    pub fn accept(
        &mut self,
        index: &mut FragmentIndex,
        tail: Vec<u8>,
    ) -> (FragmentRef, Option<Block>) {
        let uncompressed_size = tail.len() as u32;
        let checksum = crc32fast::hash(&tail);
        let sig = BlockSignature::new(uncompressed_size, checksum);

        if let Some(hit) = index.lookup(sig, &tail) {
            return (
                FragmentRef {
                    fragment_block_index: hit.fragment_block_index,
                    offset: hit.offset,
                    uncompressed_size,
                },
                None,
            );
        }

        let sealed = if self.fill + uncompressed_size > self.block_size {
            Some(self.seal())
        } else {
            None
        };

        let offset = self.fill;
        let fragment_block_index = self.next_fragment_block_index;
        self.buffer.extend_from_slice(&tail);
        self.fill += uncompressed_size;
        index.insert(
            sig,
            FragmentIndexEntry {
                fragment_block_index,
                offset,
            },
            tail,
        );

        (
            FragmentRef {
                fragment_block_index,
                offset,
                uncompressed_size,
            },
            sealed,
        )
    }

    fn seal(&mut self) -> Block {
        let data =
            std::mem::replace(&mut self.buffer, Vec::with_capacity(self.block_size as usize));
        self.fill = 0;
        self.next_fragment_block_index += 1;
        // seq_id/file_id/index_in_file are placeholders: seq_id is
        // overwritten by `Shared::try_enqueue`, and a fragment block
        // belongs to no single file.
        Block::new(0, 0, 0, data, BlockFlags::IS_FRAGMENT_BLOCK)
    }

    /// Flushes the in-progress fragment block, even if it is short of
    /// `block_size`. Called once, from `BlockProcessor::finish`.
    pub fn finish(&mut self) -> Option<Block> {
        if self.fill > 0 {
            Some(self.seal())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupPolicy;

    #[test]
    fn identical_tails_dedup_to_one_fragment() {
        let mut index = FragmentIndex::new(DedupPolicy::CompareBytes, 8);
        let mut acc = FragmentAccumulator::new(128 * 1024);
        let tail = vec![7u8; 4096];

        let (first, sealed) = acc.accept(&mut index, tail.clone());
        assert!(sealed.is_none());

        let (second, sealed) = acc.accept(&mut index, tail);
        assert!(sealed.is_none());
        assert_eq!(first.fragment_block_index, second.fragment_block_index);
        assert_eq!(first.offset, second.offset);
    }

    #[test]
    fn overflow_seals_current_block() {
        let mut index = FragmentIndex::new(DedupPolicy::CompareBytes, 8);
        let mut acc = FragmentAccumulator::new(8192);
        let (_, sealed) = acc.accept(&mut index, vec![1u8; 6000]);
        assert!(sealed.is_none());
        let (second, sealed) = acc.accept(&mut index, vec![2u8; 6000]);
        assert!(sealed.is_some());
        assert_eq!(second.fragment_block_index, 1);
    }
}
