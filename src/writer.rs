//! The writer: single-threaded, drains the done queue in order, applies
//! dedup, pads for alignment, and commits bytes to the output file.
//!
//! Per §4.4, this is the only component that touches the output file
//! handle, and it is only ever called from the drain path (never from a
//! worker thread).

use std::io::{Seek, SeekFrom, Write};

use tracing::trace;

use crate::block::{Block, BlockFlags, SizeWord};
use crate::dedup::{BlockIndex, BlockIndexEntry};
use crate::error::SqfsBuildError;
use crate::file::{BlockDescriptor, FileRecord};

#[derive(Debug, Clone, Copy, Default)]
pub struct WriterStats {
    pub blocks_written: u64,
    pub blocks_deduped: u64,
    pub fragment_blocks_written: u64,
    pub bytes_written: u64,
}

/// One entry in the fragment table: where a committed fragment block
/// lives and its size word.
#[derive(Debug, Clone, Copy)]
pub struct FragmentTableEntry {
    pub file_offset: u64,
    pub size_word: SizeWord,
}

pub struct Writer<W: Write + Seek> {
    out: W,
    position: u64,
    devblksz: u32,
    block_index: BlockIndex,
    fragment_table: Vec<FragmentTableEntry>,
    stats: WriterStats,
}

impl<W: Write + Seek> Writer<W> {
    pub fn new(out: W, start_position: u64, devblksz: u32, block_index: BlockIndex) -> Self {
        Self {
            out,
            position: start_position,
            devblksz: devblksz.max(1),
            block_index,
            fragment_table: Vec::new(),
            stats: WriterStats::default(),
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    pub fn fragment_table(&self) -> &[FragmentTableEntry] {
        &self.fragment_table
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn pad_to_devblksz(&mut self) -> Result<(), SqfsBuildError> {
        let remainder = self.position % self.devblksz as u64;
        if remainder == 0 {
            return Ok(());
        }
        let pad = self.devblksz as u64 - remainder;
        self.out
            .seek(SeekFrom::Start(self.position + pad - 1))
            .map_err(SqfsBuildError::StdIo)?;
        self.out.write_all(&[0u8]).map_err(SqfsBuildError::StdIo)?;
        self.position += pad;
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<u64, SqfsBuildError> {
        let offset = self.position;
        self.out.write_all(bytes).map_err(SqfsBuildError::StdIo)?;
        self.position += bytes.len() as u64;
        self.stats.bytes_written += bytes.len() as u64;
        Ok(offset)
    }

    /// Commits a single block popped off the done queue. `owner` is the
    /// file record this block belongs to; `None` for a sealed fragment
    /// block, which belongs to no single file.
    pub fn commit(
        &mut self,
        block: Block,
        owner: Option<&mut FileRecord>,
    ) -> Result<(), SqfsBuildError> {
        if block.flags.contains(BlockFlags::ALIGN) {
            self.pad_to_devblksz()?;
        }

        if block.is_sparse() {
            trace!(seq_id = block.seq_id, "committing sparse block");
            let size_word = SizeWord::sparse();
            if let Some(owner) = owner {
                if owner.data_start.is_none() {
                    owner.data_start = Some(self.position);
                }
                owner.blocks.push(BlockDescriptor { size_word });
            }
            return Ok(());
        }

        let is_fragment_block = block.is_fragment_block();
        let stored_uncompressed = !block.flags.contains(BlockFlags::SIZE_IS_COMPRESSED);
        let bytes = block.on_disk_bytes().to_vec();

        let (offset, size_word) = if !is_fragment_block
            && !block.flags.contains(BlockFlags::DONT_DEDUPLICATE)
            && block.uncompressed_size > 0
        {
            let sig = block.signature();
            if let Some(hit) = self.block_index.lookup(sig, &block.data) {
                self.stats.blocks_deduped += 1;
                (hit.file_offset, hit.size_word)
            } else {
                let size_word = SizeWord::new(bytes.len() as u32, stored_uncompressed);
                let offset = self.write_raw(&bytes)?;
                self.block_index.insert(
                    sig,
                    BlockIndexEntry {
                        file_offset: offset,
                        size_word,
                    },
                    block.data.clone(),
                );
                self.stats.blocks_written += 1;
                (offset, size_word)
            }
        } else {
            let size_word = SizeWord::new(bytes.len() as u32, stored_uncompressed);
            let offset = self.write_raw(&bytes)?;
            if !is_fragment_block {
                self.stats.blocks_written += 1;
            }
            (offset, size_word)
        };

        if is_fragment_block {
            self.fragment_table.push(FragmentTableEntry {
                file_offset: offset,
                size_word,
            });
            self.stats.fragment_blocks_written += 1;
        } else if let Some(owner) = owner {
            if owner.data_start.is_none() {
                owner.data_start = Some(offset);
            }
            owner.blocks.push(BlockDescriptor { size_word });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::dedup::DedupPolicy;
    use crate::file::{FileId, FileOptions};

    fn new_writer() -> Writer<Cursor<Vec<u8>>> {
        Writer::new(
            Cursor::new(Vec::new()),
            0,
            4096,
            BlockIndex::new(DedupPolicy::CompareBytes, 8),
        )
    }

    #[test]
    fn identical_blocks_dedup_to_one_write() {
        let mut writer = new_writer();
        let mut file_a = FileRecord::new(FileId(0), FileOptions::default());
        let mut file_b = FileRecord::new(FileId(1), FileOptions::default());

        let data = vec![9u8; 4096];
        let b1 = Block::new(0, 0, 0, data.clone(), BlockFlags::empty());
        let b2 = Block::new(1, 1, 0, data, BlockFlags::empty());

        writer.commit(b1, Some(&mut file_a)).unwrap();
        writer.commit(b2, Some(&mut file_b)).unwrap();

        assert_eq!(writer.stats().blocks_written, 1);
        assert_eq!(writer.stats().blocks_deduped, 1);
        assert_eq!(
            file_a.blocks[0].size_word.raw(),
            file_b.blocks[0].size_word.raw()
        );
    }

    #[test]
    fn dont_deduplicate_forces_separate_copies() {
        let mut writer = new_writer();
        let mut file_a = FileRecord::new(FileId(0), FileOptions::default());
        let mut file_b = FileRecord::new(FileId(1), FileOptions::default());

        let data = vec![5u8; 128];
        let b1 = Block::new(0, 0, 0, data.clone(), BlockFlags::DONT_DEDUPLICATE);
        let b2 = Block::new(1, 1, 0, data, BlockFlags::DONT_DEDUPLICATE);

        writer.commit(b1, Some(&mut file_a)).unwrap();
        writer.commit(b2, Some(&mut file_b)).unwrap();

        assert_eq!(writer.stats().blocks_written, 2);
        assert_eq!(writer.stats().blocks_deduped, 0);
    }

    #[test]
    fn align_pads_to_device_block_size() {
        let mut writer = new_writer();
        let mut file_a = FileRecord::new(FileId(0), FileOptions::default());
        let b1 = Block::new(0, 0, 0, vec![1u8; 100], BlockFlags::empty());
        writer.commit(b1, Some(&mut file_a)).unwrap();
        assert_eq!(writer.position(), 100);

        let mut file_b = FileRecord::new(FileId(1), FileOptions::default());
        let b2 = Block::new(1, 1, 0, vec![2u8; 50], BlockFlags::ALIGN);
        writer.commit(b2, Some(&mut file_b)).unwrap();
        assert_eq!(writer.position(), 4096 + 50);
    }

    #[test]
    fn sparse_block_writes_nothing_and_records_zero_size_word() {
        let mut writer = new_writer();
        let mut file_a = FileRecord::new(FileId(0), FileOptions::default());
        let before = writer.position();
        let mut block = Block::new(0, 0, 0, vec![0u8; 4096], BlockFlags::IS_SPARSE);
        block.data.clear();
        writer.commit(block, Some(&mut file_a)).unwrap();
        assert_eq!(writer.position(), before);
        assert!(file_a.blocks[0].size_word.is_sparse());
    }
}
