//! Per-file bookkeeping: the carry buffer of not-yet-sealed bytes and the
//! accumulated block/fragment descriptors that make up a file's inode
//! data once the processor finishes with it.

use crate::block::{BlockFlags, SizeWord};

/// Opaque handle returned by [`crate::processor::BlockProcessor::new_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub(crate) u64);

#[derive(Debug, Clone, Copy)]
pub struct BlockDescriptor {
    pub size_word: SizeWord,
}

#[derive(Debug, Clone, Copy)]
pub struct FragmentRef {
    pub fragment_block_index: u32,
    pub offset: u32,
    pub uncompressed_size: u32,
}

/// Per-file flags, applied to every block sealed from this file's bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileOptions {
    pub dont_compress: bool,
    pub dont_fragment: bool,
    pub dont_deduplicate: bool,
    pub align: bool,
}

impl FileOptions {
    pub(crate) fn block_flags(self) -> BlockFlags {
        let mut flags = BlockFlags::empty();
        if self.dont_compress {
            flags.insert(BlockFlags::DONT_COMPRESS);
        }
        if self.dont_deduplicate {
            flags.insert(BlockFlags::DONT_DEDUPLICATE);
        }
        if self.align {
            flags.insert(BlockFlags::ALIGN);
        }
        flags
    }
}

pub struct FileRecord {
    pub id: FileId,
    pub options: FileOptions,
    pub blocks: Vec<BlockDescriptor>,
    pub fragment: Option<FragmentRef>,
    pub data_start: Option<u64>,
    pub total_size: u64,
    pub next_index_in_file: u32,
    pub carry: Vec<u8>,
}

impl FileRecord {
    pub fn new(id: FileId, options: FileOptions) -> Self {
        Self {
            id,
            options,
            blocks: Vec::new(),
            fragment: None,
            data_start: None,
            total_size: 0,
            next_index_in_file: 0,
            carry: Vec::new(),
        }
    }
}
