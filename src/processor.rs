//! The block processor facade (§4.1): the public surface that turns a
//! stream of file payloads into a committed, deduplicated, ordered
//! sequence of blocks in the output file.
//!
//! `num_workers == 0` is degraded mode: no threads are spawned and every
//! block is compressed and committed inline by the calling thread,
//! through exactly the same `process_one`/`Writer::commit` functions the
//! threaded path uses (§5).

use std::collections::HashMap;
use std::io::{Seek, Write};
use std::sync::Arc;

use tracing::instrument;

use crate::block::{Block, BlockFlags};
use crate::compressor::BlockCompressor;
use crate::dedup::{BlockIndex, DedupPolicy, FragmentIndex};
use crate::error::SqfsBuildError;
use crate::file::{FileId, FileOptions, FileRecord, FragmentRef};
use crate::fragment::FragmentAccumulator;
use crate::queue::{EnqueueOutcome, Shared};
use crate::worker::{self, Pool};
use crate::writer::{FragmentTableEntry, Writer, WriterStats};

pub struct BlockProcessorConfig {
    pub block_size: u32,
    pub num_workers: usize,
    pub max_backlog: usize,
    pub devblksz: u32,
    pub compressor: BlockCompressor,
    pub dedup_policy: DedupPolicy,
    pub fragments_enabled: bool,
    /// Size of the recently-committed-buffer LRU consulted by
    /// [`DedupPolicy::CompareBytes`]. Fixed and independent of
    /// `num_workers`: committed block order (and therefore which blocks
    /// are recent at any given signature lookup) does not depend on
    /// worker count either, and tying this to `num_workers` would make an
    /// eviction-driven dedup miss — and therefore the output bytes —
    /// vary with `-j` (spec §8 property #2).
    pub recent_buffer_capacity: usize,
}

/// Default [`BlockProcessorConfig::recent_buffer_capacity`]: worker-count
/// independent so dedup decisions, and thus output bytes, stay identical
/// across `-j` values.
const DEFAULT_RECENT_BUFFER_CAPACITY: usize = 64;

impl BlockProcessorConfig {
    pub fn new(block_size: u32, num_workers: usize) -> Self {
        Self {
            block_size,
            num_workers,
            max_backlog: (num_workers.max(1) * 2).max(4),
            devblksz: 4096,
            compressor: BlockCompressor::new(crate::compressor::Compressor::Xz, None),
            dedup_policy: DedupPolicy::CompareBytes,
            fragments_enabled: true,
            recent_buffer_capacity: DEFAULT_RECENT_BUFFER_CAPACITY,
        }
    }
}

/// Everything an external superblock/metadata-table writer needs once the
/// core has finished: every file's block list and fragment reference, the
/// fragment table, and summary statistics.
#[derive(Debug, Clone)]
pub struct FileReport {
    pub data_start: Option<u64>,
    pub block_size_words: Vec<u32>,
    pub fragment: Option<FragmentRef>,
    pub total_size: u64,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub files: HashMap<FileId, FileReport>,
    pub fragment_table: Vec<FragmentTableEntry>,
    pub bytes_used: u64,
    pub stats: WriterStats,
    pub fragment_dedup_hits: u64,
}

pub struct BlockProcessor<W: Write + Seek> {
    shared: Arc<Shared>,
    pool: Option<Pool>,
    // Present only in degraded (num_workers == 0) mode.
    inline_compressor: Option<BlockCompressor>,
    inline_scratch: Vec<u8>,
    writer: Writer<W>,
    fragment_accumulator: FragmentAccumulator,
    fragment_index: FragmentIndex,
    files: HashMap<FileId, FileRecord>,
    next_file_id: u64,
    block_size: u32,
    fragments_enabled: bool,
    fragment_hits_before: usize,
    fragment_dedup_hits: u64,
}

impl<W: Write + Seek> BlockProcessor<W> {
    pub fn new(out: W, data_start: u64, config: BlockProcessorConfig) -> Self {
        let shared = Arc::new(Shared::new(config.max_backlog));
        let pool = if config.num_workers > 0 {
            Some(Pool::spawn(
                Arc::clone(&shared),
                config.num_workers,
                config.compressor,
            ))
        } else {
            None
        };
        let inline_compressor = (config.num_workers == 0).then_some(config.compressor);
        let block_index = BlockIndex::new(config.dedup_policy, config.recent_buffer_capacity);
        let fragment_index = FragmentIndex::new(config.dedup_policy, config.recent_buffer_capacity);

        Self {
            shared,
            pool,
            inline_compressor,
            inline_scratch: Vec::new(),
            writer: Writer::new(out, data_start, config.devblksz, block_index),
            fragment_accumulator: FragmentAccumulator::new(config.block_size),
            fragment_index,
            files: HashMap::new(),
            next_file_id: 0,
            block_size: config.block_size,
            fragments_enabled: config.fragments_enabled,
            fragment_hits_before: 0,
            fragment_dedup_hits: 0,
        }
    }

    fn status(&self) -> Result<(), SqfsBuildError> {
        match self.shared.status() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn new_file(&mut self, options: FileOptions) -> FileId {
        let id = FileId(self.next_file_id);
        self.next_file_id += 1;
        self.files.insert(id, FileRecord::new(id, options));
        id
    }

    /// Submits one already-sealed block: enqueues it, and in degraded
    /// mode processes and commits it inline before returning. Always
    /// drains every block that has become ready, regardless of mode, so
    /// `backlog` stays bounded and file block lists stay current.
    ///
    /// When the backlog is full, `try_enqueue` hands the block back
    /// instead of blocking; this loop commits a ready block to make room
    /// and retries, mirroring the reference implementation's
    /// `append_to_work_queue`, which drains a completed block from a full
    /// queue rather than sleeping with nothing left to drain it.
    fn submit(&mut self, mut block: Block) -> Result<(), SqfsBuildError> {
        loop {
            self.status()?;
            match self.shared.try_enqueue(block)? {
                EnqueueOutcome::Enqueued(_) => break,
                EnqueueOutcome::Full(returned) => {
                    block = returned;
                    match self.shared.wait_for_ready() {
                        Some(ready) => self.commit_one(ready)?,
                        // backlog >= max_backlog >= 1 here, so `None` can
                        // only mean a sticky failure was set.
                        None => return self.status(),
                    }
                }
            }
        }
        if let Some(compressor) = &self.inline_compressor {
            if let Some(mut block) = self.shared.worker_wait_for_work() {
                match worker::process_one(&mut block, compressor, &mut self.inline_scratch) {
                    Ok(()) => self.shared.worker_submit_done(block),
                    Err(err) => {
                        self.shared.mark_failed(&err);
                        return Err(err);
                    }
                }
            }
        }
        self.drain_ready()
    }

    /// Commits every block currently sitting at the done queue's head
    /// without blocking.
    fn drain_ready(&mut self) -> Result<(), SqfsBuildError> {
        while let Some(block) = self.shared.try_pop_ready() {
            self.commit_one(block)?;
        }
        self.status()
    }

    fn commit_one(&mut self, block: Block) -> Result<(), SqfsBuildError> {
        let result = if block.is_fragment_block() {
            self.writer.commit(block, None)
        } else {
            let file_id = FileId(block.file_id);
            let owner = self.files.get_mut(&file_id);
            self.writer.commit(block, owner)
        };
        self.shared.notify_backlog_freed();
        result.map_err(|err| {
            self.shared.mark_failed(&err);
            err
        })
    }

    #[instrument(skip(self, bytes))]
    pub fn append_to_file(&mut self, file: FileId, bytes: &[u8]) -> Result<(), SqfsBuildError> {
        self.status()?;
        let block_size = self.block_size as usize;
        let record = self
            .files
            .get_mut(&file)
            .ok_or_else(|| SqfsBuildError::Internal("append to unknown file".into()))?;
        record.carry.extend_from_slice(bytes);

        let mut sealed_blocks = Vec::new();
        while record.carry.len() >= block_size {
            let data: Vec<u8> = record.carry.drain(..block_size).collect();
            let index_in_file = record.next_index_in_file;
            record.next_index_in_file += 1;
            record.total_size += data.len() as u64;

            let mut flags = record.options.block_flags();
            if index_in_file == 0 {
                flags.insert(BlockFlags::FIRST_BLOCK);
            } else {
                // ALIGN only makes sense on a file's first block, to
                // align its data start; clear it for subsequent blocks.
                flags.remove(BlockFlags::ALIGN);
            }
            if data.iter().all(|&b| b == 0) {
                flags.insert(BlockFlags::IS_SPARSE);
            }

            sealed_blocks.push(Block::new(0, file.0, index_in_file, data, flags));
        }

        for block in sealed_blocks {
            self.submit(block)?;
        }
        Ok(())
    }

    /// Seals a file's carry buffer, even if short of `block_size`, and
    /// hands it to the fragment accumulator unless fragmentation is
    /// disabled for this file or globally. Syncs the pipeline before
    /// returning so the file's block list is complete and safe to read.
    #[instrument(skip(self))]
    pub fn finish_file(&mut self, file: FileId) -> Result<(), SqfsBuildError> {
        self.status()?;
        let record = self
            .files
            .get_mut(&file)
            .ok_or_else(|| SqfsBuildError::Internal("finish unknown file".into()))?;
        let tail = std::mem::take(&mut record.carry);

        if !tail.is_empty() {
            record.total_size += tail.len() as u64;
            let dont_fragment = record.options.dont_fragment || !self.fragments_enabled;

            if dont_fragment {
                let index_in_file = record.next_index_in_file;
                record.next_index_in_file += 1;
                let mut flags = record.options.block_flags();
                flags.insert(BlockFlags::LAST_BLOCK);
                if index_in_file == 0 {
                    flags.insert(BlockFlags::FIRST_BLOCK);
                }
                if tail.iter().all(|&b| b == 0) {
                    flags.insert(BlockFlags::IS_SPARSE);
                }
                let block = Block::new(0, file.0, index_in_file, tail, flags);
                self.submit(block)?;
            } else {
                let hits_before = self.fragment_index.len();
                let (frag_ref, sealed) = self.fragment_accumulator.accept(&mut self.fragment_index, tail);
                if self.fragment_index.len() == hits_before {
                    self.fragment_dedup_hits += 1;
                }
                let record = self.files.get_mut(&file).expect("file record disappeared");
                record.fragment = Some(frag_ref);
                if let Some(sealed) = sealed {
                    self.submit(sealed)?;
                }
            }
        }

        self.sync()
    }

    /// Drains the pipeline until `backlog == 0`.
    pub fn sync(&mut self) -> Result<(), SqfsBuildError> {
        loop {
            self.status()?;
            if self.shared.backlog() == 0 {
                break;
            }
            match self.shared.wait_for_ready() {
                Some(block) => self.commit_one(block)?,
                None => break,
            }
        }
        self.status()
    }

    /// Flushes any partial fragment block, waits for full drain, and
    /// shuts down the worker pool. Consumes `self` and returns the
    /// accumulated [`BuildReport`] plus the output writer.
    pub fn finish(mut self) -> Result<(BuildReport, W), SqfsBuildError> {
        if let Some(sealed) = self.fragment_accumulator.finish() {
            self.submit(sealed)?;
        }
        self.sync()?;

        if let Some(pool) = self.pool.take() {
            pool.shutdown(&self.shared);
        }
        self.status()?;

        let files = self
            .files
            .into_iter()
            .map(|(id, record)| {
                (
                    id,
                    FileReport {
                        data_start: record.data_start,
                        block_size_words: record.blocks.iter().map(|b| b.size_word.raw()).collect(),
                        fragment: record.fragment,
                        total_size: record.total_size,
                    },
                )
            })
            .collect();

        let report = BuildReport {
            files,
            fragment_table: self.writer.fragment_table().to_vec(),
            bytes_used: self.writer.position(),
            stats: self.writer.stats(),
            fragment_dedup_hits: self.fragment_dedup_hits,
        };
        Ok((report, self.writer.into_inner()))
    }
}
