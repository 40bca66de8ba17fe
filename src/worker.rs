//! Worker pool: fixed set of threads, each owning a scratch buffer and a
//! compressor instance, draining the work queue and feeding the done
//! queue.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::block::{Block, BlockFlags};
use crate::compressor::BlockCompressor;
use crate::queue::Shared;

/// Compresses one block in place, following the §4.3 contract: keep the
/// raw bytes (and leave `SIZE_IS_COMPRESSED` unset) unless compression
/// actually shrinks the block. `DONT_COMPRESS` and sparse blocks bypass
/// compression entirely.
pub fn process_one(
    block: &mut Block,
    compressor: &BlockCompressor,
    scratch: &mut Vec<u8>,
) -> Result<(), crate::error::SqfsBuildError> {
    if block.flags.contains(BlockFlags::DONT_COMPRESS) || block.is_sparse() {
        return Ok(());
    }
    let compressed_len = compressor.compress(&block.data, scratch)?;
    if compressed_len < block.data.len() {
        block.compressed = Some(scratch[..compressed_len].to_vec());
        block.flags.insert(BlockFlags::SIZE_IS_COMPRESSED);
    }
    Ok(())
}

/// Owned by each spawned thread; joined by [`Pool::shutdown`].
pub struct Pool {
    handles: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Spawns `num_workers` threads, each looping on `shared` until
    /// `terminate` is observed. `num_workers == 0` spawns nothing: the
    /// caller is expected to call [`process_one`] inline instead.
    pub fn spawn(shared: Arc<Shared>, num_workers: usize, compressor: BlockCompressor) -> Self {
        let mut handles = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let shared = Arc::clone(&shared);
            handles.push(std::thread::spawn(move || {
                let mut scratch = Vec::new();
                while let Some(mut block) = shared.worker_wait_for_work() {
                    match process_one(&mut block, &compressor, &mut scratch) {
                        Ok(()) => shared.worker_submit_done(block),
                        Err(err) => shared.mark_failed(&err),
                    }
                }
            }));
        }
        Self { handles }
    }

    /// Signals `terminate` and joins every worker thread. Only safe to
    /// call once both queues have fully drained.
    pub fn shutdown(self, shared: &Shared) {
        shared.terminate();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
