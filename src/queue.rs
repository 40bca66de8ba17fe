//! The work queue / done queue pair at the heart of the block processor:
//! one mutex, two condition variables, and the bookkeeping that keeps the
//! writer's commit order independent of which worker finishes a block
//! first.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::block::Block;
use crate::error::{ErrorKind, SqfsBuildError};

/// A sticky-status snapshot: just enough of the original error to
/// reconstruct a correctly classified [`SqfsBuildError`] later, without
/// needing the original (possibly non-`Clone`) error value to stay alive.
#[derive(Clone)]
struct StickyStatus {
    kind: ErrorKind,
    message: String,
}

struct Inner {
    /// FIFO, in submission order. Workers pop from the front.
    work: VecDeque<Block>,
    /// Sorted ascending by `seq_id`. Kept short (bounded by worker count
    /// plus writer lag), so insertion sort is the right tool.
    done: Vec<Block>,
    backlog: usize,
    max_backlog: usize,
    terminate: bool,
    status: Option<StickyStatus>,
    enqueue_id: u64,
    dequeue_id: u64,
}

/// Outcome of a non-blocking enqueue attempt (see [`Shared::try_enqueue`]).
pub enum EnqueueOutcome {
    Enqueued(u64),
    /// Backlog is at capacity; the block is handed back so the caller can
    /// drain a ready block and retry instead of blocking inside the lock.
    Full(Block),
}

/// State shared between the producer/writer thread and the worker pool.
pub struct Shared {
    inner: Mutex<Inner>,
    queue_cond: Condvar,
    done_cond: Condvar,
}

impl Shared {
    pub fn new(max_backlog: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                work: VecDeque::new(),
                done: Vec::new(),
                backlog: 0,
                max_backlog: max_backlog.max(1),
                terminate: false,
                status: None,
                enqueue_id: 0,
                dequeue_id: 0,
            }),
            queue_cond: Condvar::new(),
            done_cond: Condvar::new(),
        }
    }

    fn fail(inner: &mut Inner, err: &SqfsBuildError) {
        if inner.status.is_none() {
            inner.status = Some(StickyStatus {
                kind: err.kind(),
                message: err.to_string(),
            });
        }
    }

    /// Sets the sticky status if it isn't already set. Wakes every waiter
    /// so enqueue/worker/writer loops can all observe the failure and
    /// unwind.
    pub fn mark_failed(&self, err: &SqfsBuildError) {
        let mut inner = self.inner.lock().unwrap();
        Self::fail(&mut inner, err);
        drop(inner);
        self.queue_cond.notify_all();
        self.done_cond.notify_all();
    }

    pub fn status(&self) -> Option<SqfsBuildError> {
        let inner = self.inner.lock().unwrap();
        inner
            .status
            .clone()
            .map(|s| SqfsBuildError::poisoned(s.kind, s.message))
    }

    /// Assigns the next `seq_id` and appends to the work queue if there is
    /// capacity. Never blocks: when `backlog == max_backlog`, hands the
    /// block back as [`EnqueueOutcome::Full`] so the caller (the
    /// producer/writer thread) can commit a ready block to make room and
    /// retry, rather than sleeping inside this call with nothing left to
    /// drain the backlog it's waiting on. Fails fast if `status` is
    /// already set.
    pub fn try_enqueue(&self, mut block: Block) -> Result<EnqueueOutcome, SqfsBuildError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = &inner.status {
            return Err(SqfsBuildError::poisoned(s.kind, s.message.clone()));
        }
        if inner.backlog >= inner.max_backlog {
            return Ok(EnqueueOutcome::Full(block));
        }
        let seq_id = inner.enqueue_id;
        inner.enqueue_id += 1;
        block.seq_id = seq_id;
        inner.backlog += 1;
        inner.work.push_back(block);
        drop(inner);
        self.queue_cond.notify_one();
        Ok(EnqueueOutcome::Enqueued(seq_id))
    }

    /// Blocking pop from the work queue for a worker thread. Returns
    /// `None` once `terminate` is set and the queue has drained.
    pub fn worker_wait_for_work(&self) -> Option<Block> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(block) = inner.work.pop_front() {
                return Some(block);
            }
            if inner.terminate || inner.status.is_some() {
                return None;
            }
            inner = self.queue_cond.wait(inner).unwrap();
        }
    }

    /// Inserts a processed block into the done queue at its sorted
    /// position and wakes the writer.
    pub fn worker_submit_done(&self, block: Block) {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner
            .done
            .binary_search_by_key(&block.seq_id, |b| b.seq_id)
            .unwrap_or_else(|p| p);
        inner.done.insert(pos, block);
        drop(inner);
        self.done_cond.notify_all();
    }

    /// Non-blocking: pops the done queue's head if it is the next
    /// expected `seq_id`. Used after every enqueue to keep the writer
    /// moving without forcing it to block.
    pub fn try_pop_ready(&self) -> Option<Block> {
        let mut inner = self.inner.lock().unwrap();
        self.pop_ready_locked(&mut inner)
    }

    /// Blocking: waits for the next expected block to become ready, or
    /// for `backlog == 0` (nothing left to drain), or for a sticky
    /// failure.
    pub fn wait_for_ready(&self) -> Option<Block> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(block) = self.pop_ready_locked(&mut inner) {
                return Some(block);
            }
            if inner.backlog == 0 || inner.status.is_some() {
                return None;
            }
            inner = self.done_cond.wait(inner).unwrap();
        }
    }

    fn pop_ready_locked(&self, inner: &mut Inner) -> Option<Block> {
        if inner.done.first().map(|b| b.seq_id) == Some(inner.dequeue_id) {
            let block = inner.done.remove(0);
            inner.dequeue_id += 1;
            inner.backlog -= 1;
            Some(block)
        } else {
            None
        }
    }

    /// Called by the writer after committing a block, to release any
    /// producer blocked on backpressure.
    pub fn notify_backlog_freed(&self) {
        self.done_cond.notify_all();
    }

    pub fn backlog(&self) -> usize {
        self.inner.lock().unwrap().backlog
    }

    /// Sets `terminate` and wakes every worker so they can observe it and
    /// exit their loop. Only safe to call once the work queue and done
    /// queue have both fully drained.
    pub fn terminate(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.terminate = true;
        drop(inner);
        self.queue_cond.notify_all();
    }
}
