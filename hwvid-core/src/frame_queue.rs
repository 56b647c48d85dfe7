//! # Frame Queue - Ownership-Transferring FIFO of Frames
//!
//! Used at every hand-off in the pipeline: the output port's completion queue,
//! and the decode → presentation queue feeding the scheduler.
//!
//! - FIFO order of whatever is pushed
//! - `push_front` to requeue a frame that was popped but not consumed
//! - Blocking pop with timeout, interruptible by `wake`/`close`
//! - Locked peek so a consumer can inspect the head without taking it
//!
//! A handle can only be in one queue because [`FrameHandle`] is move-only;
//! pushing a slot that is already queued is a fatal error.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::frame::FrameHandle;

struct QueueInner {
    frames: VecDeque<FrameHandle>,
    closed: bool,
    /// Bumped by `wake`/`flush` so sleeping consumers re-check their state
    wake_generation: u64,
    pushed: u64,
    popped: u64,
}

/// Thread-safe FIFO of frame handles
pub struct FrameQueue {
    name: &'static str,
    inner: Mutex<QueueInner>,
    ready_cond: Condvar,
}

impl FrameQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(32),
                closed: false,
                wake_generation: 0,
                pushed: 0,
                popped: 0,
            }),
            ready_cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    // ========================================================================
    // Producer API
    // ========================================================================

    /// Append a frame. Returns the handle back if the queue is closed.
    pub fn push_back(&self, handle: FrameHandle) -> Result<(), FrameHandle> {
        self.push(handle, false)
    }

    /// Requeue a frame at the head
    pub fn push_front(&self, handle: FrameHandle) -> Result<(), FrameHandle> {
        self.push(handle, true)
    }

    fn push(&self, handle: FrameHandle, front: bool) -> Result<(), FrameHandle> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(handle);
        }
        assert!(
            !inner.frames.iter().any(|h| h.slot() == handle.slot()),
            "{}: frame slot {} queued twice",
            self.name,
            handle.slot()
        );
        if front {
            inner.frames.push_front(handle);
        } else {
            inner.frames.push_back(handle);
        }
        inner.pushed += 1;
        drop(inner);
        self.ready_cond.notify_one();
        Ok(())
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Pop the head frame, if any
    pub fn pop(&self) -> Option<FrameHandle> {
        let mut inner = self.inner.lock();
        let handle = inner.frames.pop_front();
        if handle.is_some() {
            inner.popped += 1;
        }
        handle
    }

    /// Pop, waiting up to `timeout` for a frame.
    ///
    /// Returns `None` on timeout, close, or `wake`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<FrameHandle> {
        if self.wait_nonempty(timeout) {
            self.pop()
        } else {
            None
        }
    }

    /// Block until the queue has a frame. Returns false on timeout, close,
    /// or an explicit `wake`.
    pub fn wait_nonempty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        let generation = inner.wake_generation;
        while inner.frames.is_empty() {
            if inner.closed || inner.wake_generation != generation {
                return false;
            }
            if self.ready_cond.wait_until(&mut inner, deadline).timed_out() {
                return !inner.frames.is_empty();
            }
        }
        true
    }

    /// Inspect the head frame under the queue lock
    pub fn peek_with<R>(&self, f: impl FnOnce(&FrameHandle) -> R) -> Option<R> {
        self.inner.lock().frames.front().map(f)
    }

    // ========================================================================
    // Control API
    // ========================================================================

    /// Remove every queued frame and hand them back to the caller
    pub fn flush(&self) -> Vec<FrameHandle> {
        let mut inner = self.inner.lock();
        let drained: Vec<FrameHandle> = inner.frames.drain(..).collect();
        inner.wake_generation += 1;
        drop(inner);
        self.ready_cond.notify_all();
        if !drained.is_empty() {
            tracing::debug!("{}: flushed {} frames", self.name, drained.len());
        }
        drained
    }

    /// Interrupt blocked consumers without changing contents
    pub fn wake(&self) {
        self.inner.lock().wake_generation += 1;
        self.ready_cond.notify_all();
    }

    /// Refuse further pushes and release waiters. Queued frames stay until flushed.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready_cond.notify_all();
    }

    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// Slots currently queued, head first
    pub fn slots(&self) -> Vec<usize> {
        self.inner.lock().frames.iter().map(FrameHandle::slot).collect()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            queued: inner.frames.len(),
            pushed: inner.pushed,
            popped: inner.popped,
            closed: inner.closed,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub pushed: u64,
    pub popped: u64,
    pub closed: bool,
}

// ============================================================================
// Tests
// ============================================================================
