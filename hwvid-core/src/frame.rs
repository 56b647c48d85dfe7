//! # Frames - Arena of Decoded Picture Buffers
//!
//! Decoded pictures live in a [`FramePool`] owned by the display side. Every
//! other stage refers to them through a [`FrameHandle`], which is move-only:
//! a frame is held by exactly one descriptor, queue, or thread at a time.
//!
//! ```text
//! ┌───────────┐ acquire ┌─────────────┐ complete ┌────────────┐
//! │ FramePool │────────►│ Output port │─────────►│ FrameQueue │──► sink
//! └───────────┘         └─────────────┘          └────────────┘
//!       ▲                                               │
//!       └───────────────── return_frame ◄───────────────┘
//! ```

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

// ============================================================================
// Picture Metadata
// ============================================================================

/// Dimensions of a decoded picture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes
    pub stride: u32,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, stride: width }
    }

    /// NV12 buffer size for this geometry
    pub fn buffer_size(&self) -> usize {
        let stride = self.stride.max(self.width) as usize;
        stride * self.height as usize * 3 / 2
    }
}

/// Visible region inside the coded picture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn full(geometry: FrameGeometry) -> Self {
        Self {
            left: 0,
            top: 0,
            width: geometry.width,
            height: geometry.height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterlaceMode {
    #[default]
    Progressive,
    TopFieldFirst,
    BottomFieldFirst,
}

/// What the demuxer said about a coded unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnitKind {
    /// Ordinary picture, decoded and presented
    #[default]
    Picture,
    /// Decoded for reference only (preroll, catch-up skip), never presented
    DecodeOnly,
    /// Codec configuration sent ahead of the first picture
    Primer,
}

/// A decoded picture as seen by the scheduler and the display sink
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Arena slot, stable for the lifetime of the pool
    pub slot: usize,
    pub geometry: FrameGeometry,
    pub crop: CropRect,
    pub interlace: InterlaceMode,
    /// Presentation timestamp (microseconds)
    pub timestamp_us: i64,
    /// Frame duration (microseconds)
    pub duration_us: i64,
    /// Opaque id handed in by the demuxer
    pub user_id: u64,
    pub kind: UnitKind,
    pub key: bool,
    /// Bytes written by the decoder
    pub filled_len: usize,
    /// Set once timestamp and identity have been recovered
    pub valid: bool,
    /// Media time at which the frame should be on screen (microseconds)
    pub target_time_us: i64,
}

impl Frame {
    fn new(slot: usize, geometry: FrameGeometry) -> Self {
        Self {
            slot,
            geometry,
            crop: CropRect::full(geometry),
            interlace: InterlaceMode::Progressive,
            timestamp_us: 0,
            duration_us: 0,
            user_id: 0,
            kind: UnitKind::Picture,
            key: false,
            filled_len: 0,
            valid: false,
            target_time_us: 0,
        }
    }

    /// Reset frame for reuse (keeps slot and geometry)
    pub fn reset(&mut self) {
        self.crop = CropRect::full(self.geometry);
        self.interlace = InterlaceMode::Progressive;
        self.timestamp_us = 0;
        self.duration_us = 0;
        self.user_id = 0;
        self.kind = UnitKind::Picture;
        self.key = false;
        self.filled_len = 0;
        self.valid = false;
        self.target_time_us = 0;
    }
}

// ============================================================================
// Frame Handle
// ============================================================================

/// Exclusive reference to one pool slot.
///
/// Not `Clone`: moving the handle moves ownership of the frame.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a dropped FrameHandle leaks its pool slot; release it"]
pub struct FrameHandle {
    slot: usize,
}

impl FrameHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

// ============================================================================
// Frame Pool
// ============================================================================

struct PoolInner {
    frames: Vec<Frame>,
    free: Vec<usize>,
    geometry: FrameGeometry,
    acquired: u64,
    released: u64,
}

/// Fixed set of frames shared between the decoder session and the display.
///
/// The pool only grows; slot indices stay valid across growth so handles held
/// elsewhere are unaffected.
pub struct FramePool {
    inner: Mutex<PoolInner>,
    available: Condvar,
}

impl FramePool {
    pub fn new(count: usize, geometry: FrameGeometry) -> Self {
        let frames: Vec<Frame> = (0..count).map(|slot| Frame::new(slot, geometry)).collect();
        // Hand out low slots first
        let free = (0..count).rev().collect();
        Self {
            inner: Mutex::new(PoolInner {
                frames,
                free,
                geometry,
                acquired: 0,
                released: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Take a free frame, if any
    pub fn acquire(&self) -> Option<FrameHandle> {
        let mut inner = self.inner.lock();
        Self::take_free(&mut inner)
    }

    /// Take a free frame, waiting up to `timeout` for one to be released
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<FrameHandle> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(handle) = Self::take_free(&mut inner) {
                return Some(handle);
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                return Self::take_free(&mut inner);
            }
        }
    }

    fn take_free(inner: &mut PoolInner) -> Option<FrameHandle> {
        let slot = inner.free.pop()?;
        let geometry = inner.geometry;
        let frame = &mut inner.frames[slot];
        frame.geometry = geometry;
        frame.reset();
        inner.acquired += 1;
        Some(FrameHandle { slot })
    }

    /// Give a frame back to the pool
    pub fn release(&self, handle: FrameHandle) {
        let mut inner = self.inner.lock();
        assert!(
            handle.slot < inner.frames.len() && !inner.free.contains(&handle.slot),
            "frame slot {} released twice",
            handle.slot
        );
        inner.free.push(handle.slot);
        inner.released += 1;
        drop(inner);
        self.available.notify_one();
    }

    /// Read a frame through its handle
    pub fn read<R>(&self, handle: &FrameHandle, f: impl FnOnce(&Frame) -> R) -> R {
        f(&self.inner.lock().frames[handle.slot])
    }

    /// Mutate a frame through its handle
    pub fn update<R>(&self, handle: &FrameHandle, f: impl FnOnce(&mut Frame) -> R) -> R {
        f(&mut self.inner.lock().frames[handle.slot])
    }

    /// Copy of the frame's metadata
    pub fn snapshot(&self, handle: &FrameHandle) -> Frame {
        self.read(handle, Frame::clone)
    }

    /// Grow the pool to at least `count` frames of `geometry`.
    ///
    /// Returns the number of slots added. Frames currently held elsewhere
    /// pick up the new geometry the next time they are acquired.
    pub fn grow(&self, count: usize, geometry: FrameGeometry) -> usize {
        let mut inner = self.inner.lock();
        inner.geometry = geometry;
        let current = inner.frames.len();
        if count <= current {
            return 0;
        }
        for slot in current..count {
            inner.frames.push(Frame::new(slot, geometry));
            inner.free.insert(0, slot);
        }
        drop(inner);
        self.available.notify_all();
        tracing::info!("Frame pool grown {} -> {} ({}x{})", current, count, geometry.width, geometry.height);
        count - current
    }

    pub fn set_geometry(&self, geometry: FrameGeometry) {
        self.inner.lock().geometry = geometry;
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.inner.lock().geometry
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn stats(&self) -> FramePoolStats {
        let inner = self.inner.lock();
        FramePoolStats {
            capacity: inner.frames.len(),
            available: inner.free.len(),
            total_acquired: inner.acquired,
            total_released: inner.released,
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePoolStats {
    pub capacity: usize,
    pub available: usize,
    pub total_acquired: u64,
    pub total_released: u64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuses_slot() {
        let pool = FramePool::new(2, FrameGeometry::new(1920, 1080));

        let f1 = pool.acquire().unwrap();
        let f2 = pool.acquire().unwrap();
        assert_ne!(f1.slot(), f2.slot());
        assert!(pool.acquire().is_none());

        let slot = f1.slot();
        pool.update(&f1, |f| f.timestamp_us = 4242);
        pool.release(f1);

        let f3 = pool.acquire().unwrap();
        assert_eq!(f3.slot(), slot);
        // Metadata is reset on reuse
        assert_eq!(pool.read(&f3, |f| f.timestamp_us), 0);

        pool.release(f2);
        pool.release(f3);
        let stats = pool.stats();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.total_acquired, 3);
    }

    #[test]
    fn test_grow_keeps_existing_handles() {
        let pool = FramePool::new(2, FrameGeometry::new(640, 480));
        let held = pool.acquire().unwrap();
        let added = pool.grow(5, FrameGeometry::new(1280, 720));
        assert_eq!(added, 3);
        assert_eq!(pool.capacity(), 5);
        assert_eq!(pool.available(), 4);

        // Old handle still addresses its slot
        pool.update(&held, |f| f.user_id = 7);
        assert_eq!(pool.snapshot(&held).user_id, 7);

        // Newly acquired frames carry the new geometry
        let fresh = pool.acquire().unwrap();
        assert_eq!(pool.read(&fresh, |f| f.geometry.width), 1280);

        assert_eq!(pool.grow(3, FrameGeometry::new(1280, 720)), 0);
        pool.release(held);
        pool.release(fresh);
    }

    #[test]
    fn test_acquire_timeout_wakes_on_release() {
        let pool = std::sync::Arc::new(FramePool::new(1, FrameGeometry::new(64, 64)));
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire_timeout(Duration::from_secs(5)).map(|h| h.slot()))
        };
        std::thread::sleep(Duration::from_millis(20));
        pool.release(held);

        assert_eq!(waiter.join().unwrap(), Some(0));
    }

    #[test]
    fn test_buffer_size_nv12() {
        let g = FrameGeometry { width: 1920, height: 1080, stride: 2048 };
        assert_eq!(g.buffer_size(), 2048 * 1080 * 3 / 2);
    }
}
