//! # Presentation Scheduler
//!
//! One thread per session releases decoded frames to the display sink when
//! their target time comes up on the media clock.
//!
//! ```text
//!            ┌────────────── lead = target - now + sync hold ──────────────┐
//!  queue ──► │ lead > early      → sleep min(lead, duration + slack)       │
//!            │ lead < -late      → drop (at most N in a row)             │──► return_frame
//!            │ otherwise         → sink.put                              │
//!            └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every frame taken off the queue goes back to its owner, rendered or not,
//! so dropping can never starve the decoder of output buffers.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::frame::{Frame, FrameGeometry, FrameHandle, FramePool};
use crate::frame_queue::FrameQueue;
use crate::sync::AvSyncController;

// ============================================================================
// Collaborators
// ============================================================================

/// Where rendered frames go
pub trait DisplaySink: Send {
    /// Show a frame; returns the media time it is expected on screen
    fn put(&mut self, frame: &Frame) -> i64;

    /// A free display surface, or `None` while the sink is still busy
    fn get_free_frame(&mut self) -> Option<usize> {
        Some(0)
    }

    /// Drop anything queued for display
    fn flush(&mut self) {}

    /// Picture size changed
    fn resize(&mut self, _geometry: FrameGeometry) {}

    /// Delay between `put` and the frame being visible (microseconds)
    fn latency_us(&self) -> i64 {
        0
    }
}

/// Takes frames back once the scheduler is done with them
pub trait FrameRecycler: Send + Sync {
    fn return_frame(&self, handle: FrameHandle);
}

/// Recycler that puts frames straight back into their pool
impl FrameRecycler for FramePool {
    fn return_frame(&self, handle: FrameHandle) {
        self.release(handle);
    }
}

// ============================================================================
// Decision
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Too early: sleep this long, then look again
    Wait(i64),
    Drop,
    Render,
}

/// Pure pacing policy for the head frame
pub fn decide(lead_us: i64, duration_us: i64, consecutive_drops: u32, config: &SchedulerConfig) -> Decision {
    if lead_us > config.early_threshold_us {
        let cap = duration_us.max(0) + config.sleep_slack_us;
        return Decision::Wait(lead_us.min(cap));
    }
    if lead_us < -config.late_threshold_us && consecutive_drops < config.max_consecutive_drops {
        return Decision::Drop;
    }
    Decision::Render
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub rendered: u64,
    pub dropped: u64,
    /// Late frames shown because the drop limit was reached
    pub forced: u64,
    pub max_consecutive_drops: u32,
    pub flushed: u64,
    pub last_rendered_us: Option<i64>,
}

// ============================================================================
// Scheduler
// ============================================================================

struct Control {
    run: bool,
    paused: bool,
    /// Bumped by `flush` so a sleeping loop abandons its current frame
    generation: u64,
    resize: Option<FrameGeometry>,
    flush_sink: bool,
}

struct SchedulerShared {
    config: SchedulerConfig,
    queue: FrameQueue,
    control: Mutex<Control>,
    wake: Condvar,
    stats: Mutex<SchedulerStats>,
    frames: Arc<FramePool>,
    recycler: Arc<dyn FrameRecycler>,
    /// Signalled whenever the queue shrinks
    space: Condvar,
    space_lock: Mutex<()>,
}

impl SchedulerShared {
    fn recycle(&self, handle: FrameHandle) {
        self.recycler.return_frame(handle);
        let _guard = self.space_lock.lock();
        self.space.notify_all();
    }
}

pub struct PresentationScheduler {
    shared: Arc<SchedulerShared>,
    thread: Option<JoinHandle<()>>,
}

impl PresentationScheduler {
    /// Spawn the presentation thread.
    pub fn start(
        config: SchedulerConfig,
        frames: Arc<FramePool>,
        clock: Arc<dyn Clock>,
        sink: Box<dyn DisplaySink>,
        recycler: Arc<dyn FrameRecycler>,
        sync: Option<Arc<AvSyncController>>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(SchedulerShared {
            config,
            queue: FrameQueue::new("presentation"),
            control: Mutex::new(Control {
                run: true,
                paused: false,
                generation: 0,
                resize: None,
                flush_sink: false,
            }),
            wake: Condvar::new(),
            stats: Mutex::new(SchedulerStats::default()),
            frames,
            recycler,
            space: Condvar::new(),
            space_lock: Mutex::new(()),
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("hwvid-present".into())
                .spawn(move || presentation_loop(shared, clock, sink, sync))?
        };
        tracing::debug!("Presentation scheduler started");

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Queue a decoded frame. Returns it if the scheduler is stopping.
    pub fn push(&self, handle: FrameHandle) -> Result<(), FrameHandle> {
        self.shared.queue.push_back(handle)
    }

    /// Block until fewer than `max` frames are queued
    pub fn wait_for_space(&self, max: usize, timeout: Duration) -> bool {
        let mut guard = self.shared.space_lock.lock();
        if self.shared.queue.len() < max {
            return true;
        }
        self.shared.space.wait_for(&mut guard, timeout);
        self.shared.queue.len() < max
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Return every queued frame to its owner (seek)
    pub fn flush(&self) -> usize {
        let mut control = self.shared.control.lock();
        control.generation += 1;
        control.flush_sink = true;
        drop(control);

        let frames = self.shared.queue.flush();
        let count = frames.len();
        for handle in frames {
            self.shared.recycle(handle);
        }
        self.shared.stats.lock().flushed += count as u64;
        self.shared.wake.notify_all();
        count
    }

    pub fn pause(&self) {
        self.shared.control.lock().paused = true;
        self.shared.queue.wake();
        self.shared.wake.notify_all();
    }

    pub fn resume(&self) {
        self.shared.control.lock().paused = false;
        self.shared.wake.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.control.lock().paused
    }

    /// Forward a geometry change to the sink on the presentation thread
    pub fn request_resize(&self, geometry: FrameGeometry) {
        self.shared.control.lock().resize = Some(geometry);
        self.shared.queue.wake();
        self.shared.wake.notify_all();
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.lock().clone()
    }

    /// Stop the thread and hand back every frame still queued
    pub fn stop(&mut self) {
        self.shared.control.lock().run = false;
        self.shared.queue.close();
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Presentation thread panicked");
            }
        }
        for handle in self.shared.queue.flush() {
            self.shared.recycle(handle);
        }
    }
}

impl Drop for PresentationScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Presentation Thread
// ============================================================================

fn presentation_loop(
    shared: Arc<SchedulerShared>,
    clock: Arc<dyn Clock>,
    mut sink: Box<dyn DisplaySink>,
    sync: Option<Arc<AvSyncController>>,
) {
    let config = shared.config.clone();
    let idle = Duration::from_millis(config.idle_wait_ms.max(1));
    let mut consecutive_drops = 0u32;

    loop {
        let generation = {
            let mut control = shared.control.lock();
            if !control.run {
                break;
            }
            if let Some(geometry) = control.resize.take() {
                sink.resize(geometry);
            }
            if std::mem::take(&mut control.flush_sink) {
                sink.flush();
                consecutive_drops = 0;
            }
            if control.paused {
                shared.wake.wait_for(&mut control, idle);
                continue;
            }
            control.generation
        };

        if !shared.queue.wait_nonempty(idle) || shared.control.lock().paused {
            continue;
        }

        let Some(head) = shared.queue.peek_with(|h| shared.frames.snapshot(h)) else {
            continue;
        };

        if let Some(sync) = &sync {
            sync.note_video_ready();
            if sync.video_held() {
                let mut control = shared.control.lock();
                shared.wake.wait_for(&mut control, idle);
                continue;
            }
        }

        let hold_us = sync.as_ref().map_or(0, |s| s.advice().hold_us);
        let lead_us = head.target_time_us - clock.now_us() + hold_us;
        let duration_us = if head.duration_us > 0 {
            head.duration_us
        } else {
            config.default_frame_duration_us
        };

        match decide(lead_us, duration_us, consecutive_drops, &config) {
            Decision::Wait(us) => {
                let mut control = shared.control.lock();
                if control.run && !control.paused && control.generation == generation {
                    shared.wake.wait_for(&mut control, Duration::from_micros(us as u64));
                }
            }
            Decision::Drop => {
                let Some(handle) = take_head(&shared, head.slot) else {
                    continue;
                };
                consecutive_drops += 1;
                {
                    let mut stats = shared.stats.lock();
                    stats.dropped += 1;
                    stats.max_consecutive_drops = stats.max_consecutive_drops.max(consecutive_drops);
                }
                tracing::debug!("Dropped frame {}us ({}us late)", head.timestamp_us, -lead_us);
                shared.recycle(handle);
            }
            Decision::Render => {
                if sink.get_free_frame().is_none() {
                    let mut control = shared.control.lock();
                    shared.wake.wait_for(&mut control, idle);
                    continue;
                }
                let Some(handle) = take_head(&shared, head.slot) else {
                    continue;
                };
                let frame = shared.frames.snapshot(&handle);
                sink.put(&frame);
                {
                    let mut stats = shared.stats.lock();
                    stats.rendered += 1;
                    if lead_us < -config.late_threshold_us {
                        stats.forced += 1;
                    }
                    stats.last_rendered_us = Some(frame.timestamp_us);
                }
                consecutive_drops = 0;
                if let Some(sync) = &sync {
                    sync.on_video_time(frame.timestamp_us);
                }
                shared.recycle(handle);
            }
        }
    }
    tracing::debug!("Presentation thread exiting");
}

/// Pop the head if it is still the frame that was inspected
fn take_head(shared: &SchedulerShared, slot: usize) -> Option<FrameHandle> {
    let handle = shared.queue.pop()?;
    if handle.slot() == slot {
        return Some(handle);
    }
    // Queue changed underneath (flush + refill): put it back and look again
    if let Err(handle) = shared.queue.push_front(handle) {
        shared.recycle(handle);
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SyncConfig;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct CollectSink {
        shown: Arc<Mutex<Vec<i64>>>,
    }

    impl DisplaySink for CollectSink {
        fn put(&mut self, frame: &Frame) -> i64 {
            self.shown.lock().push(frame.timestamp_us);
            frame.target_time_us
        }
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    fn queue_frame(scheduler: &PresentationScheduler, frames: &FramePool, ts: i64) {
        let handle = frames.acquire().unwrap();
        frames.update(&handle, |f| {
            f.timestamp_us = ts;
            f.target_time_us = ts;
            f.duration_us = 40_000;
            f.valid = true;
        });
        scheduler.push(handle).unwrap();
    }

    #[test]
    fn test_decide_policy() {
        let config = SchedulerConfig::default();
        assert_eq!(decide(5_000, 40_000, 0, &config), Decision::Render);
        assert_eq!(decide(500_000, 40_000, 0, &config), Decision::Wait(45_000));
        assert_eq!(decide(20_000, 40_000, 0, &config), Decision::Wait(20_000));
        assert_eq!(decide(-41_000, 40_000, 0, &config), Decision::Drop);
        assert_eq!(decide(-41_000, 40_000, 5, &config), Decision::Render);
        assert_eq!(decide(-39_000, 40_000, 0, &config), Decision::Render);
    }

    #[test]
    fn test_drop_bound() {
        let config = SchedulerConfig::default();
        let mut drops = 0;
        let mut rendered_at = Vec::new();
        for i in 0..20 {
            match decide(-1_000_000, 40_000, drops, &config) {
                Decision::Drop => drops += 1,
                Decision::Render => {
                    rendered_at.push(i);
                    drops = 0;
                }
                Decision::Wait(_) => unreachable!(),
            }
            assert!(drops <= config.max_consecutive_drops);
        }
        // Every sixth late frame is shown
        assert_eq!(rendered_at, vec![5, 11, 17]);
    }

    #[test]
    fn test_renders_due_frames_in_order() {
        let frames = Arc::new(FramePool::new(8, FrameGeometry::new(64, 64)));
        let clock = Arc::new(ManualClock::new(0));
        let sink = CollectSink::default();
        let mut scheduler = PresentationScheduler::start(
            SchedulerConfig::default(),
            frames.clone(),
            clock.clone(),
            Box::new(sink.clone()),
            frames.clone(),
            None,
        )
        .unwrap();

        for ts in [0, 33_000, 66_000] {
            queue_frame(&scheduler, &frames, ts);
        }
        // Only the first is due
        assert!(wait_until(Duration::from_secs(2), || sink.shown.lock().len() == 1));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(sink.shown.lock().len(), 1);

        clock.set(70_000);
        assert!(wait_until(Duration::from_secs(2), || sink.shown.lock().len() == 3));
        assert_eq!(*sink.shown.lock(), vec![0, 33_000, 66_000]);

        scheduler.stop();
        assert_eq!(frames.available(), 8);
        assert_eq!(scheduler.stats().rendered, 3);
    }

    #[test]
    fn test_late_frames_dropped_but_bounded() {
        let frames = Arc::new(FramePool::new(16, FrameGeometry::new(64, 64)));
        let clock = Arc::new(ManualClock::new(10_000_000));
        let sink = CollectSink::default();
        let mut scheduler = PresentationScheduler::start(
            SchedulerConfig::default(),
            frames.clone(),
            clock,
            Box::new(sink.clone()),
            frames.clone(),
            None,
        )
        .unwrap();
        scheduler.pause();
        for i in 0..12 {
            queue_frame(&scheduler, &frames, i * 40_000);
        }
        scheduler.resume();

        assert!(wait_until(Duration::from_secs(2), || scheduler.queued() == 0));
        scheduler.stop();
        let stats = scheduler.stats();
        assert_eq!(stats.dropped + stats.rendered, 12);
        assert_eq!(stats.max_consecutive_drops, 5);
        assert_eq!(stats.rendered, 2);
        assert_eq!(*sink.shown.lock(), vec![200_000, 440_000]);
        // Dropped frames were returned too
        assert_eq!(frames.available(), 16);
    }

    #[test]
    fn test_sync_hold_delays_frame() {
        let frames = Arc::new(FramePool::new(4, FrameGeometry::new(64, 64)));
        let clock = Arc::new(ManualClock::new(1_000_000));
        let sync = Arc::new(AvSyncController::new(SyncConfig::default()));
        sync.on_audio_time(1_000_000);
        sync.on_video_time(1_300_000);

        let sink = CollectSink::default();
        let mut scheduler = PresentationScheduler::start(
            SchedulerConfig::default(),
            frames.clone(),
            clock.clone(),
            Box::new(sink.clone()),
            frames.clone(),
            Some(sync),
        )
        .unwrap();
        // Due now by the clock, but video is ahead: held back
        queue_frame(&scheduler, &frames, 1_000_000);
        std::thread::sleep(Duration::from_millis(50));
        assert!(sink.shown.lock().is_empty());

        clock.set(1_250_000);
        assert!(wait_until(Duration::from_secs(2), || sink.shown.lock().len() == 1));
        scheduler.stop();
    }

    #[test]
    fn test_flush_returns_queued_frames() {
        let frames = Arc::new(FramePool::new(4, FrameGeometry::new(64, 64)));
        let clock = Arc::new(ManualClock::new(0));
        let mut scheduler = PresentationScheduler::start(
            SchedulerConfig::default(),
            frames.clone(),
            clock,
            Box::new(CollectSink::default()),
            frames.clone(),
            None,
        )
        .unwrap();
        for ts in [1_000_000, 2_000_000, 3_000_000] {
            queue_frame(&scheduler, &frames, ts);
        }
        assert_eq!(scheduler.flush(), 3);
        assert_eq!(frames.available(), 4);
        assert_eq!(scheduler.stats().flushed, 3);
        scheduler.stop();
    }
}
