//! Media clocks used to pace presentation.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Source of the current media time
pub trait Clock: Send + Sync {
    /// Current media time (microseconds)
    fn now_us(&self) -> i64;
}

struct MediaClockState {
    /// Media time at `started`, or the frozen time while stopped
    base_us: i64,
    started: Option<Instant>,
    /// Playback rate in permille
    rate: u32,
}

/// Wall-clock driven media time with pause and seek.
pub struct MediaClock {
    state: Mutex<MediaClockState>,
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaClock {
    /// A stopped clock at time zero
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MediaClockState {
                base_us: 0,
                started: None,
                rate: 1000,
            }),
        }
    }

    fn current(state: &MediaClockState) -> i64 {
        match state.started {
            Some(at) => state.base_us + at.elapsed().as_micros() as i64 * state.rate as i64 / 1000,
            None => state.base_us,
        }
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.started.is_none() {
            state.started = Some(Instant::now());
        }
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        state.base_us = Self::current(&state);
        state.started = None;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().started.is_some()
    }

    /// Jump to `time_us`, keeping the running state
    pub fn set_time(&self, time_us: i64) {
        let mut state = self.state.lock();
        state.base_us = time_us;
        if state.started.is_some() {
            state.started = Some(Instant::now());
        }
    }

    pub fn set_rate(&self, rate_permille: u32) {
        let mut state = self.state.lock();
        state.base_us = Self::current(&state);
        if state.started.is_some() {
            state.started = Some(Instant::now());
        }
        state.rate = rate_permille.max(1);
    }
}

impl Clock for MediaClock {
    fn now_us(&self) -> i64 {
        Self::current(&self.state.lock())
    }
}

/// Clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now_us: AtomicI64,
}

impl ManualClock {
    pub fn new(now_us: i64) -> Self {
        Self {
            now_us: AtomicI64::new(now_us),
        }
    }

    pub fn set(&self, now_us: i64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_us: i64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}
