//! Audio/Video Synchronization
//!
//! Audio is the master clock. Every reported timestamp updates a smoothed
//! estimate of how far video runs ahead of audio; the scheduler reads the
//! resulting advice to hold frames longer or catch up.
//!
//! ```text
//!   audio out ──on_audio_time──┐
//!                              ├──► diff ──► smoothed_delay ──► SyncAdvice
//!   scheduler ──on_video_time──┘      (+ output latency)          │
//!                                                                  ├─► hold_us (scheduler)
//!                                                                  └─► skip_to_key (decode thread)
//! ```

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::config::SyncConfig;

// ============================================================================
// Drift
// ============================================================================

/// Smoothed A/V delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftState {
    /// Positive = video ahead of audio (microseconds)
    pub smoothed_delay_us: i64,
    /// False until the first sample
    pub valid: bool,
    /// Smoothing factor in permille
    pub feedback_gain: u32,
}

impl DriftState {
    pub fn new(feedback_gain: u32) -> Self {
        Self {
            smoothed_delay_us: 0,
            valid: false,
            feedback_gain: feedback_gain.min(1000),
        }
    }

    /// Fold one sample in. The first sample initialises the estimate.
    pub fn update(&mut self, diff_us: i64, max_delay_us: i64) -> i64 {
        let smoothed = if self.valid {
            let gain = self.feedback_gain as i64;
            (self.smoothed_delay_us * gain + diff_us * (1000 - gain)) / 1000
        } else {
            diff_us
        };
        self.smoothed_delay_us = smoothed.clamp(-max_delay_us, max_delay_us);
        self.valid = true;
        self.smoothed_delay_us
    }

    pub fn invalidate(&mut self) {
        self.smoothed_delay_us = 0;
        self.valid = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Not both streams reporting yet
    #[default]
    Inactive,
    InSync,
    VideoAhead,
    VideoBehind,
}

/// What the scheduler and decode thread should do about drift
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncAdvice {
    pub state: SyncState,
    /// Added to every frame's lead: positive holds frames, negative hurries them
    pub hold_us: i64,
    /// Decode thread should skip to the next key unit
    pub skip_to_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStats {
    pub samples: u64,
    pub smoothed_delay_us: i64,
    pub skips_requested: u64,
    pub latch_timeouts: u64,
}

// ============================================================================
// AV Sync Controller
// ============================================================================

struct SyncInner {
    audio_us: Option<i64>,
    video_us: Option<i64>,
    audio_ready: bool,
    video_ready: bool,
    drift: DriftState,
    decoder_latency_us: i64,
    sink_latency_us: i64,
    advice: SyncAdvice,
    latch_started: Option<Instant>,
    latch_released: bool,
    stats: SyncStats,
}

/// A/V sync controller, shared by the scheduler, decode and audio threads
pub struct AvSyncController {
    config: SyncConfig,
    inner: Mutex<SyncInner>,
}

impl AvSyncController {
    pub fn new(config: SyncConfig) -> Self {
        let drift = DriftState::new(config.feedback_gain);
        Self {
            config,
            inner: Mutex::new(SyncInner {
                audio_us: None,
                video_us: None,
                audio_ready: false,
                video_ready: false,
                drift,
                decoder_latency_us: 0,
                sink_latency_us: 0,
                advice: SyncAdvice::default(),
                latch_started: None,
                latch_released: false,
                stats: SyncStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Latencies added between decode and the screen
    pub fn set_output_latency(&self, decoder_us: i64, sink_us: i64) {
        let mut inner = self.inner.lock();
        inner.decoder_latency_us = decoder_us;
        inner.sink_latency_us = sink_us;
    }

    /// Total output latency folded into every diff
    pub fn total_output_latency_us(&self) -> i64 {
        let inner = self.inner.lock();
        self.latency(&inner)
    }

    fn latency(&self, inner: &SyncInner) -> i64 {
        inner.decoder_latency_us + inner.sink_latency_us + self.config.offset_us - self.config.scheduler_compensated_us
    }

    /// Video presented a frame with this timestamp
    pub fn on_video_time(&self, t_us: i64) -> SyncAdvice {
        let mut inner = self.inner.lock();
        inner.video_us = Some(t_us);
        self.mark_ready(&mut inner, true);
        self.update(&mut inner)
    }

    /// Audio output reached this timestamp
    pub fn on_audio_time(&self, t_us: i64) -> SyncAdvice {
        let mut inner = self.inner.lock();
        inner.audio_us = Some(t_us);
        self.mark_ready(&mut inner, false);
        self.update(&mut inner)
    }

    fn update(&self, inner: &mut SyncInner) -> SyncAdvice {
        let (Some(video), Some(audio)) = (inner.video_us, inner.audio_us) else {
            return inner.advice;
        };
        let diff = video - audio + self.latency(inner);
        let smoothed = inner.drift.update(diff, self.config.max_delay_us);
        inner.stats.samples += 1;
        inner.stats.smoothed_delay_us = smoothed;

        let mut advice = if smoothed > self.config.ahead_threshold_us {
            SyncAdvice {
                state: SyncState::VideoAhead,
                hold_us: smoothed,
                skip_to_key: false,
            }
        } else if smoothed < -self.config.behind_threshold_us {
            SyncAdvice {
                state: SyncState::VideoBehind,
                hold_us: smoothed,
                skip_to_key: false,
            }
        } else {
            SyncAdvice {
                state: SyncState::InSync,
                hold_us: 0,
                skip_to_key: false,
            }
        };

        if smoothed < -self.config.skip_threshold_us && !inner.advice.skip_to_key {
            tracing::info!("Video {}ms behind audio, requesting skip to next key unit", -smoothed / 1000);
            inner.stats.skips_requested += 1;
            advice.skip_to_key = true;
        } else if inner.advice.skip_to_key {
            // Keep the request until the decode thread takes it
            advice.skip_to_key = true;
        }
        if advice.state != inner.advice.state {
            tracing::debug!("A/V sync {:?} -> {:?} ({}us)", inner.advice.state, advice.state, smoothed);
        }
        inner.advice = advice;
        advice
    }

    /// Latest advice without a new sample
    pub fn advice(&self) -> SyncAdvice {
        self.inner.lock().advice
    }

    pub fn drift(&self) -> DriftState {
        self.inner.lock().drift
    }

    /// Consume a pending skip request. Drift is invalidated so sync restarts
    /// from the first frame after the skip.
    pub fn take_skip_request(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.advice.skip_to_key {
            return false;
        }
        inner.drift.invalidate();
        inner.video_us = None;
        inner.advice = SyncAdvice::default();
        true
    }

    // ========================================================================
    // Start-up latch
    // ========================================================================

    /// Video has a frame ready to show
    pub fn note_video_ready(&self) {
        self.mark_ready(&mut self.inner.lock(), true);
    }

    /// Audio has samples ready to play
    pub fn note_audio_ready(&self) {
        self.mark_ready(&mut self.inner.lock(), false);
    }

    fn mark_ready(&self, inner: &mut SyncInner, video: bool) {
        if video {
            inner.video_ready = true;
        } else {
            inner.audio_ready = true;
        }
        if inner.latch_started.is_none() {
            inner.latch_started = Some(Instant::now());
        }
        if inner.video_ready && inner.audio_ready && !inner.latch_released {
            inner.latch_released = true;
            tracing::debug!("A/V start-up latch released");
        }
    }

    /// Whether video must wait for audio to start
    pub fn video_held(&self) -> bool {
        self.held(true)
    }

    /// Whether audio must wait for video to start
    pub fn audio_held(&self) -> bool {
        self.held(false)
    }

    fn held(&self, video: bool) -> bool {
        let mut inner = self.inner.lock();
        if inner.latch_released {
            return false;
        }
        let (mine, other) = if video {
            (inner.video_ready, inner.audio_ready)
        } else {
            (inner.audio_ready, inner.video_ready)
        };
        if !mine || other {
            return false;
        }
        let timeout = Duration::from_millis(self.config.startup_latch_ms);
        if inner.latch_started.map_or(false, |at| at.elapsed() >= timeout) {
            tracing::warn!("A/V start-up latch timed out after {}ms, streams free-run", self.config.startup_latch_ms);
            inner.latch_released = true;
            inner.stats.latch_timeouts += 1;
            return false;
        }
        true
    }

    /// Forget both streams (seek). The start-up latch re-arms.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.audio_us = None;
        inner.video_us = None;
        inner.audio_ready = false;
        inner.video_ready = false;
        inner.drift.invalidate();
        inner.advice = SyncAdvice::default();
        inner.latch_started = None;
        inner.latch_released = false;
    }

    pub fn stats(&self) -> SyncStats {
        self.inner.lock().stats
    }
}

// ============================================================================
// Tests
// ============================================================================
