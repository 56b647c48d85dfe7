//! Pipeline configuration.
//!
//! Every field has a default, so a JSON file only needs the values it
//! changes:
//!
//! ```json
//! { "scheduler": { "max_consecutive_drops": 3 }, "sync": { "offset_us": -20000 } }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Event slots kept free beyond one completion per buffer, for command
/// completions, port changes and errors
pub const EVENT_HEADROOM: usize = 8;

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Input descriptors to allocate (raised to the component minimum)
    pub input_buffers: usize,
    /// Bytes per input descriptor; larger units are split across a chain
    pub input_buffer_size: usize,
    /// Input descriptors the hardware may hold at once
    pub max_in_flight_input: usize,
    /// Output descriptors to allocate (0 = component minimum)
    pub output_buffers: usize,
    /// Completed pictures held back to restore presentation order
    pub reorder_window: usize,
    /// How long to wait for a hardware command to complete
    pub command_timeout_ms: u64,
    /// Depth of the hardware event channel
    pub event_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_buffers: 8,
            input_buffer_size: 512 * 1024,
            max_in_flight_input: 4,
            output_buffers: 0,
            reorder_window: 4,
            command_timeout_ms: 5000,
            event_queue_depth: 256,
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Frames due further out than this are waited for
    pub early_threshold_us: i64,
    /// Frames later than this are dropped
    pub late_threshold_us: i64,
    /// After this many drops in a row the next late frame is shown anyway
    pub max_consecutive_drops: u32,
    /// Extra sleep allowed beyond one frame duration
    pub sleep_slack_us: i64,
    /// Frame duration assumed when a frame carries none
    pub default_frame_duration_us: i64,
    /// Poll interval while idle or paused
    pub idle_wait_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            early_threshold_us: 10_000,
            late_threshold_us: 40_000,
            max_consecutive_drops: 5,
            sleep_slack_us: 5_000,
            default_frame_duration_us: 33_333,
            idle_wait_ms: 20,
        }
    }
}

// ============================================================================
// AV Sync
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Smoothing factor in permille (900 = keep 90% of the old value)
    pub feedback_gain: u32,
    /// Smoothed delay above which video is considered ahead
    pub ahead_threshold_us: i64,
    /// Smoothed delay below minus this is considered behind
    pub behind_threshold_us: i64,
    /// Behind by more than this: skip decoding to the next key unit
    pub skip_threshold_us: i64,
    /// Clamp for the smoothed delay
    pub max_delay_us: i64,
    /// User A/V offset added to the output latency
    pub offset_us: i64,
    /// Latency the scheduler already accounts for
    pub scheduler_compensated_us: i64,
    /// How long the first stream waits for the other before free-running
    pub startup_latch_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            feedback_gain: 900,
            ahead_threshold_us: 40_000,
            behind_threshold_us: 40_000,
            skip_threshold_us: 200_000,
            max_delay_us: 250_000,
            offset_us: 0,
            scheduler_compensated_us: 0,
            startup_latch_ms: 2000,
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub session: SessionConfig,
    pub scheduler: SchedulerConfig,
    pub sync: SyncConfig,
    /// Frames kept in the pool beyond what the decoder needs, for the
    /// presentation queue and the sink
    pub display_frames: usize,
    /// Presentation queue length before the decode thread waits
    pub max_queued_frames: usize,
    /// Pace video against reported audio time
    pub audio_master: bool,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json_str(&json)?;
        tracing::info!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.session;
        if s.input_buffers == 0 {
            return Err(invalid("session.input_buffers", "must be at least 1"));
        }
        if s.input_buffer_size == 0 {
            return Err(invalid("session.input_buffer_size", "must be non-zero"));
        }
        if s.max_in_flight_input == 0 || s.max_in_flight_input > s.input_buffers {
            return Err(invalid(
                "session.max_in_flight_input",
                format!("must be between 1 and input_buffers ({})", s.input_buffers),
            ));
        }
        if s.command_timeout_ms == 0 {
            return Err(invalid("session.command_timeout_ms", "must be non-zero"));
        }
        let events_needed = s.input_buffers + s.output_buffers + EVENT_HEADROOM;
        if s.event_queue_depth < events_needed {
            return Err(invalid(
                "session.event_queue_depth",
                format!("must hold at least {} events (one per buffer plus {})", events_needed, EVENT_HEADROOM),
            ));
        }

        let sc = &self.scheduler;
        if sc.early_threshold_us < 0 || sc.late_threshold_us <= 0 {
            return Err(invalid("scheduler", "thresholds must be positive"));
        }
        if sc.max_consecutive_drops == 0 {
            return Err(invalid("scheduler.max_consecutive_drops", "must be at least 1"));
        }
        if sc.default_frame_duration_us <= 0 {
            return Err(invalid("scheduler.default_frame_duration_us", "must be positive"));
        }

        let sy = &self.sync;
        if sy.feedback_gain > 1000 {
            return Err(invalid("sync.feedback_gain", format!("{} is above 1000", sy.feedback_gain)));
        }
        if sy.ahead_threshold_us <= 0 || sy.behind_threshold_us <= 0 {
            return Err(invalid("sync", "thresholds must be positive"));
        }
        if sy.skip_threshold_us < sy.behind_threshold_us {
            return Err(invalid("sync.skip_threshold_us", "must not be below behind_threshold_us"));
        }
        if sy.max_delay_us <= 0 {
            return Err(invalid("sync.max_delay_us", "must be positive"));
        }
        if self.max_queued_frames == 0 {
            return Err(invalid("max_queued_frames", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            scheduler: SchedulerConfig::default(),
            sync: SyncConfig::default(),
            display_frames: 4,
            max_queued_frames: 3,
            audio_master: false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
