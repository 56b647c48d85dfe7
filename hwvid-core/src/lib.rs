//! # hwvid Core
//!
//! Hardware video decode session, frame scheduling and A/V sync.
//!
//! ```text
//!  Demuxer ─► DecoderSession ─► PresentationScheduler ─► DisplaySink
//!               │  ▲                    │
//!          BufferPort (in/out)    AvSyncController ◄── audio clock
//!               │  │
//!          DecoderComponent (hardware)
//! ```

// ============================================================================
// Hardware Interface
// ============================================================================
pub mod hardware;
pub mod port;
pub mod loopback;

// ============================================================================
// Decode
// ============================================================================
pub mod frame;
pub mod reorder;
pub mod session;

// ============================================================================
// Presentation
// ============================================================================
pub mod clock;
pub mod frame_queue;
pub mod scheduler;
pub mod sync;

// ============================================================================
// Pipeline
// ============================================================================
pub mod config;
pub mod pipeline;

pub use config::PipelineConfig;
pub use pipeline::{Demuxer, Pipeline, PipelineError, PipelineStats};
pub use session::{CodedUnit, DecoderSession, SessionError};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
