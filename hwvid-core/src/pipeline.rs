//! # Pipeline
//!
//! Wires demuxer → decoder session → presentation scheduler → display sink.
//!
//! ```text
//!  ┌─────────┐ units ┌──────────────── decode thread ────────────────┐
//!  │ Demuxer │──────►│ feed ─► DecoderSession ─► drain_output ─► push │──► PresentationScheduler ──► sink
//!  └─────────┘       └───────────────────────────────────────────────┘           │
//!                                  ▲                                             │
//!                                  └────────────── return_frame ◄────────────────┘
//! ```
//!
//! Shutdown order is fixed: signal the decode thread, join it, stop the
//! scheduler (which hands back every queued frame), then close the session.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::clock::{Clock, MediaClock};
use crate::config::{ConfigError, PipelineConfig};
use crate::frame::{FrameGeometry, FramePool, FramePoolStats};
use crate::hardware::{CodecFormat, DecoderRegistry};
use crate::scheduler::{DisplaySink, FrameRecycler, PresentationScheduler, SchedulerStats};
use crate::session::{CodedUnit, DecoderSession, SessionError, SessionStats};
use crate::sync::{AvSyncController, SyncStats};

/// Source of coded units, in decode order
pub trait Demuxer: Send {
    fn format(&self) -> CodecFormat;

    /// Codec configuration for formats that need a primer unit
    fn codec_config(&self) -> Bytes {
        Bytes::new()
    }

    /// Next unit, `None` at end of stream
    fn read_unit(&mut self) -> Option<CodedUnit>;

    /// Discard units up to the next key unit; returns how many were skipped
    fn skip_to_key_unit(&mut self) -> usize;

    /// Reposition near `target_us`. False if the source cannot seek.
    fn seek(&mut self, _target_us: i64) -> bool {
        false
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to start {0} thread: {1}")]
    Spawn(&'static str, #[source] std::io::Error),
    #[error("Decode thread panicked")]
    ThreadPanicked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub session: SessionStats,
    pub scheduler: SchedulerStats,
    pub sync: SyncStats,
    pub frame_pool: FramePoolStats,
    pub skipped_units: u64,
    pub pool_growths: u64,
    pub seeks: u64,
}

struct PipelineShared {
    should_stop: AtomicBool,
    seek_requested: AtomicBool,
    seek_target_us: AtomicI64,
    finished: AtomicBool,
    skipped_units: AtomicU64,
    pool_growths: AtomicU64,
    seeks: AtomicU64,
}

pub struct Pipeline {
    config: PipelineConfig,
    session: Arc<DecoderSession>,
    scheduler: Arc<PresentationScheduler>,
    frames: Arc<FramePool>,
    clock: Arc<MediaClock>,
    sync: Arc<AvSyncController>,
    shared: Arc<PipelineShared>,
    decode_thread: Option<JoinHandle<Result<(), PipelineError>>>,
    stopped: bool,
}

impl Pipeline {
    /// Open a decoder for the demuxer's format and start playing
    pub fn start(
        registry: &DecoderRegistry,
        demuxer: Box<dyn Demuxer>,
        sink: Box<dyn DisplaySink>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let format = demuxer.format();
        let session = Arc::new(DecoderSession::open(registry, format, config.session.clone())?);
        session.set_codec_config(demuxer.codec_config());

        let (count, geometry) = session.output_requirements()?;
        let frames = Arc::new(FramePool::new(count + config.display_frames, geometry));
        session.prepare(frames.clone())?;

        let sync = Arc::new(AvSyncController::new(config.sync.clone()));
        sync.set_output_latency(session.decoder_latency_us(), sink.latency_us());

        let clock = Arc::new(MediaClock::new());
        let recycler: Arc<dyn FrameRecycler> = session.clone();
        let scheduler = PresentationScheduler::start(
            config.scheduler.clone(),
            frames.clone(),
            clock.clone(),
            sink,
            recycler,
            config.audio_master.then(|| sync.clone()),
        )
        .map_err(|e| PipelineError::Spawn("presentation", e))?;
        let scheduler = Arc::new(scheduler);
        scheduler.request_resize(geometry);

        let shared = Arc::new(PipelineShared {
            should_stop: AtomicBool::new(false),
            seek_requested: AtomicBool::new(false),
            seek_target_us: AtomicI64::new(0),
            finished: AtomicBool::new(false),
            skipped_units: AtomicU64::new(0),
            pool_growths: AtomicU64::new(0),
            seeks: AtomicU64::new(0),
        });

        let context = DecodeContext {
            config: config.clone(),
            demuxer,
            session: session.clone(),
            scheduler: scheduler.clone(),
            frames: frames.clone(),
            clock: clock.clone(),
            sync: sync.clone(),
            shared: shared.clone(),
        };
        clock.start();
        let decode_thread = std::thread::Builder::new()
            .name("hwvid-decode".into())
            .spawn(move || decode_loop(context))
            .map_err(|e| PipelineError::Spawn("decode", e))?;

        tracing::info!(
            "Pipeline started: {:?} on {}, {} frames of {}x{}",
            format,
            session.component_name(),
            frames.capacity(),
            geometry.width,
            geometry.height
        );

        Ok(Self {
            config,
            session,
            scheduler,
            frames,
            clock,
            sync,
            shared,
            decode_thread: Some(decode_thread),
            stopped: false,
        })
    }

    // ========================================================================
    // Control
    // ========================================================================

    pub fn pause(&self) {
        self.clock.pause();
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
        self.clock.start();
    }

    /// Jump to `target_us`; handled by the decode thread
    pub fn seek(&self, target_us: i64) {
        self.shared.seek_target_us.store(target_us, Ordering::SeqCst);
        self.shared.seek_requested.store(true, Ordering::SeqCst);
    }

    /// Audio feedback for A/V sync
    pub fn report_audio_time(&self, t_us: i64) {
        self.sync.note_audio_ready();
        self.sync.on_audio_time(t_us);
    }

    pub fn media_time_us(&self) -> i64 {
        self.clock.now_us()
    }

    /// True once the decoder returned its last picture
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> &DecoderSession {
        &self.session
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            session: self.session.stats(),
            scheduler: self.scheduler.stats(),
            sync: self.sync.stats(),
            frame_pool: self.frames.stats(),
            skipped_units: self.shared.skipped_units.load(Ordering::Relaxed),
            pool_growths: self.shared.pool_growths.load(Ordering::Relaxed),
            seeks: self.shared.seeks.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Play to the end (or until `timeout`), then shut down
    pub fn wait(&mut self, timeout: Duration) -> Result<PipelineStats, PipelineError> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.scheduler.idle_wait_ms.max(1));
        while Instant::now() < deadline {
            let decode_done = self.decode_thread.as_ref().map_or(true, |t| t.is_finished());
            if decode_done && self.scheduler.queued() == 0 {
                break;
            }
            std::thread::sleep(poll);
        }
        if Instant::now() >= deadline {
            tracing::warn!("Pipeline did not finish within {:?}", timeout);
        }
        self.stop()
    }

    /// Stop everything and return the final statistics
    pub fn stop(&mut self) -> Result<PipelineStats, PipelineError> {
        if self.stopped {
            return Ok(self.stats());
        }
        self.stopped = true;

        self.shared.should_stop.store(true, Ordering::SeqCst);
        let mut result = Ok(());
        if let Some(thread) = self.decode_thread.take() {
            result = match thread.join() {
                Ok(r) => r,
                Err(_) => Err(PipelineError::ThreadPanicked),
            };
        }

        match Arc::get_mut(&mut self.scheduler) {
            Some(scheduler) => scheduler.stop(),
            None => tracing::warn!("Presentation scheduler still shared at shutdown"),
        }
        let closed = self.session.close();
        let stats = self.stats();
        closed?;
        result?;

        tracing::info!(
            "Pipeline stopped: {} rendered, {} dropped, {} decoded",
            stats.scheduler.rendered,
            stats.scheduler.dropped,
            stats.session.frames_output
        );
        Ok(stats)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("Pipeline shutdown: {}", e);
        }
    }
}

// ============================================================================
// Decode Thread
// ============================================================================

struct DecodeContext {
    config: PipelineConfig,
    demuxer: Box<dyn Demuxer>,
    session: Arc<DecoderSession>,
    scheduler: Arc<PresentationScheduler>,
    frames: Arc<FramePool>,
    clock: Arc<MediaClock>,
    sync: Arc<AvSyncController>,
    shared: Arc<PipelineShared>,
}

/// Unit being fed, with the bytes already accepted
struct PendingUnit {
    unit: CodedUnit,
    fed: usize,
}

fn decode_loop(mut ctx: DecodeContext) -> Result<(), PipelineError> {
    let poll = Duration::from_millis(ctx.config.scheduler.idle_wait_ms.max(1));
    let mut pending: Option<PendingUnit> = None;
    let mut input_done = false;
    let mut geometry = ctx.frames.geometry();

    while !ctx.shared.should_stop.load(Ordering::SeqCst) {
        if ctx.shared.seek_requested.swap(false, Ordering::SeqCst) {
            seek(&mut ctx)?;
            pending = None;
            input_done = false;
        }

        if ctx.config.audio_master && ctx.sync.take_skip_request() {
            let skipped = ctx.demuxer.skip_to_key_unit();
            tracing::info!("Video behind audio, skipped {} units to the next key unit", skipped);
            ctx.shared.skipped_units.fetch_add(skipped as u64, Ordering::Relaxed);
            pending = None;
        }

        let mut progressed = false;

        // Feed
        if !input_done {
            if pending.is_none() {
                match ctx.demuxer.read_unit() {
                    Some(unit) => pending = Some(PendingUnit { unit, fed: 0 }),
                    None => {
                        tracing::debug!("Demuxer exhausted, draining decoder");
                        ctx.session.drain()?;
                        input_done = true;
                    }
                }
            }
            if let Some(p) = pending.as_mut() {
                let consumed = ctx.session.feed(&p.unit)?;
                p.fed += consumed;
                if p.fed >= p.unit.data.len() {
                    pending = None;
                }
                progressed |= consumed > 0;
            }
        }

        // Drain
        loop {
            match ctx.session.drain_output() {
                Ok(Some(handle)) => {
                    progressed = true;
                    let frame_geometry = ctx.frames.read(&handle, |f| f.geometry);
                    if frame_geometry != geometry {
                        geometry = frame_geometry;
                        ctx.scheduler.request_resize(geometry);
                    }
                    if !wait_for_space(&ctx, poll) {
                        ctx.session.return_frame(handle)?;
                        break;
                    }
                    if let Err(handle) = ctx.scheduler.push(handle) {
                        ctx.session.return_frame(handle)?;
                    }
                }
                Ok(None) => break,
                Err(SessionError::GeometryGrowthRequired { required, geometry: new }) => {
                    grow_pool(&ctx, required, new)?;
                    progressed = true;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if input_done && ctx.session.is_drained() {
            tracing::info!("Decode finished");
            ctx.shared.finished.store(true, Ordering::SeqCst);
            break;
        }
        if !progressed {
            ctx.session.wait_output(Duration::from_millis(5));
        }
    }
    Ok(())
}

/// Wait for room in the presentation queue; false once stopping
fn wait_for_space(ctx: &DecodeContext, poll: Duration) -> bool {
    while !ctx.scheduler.wait_for_space(ctx.config.max_queued_frames, poll) {
        if ctx.shared.should_stop.load(Ordering::SeqCst) {
            return false;
        }
    }
    true
}

fn grow_pool(ctx: &DecodeContext, required: usize, geometry: FrameGeometry) -> Result<(), PipelineError> {
    let target = required + ctx.config.display_frames;
    ctx.frames.grow(target, geometry);
    ctx.shared.pool_growths.fetch_add(1, Ordering::Relaxed);
    ctx.session.prepare(ctx.frames.clone())?;
    Ok(())
}

fn seek(ctx: &mut DecodeContext) -> Result<(), PipelineError> {
    let target = ctx.shared.seek_target_us.load(Ordering::SeqCst);
    tracing::info!("Seeking to {}us", target);
    ctx.scheduler.flush();
    ctx.session.flush()?;
    ctx.sync.reset();
    if ctx.demuxer.seek(target) {
        ctx.clock.set_time(target);
    } else {
        tracing::warn!("Source cannot seek, continuing from the current position");
    }
    ctx.shared.seeks.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
