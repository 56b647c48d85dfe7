//! # Decoder Session
//!
//! Drives one hardware decoder through its command protocol and exchanges
//! buffers with it through an input and an output [`BufferPort`].
//!
//! ```text
//!  Closed ─open─► Opening ─► Idle ─prepare─► Executing ⇄ (reconfigure)
//!                                               │
//!                                  drain ──► Draining ──close──► Closing ─► Closed
//! ```
//!
//! Hardware callbacks only post [`HardwareEvent`]s into a bounded channel. A
//! dedicated event pump thread applies them to the ports and wakes whoever
//! waits for a command. Lock order is component → decode state → port; the
//! pump only ever takes port locks and the control lock.
//!
//! A fatal hardware error is latched and reported by every later call.

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{SessionConfig, EVENT_HEADROOM};
use crate::frame::{CropRect, FrameGeometry, FrameHandle, FramePool, InterlaceMode, UnitKind};
use crate::hardware::{
    event_channel, BufferFlags, CodecFormat, Command, ComponentState, DecoderComponent, DecoderRegistry, EventSink,
    HardwareEvent, HwError, HwErrorCode, OutputDone, PortDirection, PortGeometry,
};
use crate::port::{BufferPort, PortError, PortEvents, PortSnapshot, Submit};
use crate::reorder::{DisplayReorder, TimestampReorderMap};
use crate::scheduler::FrameRecycler;

// ============================================================================
// Errors
// ============================================================================

/// Qualifier for a fatal hardware failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// Stream profile or level beyond the hardware
    UnsupportedProfile,
    Generic,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No decoder available for {format:?} (tried: {tried:?})")]
    NoDecoder { format: CodecFormat, tried: Vec<String> },
    #[error("Output needs {required} frames of {}x{}; grow the frame pool and call prepare", geometry.width, geometry.height)]
    GeometryGrowthRequired { required: usize, geometry: FrameGeometry },
    #[error("Hardware decoder failed ({kind:?})")]
    HardwareFatal { kind: FatalKind },
    #[error("Buffer allocation failed: {0}")]
    AllocationFailure(String),
    #[error("{operation} is not allowed while {lifecycle:?}")]
    InvalidState { operation: &'static str, lifecycle: Lifecycle },
    #[error("Session is shutting down")]
    Cancelled,
    #[error("Timed out waiting for {0:?}")]
    CommandTimeout(Command),
    #[error(transparent)]
    Hardware(#[from] HwError),
    #[error(transparent)]
    Port(PortError),
}

impl From<PortError> for SessionError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::PoolExhausted { .. } | PortError::Hardware(HwError::AllocationFailed(_)) => {
                SessionError::AllocationFailure(e.to_string())
            }
            PortError::Hardware(e) => SessionError::Hardware(e),
            e => SessionError::Port(e),
        }
    }
}

// ============================================================================
// Public Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Closed,
    Opening,
    Idle,
    Executing,
    Draining,
    Closing,
}

/// One compressed access unit from the demuxer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedUnit {
    pub data: Bytes,
    /// Presentation timestamp, if the container has one
    pub timestamp_us: Option<i64>,
    pub duration_us: i64,
    pub kind: UnitKind,
    /// Opaque id carried through to the decoded frame
    pub user_id: u64,
    pub key: bool,
}

impl CodedUnit {
    pub fn picture(data: impl Into<Bytes>, timestamp_us: i64, user_id: u64, key: bool) -> Self {
        Self {
            data: data.into(),
            timestamp_us: Some(timestamp_us),
            duration_us: 0,
            kind: UnitKind::Picture,
            user_id,
            key,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub units_fed: u64,
    pub bytes_fed: u64,
    pub primers_sent: u64,
    pub frames_output: u64,
    pub decode_only_discarded: u64,
    pub untagged_frames: u64,
    pub reconfigurations: u64,
    pub flushes: u64,
    pub corrupt_reports: u64,
    /// Pictures the display reorder gave up waiting for
    pub lost_frames: u64,
    pub input_in_flight: usize,
    pub output_in_flight: usize,
}

// ============================================================================
// Internal State
// ============================================================================

/// State shared with the event pump
struct Control {
    lifecycle: Lifecycle,
    /// Commands completed by hardware, not yet consumed by a waiter
    completed: Vec<Command>,
    fatal: Option<SessionError>,
    corrupt_reports: u64,
}

struct SessionShared {
    control: Mutex<Control>,
    cond: Condvar,
    run: AtomicBool,
}

impl SessionShared {
    fn lifecycle(&self) -> Lifecycle {
        self.control.lock().lifecycle
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        let mut control = self.control.lock();
        if control.lifecycle != lifecycle {
            tracing::debug!("Session {:?} -> {:?}", control.lifecycle, lifecycle);
            control.lifecycle = lifecycle;
        }
        drop(control);
        self.cond.notify_all();
    }

    fn latch_fatal(&self, error: SessionError) {
        let mut control = self.control.lock();
        if control.fatal.is_none() {
            tracing::error!("Decoder session failed: {}", error);
            control.fatal = Some(error);
        }
        drop(control);
        self.cond.notify_all();
    }

    fn check_fatal(&self) -> Result<(), SessionError> {
        match &self.control.lock().fatal {
            Some(e) => Err(replay(e)),
            None => Ok(()),
        }
    }
}

/// A fresh copy of a latched error
fn replay(e: &SessionError) -> SessionError {
    match e {
        SessionError::NoDecoder { format, tried } => SessionError::NoDecoder {
            format: *format,
            tried: tried.clone(),
        },
        SessionError::GeometryGrowthRequired { required, geometry } => SessionError::GeometryGrowthRequired {
            required: *required,
            geometry: *geometry,
        },
        SessionError::HardwareFatal { kind } => SessionError::HardwareFatal { kind: *kind },
        SessionError::AllocationFailure(msg) => SessionError::AllocationFailure(msg.clone()),
        SessionError::InvalidState { operation, lifecycle } => SessionError::InvalidState {
            operation: *operation,
            lifecycle: *lifecycle,
        },
        SessionError::Cancelled => SessionError::Cancelled,
        SessionError::CommandTimeout(command) => SessionError::CommandTimeout(*command),
        // Not Clone; the message is what callers see
        SessionError::Hardware(e) => SessionError::AllocationFailure(e.to_string()),
        SessionError::Port(e) => SessionError::AllocationFailure(e.to_string()),
    }
}

/// Unit that did not fit in the free input descriptors
struct PartialUnit {
    user_id: u64,
    len: usize,
    offset: usize,
    decode_id: u32,
}

/// Decode-side bookkeeping, guarded by one lock
struct DecodeState {
    reorder: TimestampReorderMap,
    display: DisplayReorder<FrameHandle>,
    /// Pictures without a timestamp, handed out in completion order
    passthrough: VecDeque<FrameHandle>,
    partial: Option<PartialUnit>,
    primer_pending: bool,
    codec_config: Bytes,
    crop: Option<CropRect>,
    interlace: InterlaceMode,
    last_duration_us: i64,
    eos_output_seen: bool,
    /// Output port torn down, waiting for a bigger pool
    pending_growth: Option<(usize, FrameGeometry)>,
    stats: SessionStats,
}

// ============================================================================
// Decoder Session
// ============================================================================

pub struct DecoderSession {
    config: SessionConfig,
    format: CodecFormat,
    component_name: String,
    echoes_timestamps: bool,
    decoder_latency_us: i64,
    component: Mutex<Box<dyn DecoderComponent>>,
    input: Arc<BufferPort>,
    output: Arc<BufferPort>,
    shared: Arc<SessionShared>,
    decode: Mutex<DecodeState>,
    frames: RwLock<Option<Arc<FramePool>>>,
    events: EventSink,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl DecoderSession {
    // ========================================================================
    // Open
    // ========================================================================

    /// Open the first candidate decoder for `format` that accepts the stream
    /// and bring it to `Idle` with its input pool allocated.
    pub fn open(registry: &DecoderRegistry, format: CodecFormat, config: SessionConfig) -> Result<Self, SessionError> {
        let mut tried = Vec::new();

        for (candidate, loader) in registry.candidates(format) {
            tried.push(candidate.name.clone());
            let depth = config
                .event_queue_depth
                .max(config.input_buffers + config.output_buffers + EVENT_HEADROOM);
            let (events, rx) = event_channel(depth);
            let component = match loader.open(&candidate, events.clone()) {
                Ok(component) => component,
                Err(HwError::Refused(name)) => {
                    tracing::info!("Decoder {} refused {:?}, trying next", name, format);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Decoder {} failed to open: {}", candidate.name, e);
                    continue;
                }
            };

            let session = Self::with_component(component, format, config.clone(), events, rx);
            match session.bring_up() {
                Ok(()) => {
                    tracing::info!("Opened {} for {:?}", session.component_name, format);
                    return Ok(session);
                }
                Err(e) => {
                    tracing::warn!("Decoder {} failed to start: {}", candidate.name, e);
                    if let Err(e) = session.close() {
                        tracing::debug!("Closing {} after failed start: {}", candidate.name, e);
                    }
                }
            }
        }

        tracing::error!("No decoder for {:?} (tried {:?})", format, tried);
        Err(SessionError::NoDecoder { format, tried })
    }

    fn with_component(
        component: Box<dyn DecoderComponent>,
        format: CodecFormat,
        config: SessionConfig,
        events: EventSink,
        rx: Receiver<HardwareEvent>,
    ) -> Self {
        let input = Arc::new(BufferPort::new(PortDirection::Input));
        let output = Arc::new(BufferPort::new(PortDirection::Output));
        let shared = Arc::new(SessionShared {
            control: Mutex::new(Control {
                lifecycle: Lifecycle::Opening,
                completed: Vec::new(),
                fatal: None,
                corrupt_reports: 0,
            }),
            cond: Condvar::new(),
            run: AtomicBool::new(true),
        });

        let pump = {
            let watch = events.clone();
            let shared = shared.clone();
            let input = input.clone();
            let output = output.clone();
            std::thread::Builder::new()
                .name("hwvid-events".into())
                .spawn(move || event_pump(rx, watch, shared, input, output))
        };
        let pump = match pump {
            Ok(handle) => Some(handle),
            Err(e) => {
                shared.latch_fatal(SessionError::AllocationFailure(format!("event pump: {}", e)));
                None
            }
        };

        let echoes_timestamps = component.echoes_timestamps();
        Self {
            component_name: component.name().to_string(),
            echoes_timestamps,
            decoder_latency_us: component.latency_us(),
            component: Mutex::new(component),
            decode: Mutex::new(DecodeState {
                reorder: TimestampReorderMap::new(echoes_timestamps),
                display: DisplayReorder::new(config.reorder_window),
                passthrough: VecDeque::new(),
                partial: None,
                primer_pending: format.requires_primer(),
                codec_config: Bytes::new(),
                crop: None,
                interlace: InterlaceMode::Progressive,
                last_duration_us: 0,
                eos_output_seen: false,
                pending_growth: None,
                stats: SessionStats::default(),
            }),
            config,
            format,
            input,
            output,
            shared,
            frames: RwLock::new(None),
            events,
            pump: Mutex::new(pump),
        }
    }

    /// Loaded → Idle with the output port disabled until `prepare`
    fn bring_up(&self) -> Result<(), SessionError> {
        self.shared.check_fatal()?;
        let mut comp = self.component.lock();

        let mut geometry = comp.port_geometry(PortDirection::Input)?;
        geometry.buffer_count = self.config.input_buffers.max(geometry.buffer_count_min);
        geometry.buffer_size = self.config.input_buffer_size.max(geometry.buffer_size);
        comp.set_port_geometry(PortDirection::Input, &geometry)?;

        self.send_and_wait(comp.as_mut(), Command::PortDisable(PortDirection::Output))?;
        self.input
            .allocate(comp.as_mut(), geometry, self.config.max_in_flight_input, None, Duration::ZERO)?;
        self.send_and_wait(comp.as_mut(), Command::StateSet(ComponentState::Idle))?;
        self.shared.set_lifecycle(Lifecycle::Idle);
        Ok(())
    }

    /// Codec configuration sent as the primer unit for formats that need one
    pub fn set_codec_config(&self, data: Bytes) {
        self.decode.lock().codec_config = data;
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.config.command_timeout_ms)
    }

    /// Send a command and block until hardware reports it complete.
    ///
    /// A command the hardware refuses to start is fatal.
    fn send_and_wait(&self, comp: &mut dyn DecoderComponent, command: Command) -> Result<(), SessionError> {
        if let Err(e) = comp.send_command(command) {
            tracing::error!("{} rejected {:?}: {}", self.component_name, command, e);
            self.shared.latch_fatal(SessionError::HardwareFatal {
                kind: FatalKind::Generic,
            });
            return Err(SessionError::Hardware(e));
        }
        self.wait_command(command)
    }

    fn wait_command(&self, command: Command) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.command_timeout();
        let mut control = self.shared.control.lock();
        loop {
            if let Some(pos) = control.completed.iter().position(|c| *c == command) {
                control.completed.remove(pos);
                return Ok(());
            }
            if let Some(e) = &control.fatal {
                return Err(replay(e));
            }
            if !self.shared.run.load(Ordering::SeqCst) {
                return Err(SessionError::Cancelled);
            }
            if self.shared.cond.wait_until(&mut control, deadline).timed_out() {
                tracing::error!("{} did not complete {:?}", self.component_name, command);
                return Err(SessionError::CommandTimeout(command));
            }
        }
    }

    fn require(&self, operation: &'static str, allowed: &[Lifecycle]) -> Result<Lifecycle, SessionError> {
        self.shared.check_fatal()?;
        let lifecycle = self.shared.lifecycle();
        if allowed.contains(&lifecycle) {
            Ok(lifecycle)
        } else {
            Err(SessionError::InvalidState { operation, lifecycle })
        }
    }

    // ========================================================================
    // Prepare / Reconfigure
    // ========================================================================

    /// Output buffer count and picture geometry the decoder currently wants
    pub fn output_requirements(&self) -> Result<(usize, FrameGeometry), SessionError> {
        let geometry = self.component.lock().port_geometry(PortDirection::Output)?;
        Ok((self.output_count(&geometry), geometry.frame))
    }

    fn output_count(&self, geometry: &PortGeometry) -> usize {
        geometry.buffer_count_min.max(self.config.output_buffers).max(1)
    }

    /// Frames needed from the pool: the new output buffers plus the decoded
    /// pictures still waiting to be handed out
    fn frames_required(decode: &DecodeState, count: usize) -> usize {
        count + decode.display.held() + decode.passthrough.len()
    }

    /// Hold back fewer pictures than there are output buffers, so the
    /// decoder always has a buffer for the picture the reorder waits for
    fn fit_reorder_window(&self, decode: &mut DecodeState, count: usize) {
        decode.display.set_window(self.config.reorder_window.min(count.saturating_sub(1)));
    }

    /// Size the output pool from `frames` and start decoding.
    ///
    /// From `Idle` this enables the output port and moves to `Executing`.
    /// Once executing, only the output port is disabled, rebuilt and
    /// re-enabled; the input pool is reused.
    pub fn prepare(&self, frames: Arc<FramePool>) -> Result<(), SessionError> {
        let lifecycle = self.require("prepare", &[Lifecycle::Idle, Lifecycle::Executing, Lifecycle::Draining])?;
        let mut comp = self.component.lock();
        let mut decode = self.decode.lock();

        if lifecycle != Lifecycle::Idle && self.output.is_enabled() {
            self.disable_output(comp.as_mut(), &mut decode)?;
        }
        *self.frames.write() = Some(frames.clone());

        let geometry = comp.port_geometry(PortDirection::Output)?;
        let count = self.output_count(&geometry);
        let needed = self.input.buffer_count() + count + EVENT_HEADROOM;
        if needed > self.events.capacity() {
            return Err(SessionError::AllocationFailure(format!(
                "event queue of {} cannot carry completions for {} buffers",
                self.events.capacity(),
                self.input.buffer_count() + count
            )));
        }
        let required = Self::frames_required(&decode, count);
        if required > frames.capacity() {
            decode.pending_growth = Some((required, geometry.frame));
            return Err(SessionError::GeometryGrowthRequired {
                required,
                geometry: geometry.frame,
            });
        }
        self.enable_output(comp.as_mut(), &frames, geometry, count)?;
        self.fit_reorder_window(&mut decode, count);
        decode.pending_growth = None;

        if lifecycle == Lifecycle::Idle {
            self.send_and_wait(comp.as_mut(), Command::StateSet(ComponentState::Executing))?;
            self.input.set_enabled(true);
            self.shared.set_lifecycle(Lifecycle::Executing);
        }
        self.output.submit_all_outputs(comp.as_mut())?;
        tracing::info!(
            "{} executing: {} output buffers of {}x{}",
            self.component_name,
            count,
            geometry.frame.width,
            geometry.frame.height
        );
        Ok(())
    }

    fn enable_output(
        &self,
        comp: &mut dyn DecoderComponent,
        frames: &Arc<FramePool>,
        mut geometry: PortGeometry,
        count: usize,
    ) -> Result<(), SessionError> {
        geometry.buffer_count = count;
        geometry.buffer_size = geometry.buffer_size.max(geometry.frame.buffer_size());
        comp.set_port_geometry(PortDirection::Output, &geometry)?;
        frames.set_geometry(geometry.frame);

        if let Err(e) = self.output.allocate(comp, geometry, count, Some(frames), self.command_timeout()) {
            let e = SessionError::from(e);
            if matches!(e, SessionError::AllocationFailure(_)) {
                self.shared.latch_fatal(replay(&e));
            }
            return Err(e);
        }
        self.send_and_wait(comp, Command::PortEnable(PortDirection::Output))?;
        self.output.set_discarding(false);
        self.output.set_enabled(true);
        Ok(())
    }

    /// Take every output buffer back from hardware and free the pool
    fn disable_output(&self, comp: &mut dyn DecoderComponent, decode: &mut DecodeState) -> Result<(), SessionError> {
        // Pictures already decoded still get presented
        while let Some(handle) = self.output.pop_completed() {
            self.resolve_completed(&mut *comp, decode, handle)?;
        }

        self.output.set_discarding(true);
        self.output.set_enabled(false);
        self.send_and_wait(comp, Command::PortDisable(PortDirection::Output))?;
        if !self.output.wait_drained(self.command_timeout(), &self.shared.run) {
            return Err(SessionError::CommandTimeout(Command::PortDisable(PortDirection::Output)));
        }
        let returned = self.output.free_all(comp)?;
        self.release_to_pool(returned);
        Ok(())
    }

    /// Apply port change notifications posted by the event pump
    fn apply_port_events(&self, comp: &mut dyn DecoderComponent, decode: &mut DecodeState) -> Result<(), SessionError> {
        let input_changes = self.input.take_changes();
        if !input_changes.events.is_empty() {
            tracing::warn!("Ignoring settings change on the input port: {:?}", input_changes.events);
        }

        let changes = self.output.take_changes();
        if let Some(crop) = changes.crop {
            tracing::debug!("Crop changed to {}x{}+{}+{}", crop.width, crop.height, crop.left, crop.top);
            decode.crop = Some(crop);
        }
        if let Some(mode) = changes.interlace {
            tracing::debug!("Interlace mode changed to {:?}", mode);
            decode.interlace = mode;
        }
        if changes.events.contains(PortEvents::RECONFIGURE) {
            self.reconfigure_output(comp, decode)?;
        }
        Ok(())
    }

    /// Renegotiate the output pool after the decoder changed its needs
    fn reconfigure_output(&self, comp: &mut dyn DecoderComponent, decode: &mut DecodeState) -> Result<(), SessionError> {
        let geometry = comp.port_geometry(PortDirection::Output)?;
        let count = self.output_count(&geometry);
        tracing::info!(
            "Output reconfigure: {}x{}, {} buffers",
            geometry.frame.width,
            geometry.frame.height,
            count
        );
        decode.stats.reconfigurations += 1;

        self.disable_output(comp, decode)?;

        let Some(frames) = self.frames.read().clone() else {
            return Err(SessionError::InvalidState {
                operation: "reconfigure",
                lifecycle: self.shared.lifecycle(),
            });
        };
        let required = Self::frames_required(decode, count);
        if required > frames.capacity() {
            tracing::info!("Frame pool of {} too small, need {}", frames.capacity(), required);
            decode.pending_growth = Some((required, geometry.frame));
            return Err(SessionError::GeometryGrowthRequired {
                required,
                geometry: geometry.frame,
            });
        }
        self.enable_output(comp, &frames, geometry, count)?;
        self.fit_reorder_window(decode, count);
        self.output.submit_all_outputs(comp)?;
        Ok(())
    }

    // ========================================================================
    // Feed
    // ========================================================================

    /// Copy as much of `unit` as fits into free input buffers and submit it.
    ///
    /// Returns the bytes consumed; 0 means no input buffer was free and the
    /// caller should retry. A partly consumed unit is resumed when the caller
    /// presents the same unit again. Empty units are ignored.
    pub fn feed(&self, unit: &CodedUnit) -> Result<usize, SessionError> {
        self.require("feed", &[Lifecycle::Executing])?;
        if unit.data.is_empty() {
            return Ok(0);
        }
        let mut comp = self.component.lock();
        let mut decode = self.decode.lock();
        let decode = &mut *decode;

        if decode.primer_pending && !self.submit_primer(comp.as_mut(), decode)? {
            return Ok(0);
        }

        let len = unit.data.len();
        let (mut offset, mut decode_id) = match decode.partial.take() {
            Some(p) if p.user_id == unit.user_id && p.len == len => (p.offset, Some(p.decode_id)),
            Some(p) => {
                tracing::warn!("Abandoning unit {} after {} of {} bytes", p.user_id, p.offset, p.len);
                (0, None)
            }
            None => (0, None),
        };

        let chunk_size = self.input.geometry().buffer_size.max(1);
        let mut consumed = 0;
        while offset < len {
            let Some(index) = self.input.acquire_free() else {
                break;
            };
            let tag = match decode_id {
                Some(id) => id,
                None => {
                    let id = decode.reorder.record(unit.kind, unit.user_id, unit.timestamp_us, unit.key);
                    if let (UnitKind::Picture, Some(ts)) = (unit.kind, unit.timestamp_us) {
                        decode.display.expect(ts);
                    }
                    if unit.duration_us > 0 {
                        decode.last_duration_us = unit.duration_us;
                    }
                    decode.stats.units_fed += 1;
                    decode_id = Some(id);
                    id
                }
            };

            let end = (offset + chunk_size).min(len);
            let mut flags = BufferFlags::NONE;
            if end == len {
                flags |= BufferFlags::END_OF_UNIT;
            }
            if unit.key {
                flags |= BufferFlags::KEY_UNIT;
            }
            if unit.kind == UnitKind::DecodeOnly {
                flags |= BufferFlags::DECODE_ONLY;
            }
            if unit.timestamp_us.is_none() {
                flags |= BufferFlags::TIME_UNKNOWN;
            }

            match self.input.submit_input(
                comp.as_mut(),
                index,
                &unit.data[offset..end],
                tag,
                unit.timestamp_us,
                flags,
            )? {
                Submit::Submitted => {
                    consumed += end - offset;
                    offset = end;
                }
                Submit::Busy => break,
            }
        }

        if offset < len {
            if let Some(decode_id) = decode_id {
                decode.partial = Some(PartialUnit {
                    user_id: unit.user_id,
                    len,
                    offset,
                    decode_id,
                });
            }
        }
        decode.stats.bytes_fed += consumed as u64;
        Ok(consumed)
    }

    fn submit_primer(&self, comp: &mut dyn DecoderComponent, decode: &mut DecodeState) -> Result<bool, SessionError> {
        let Some(index) = self.input.acquire_free() else {
            return Ok(false);
        };
        let tag = decode.reorder.record(UnitKind::Primer, 0, None, false);
        let flags = BufferFlags::CODEC_CONFIG | BufferFlags::END_OF_UNIT;
        let config = decode.codec_config.clone();
        if self.input.submit_input(comp, index, &config, tag, None, flags)? == Submit::Busy {
            return Ok(false);
        }
        tracing::debug!("Sent {} byte primer unit", config.len());
        decode.primer_pending = false;
        decode.stats.primers_sent += 1;
        Ok(true)
    }

    /// Like [`DecoderSession::feed`], but waits up to `timeout` for an input
    /// buffer instead of returning 0 straight away.
    pub fn feed_timeout(&self, unit: &CodedUnit, timeout: Duration) -> Result<usize, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let consumed = self.feed(unit)?;
            if consumed > 0 || unit.data.is_empty() {
                return Ok(consumed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            if self.input.acquire_free_timeout(deadline - now, &self.shared.run).is_none() {
                if !self.shared.run.load(Ordering::SeqCst) {
                    return Err(SessionError::Cancelled);
                }
                self.shared.check_fatal()?;
                return Ok(0);
            }
        }
    }

    /// Submit the end-of-stream marker. Decoding continues until the decoder
    /// returns the last picture; see [`DecoderSession::is_drained`].
    pub fn drain(&self) -> Result<(), SessionError> {
        self.require("drain", &[Lifecycle::Executing])?;
        let index = match self.input.acquire_free() {
            Some(index) => index,
            None => self
                .input
                .acquire_free_timeout(self.command_timeout(), &self.shared.run)
                .ok_or_else(|| SessionError::Port(PortError::BuffersInFlight(self.input.in_flight())))?,
        };
        let mut comp = self.component.lock();
        let mut decode = self.decode.lock();
        if let Some(p) = decode.partial.take() {
            tracing::warn!("Draining with unit {} only partly fed", p.user_id);
        }
        match self
            .input
            .submit_input(comp.as_mut(), index, &[], 0, None, BufferFlags::END_OF_STREAM)?
        {
            Submit::Submitted => {
                tracing::debug!("End of stream submitted");
                self.shared.set_lifecycle(Lifecycle::Draining);
                Ok(())
            }
            Submit::Busy => Err(SessionError::Port(PortError::BuffersInFlight(self.input.in_flight()))),
        }
    }

    /// True once the end-of-stream picture came back and every decoded
    /// picture has been handed out
    pub fn is_drained(&self) -> bool {
        let decode = self.decode.lock();
        decode.eos_output_seen
            && decode.display.held() == 0
            && decode.passthrough.is_empty()
            && self.output.completed_len() == 0
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Next decoded picture in presentation order, if one is ready.
    ///
    /// Frame metadata (timestamp, identity, crop, interlace) is written into
    /// the frame pool before the handle is returned. Pending port events are
    /// applied first; an output reconfiguration may surface here as
    /// [`SessionError::GeometryGrowthRequired`].
    pub fn drain_output(&self) -> Result<Option<FrameHandle>, SessionError> {
        self.require("drain_output", &[Lifecycle::Executing, Lifecycle::Draining])?;
        let mut comp = self.component.lock();
        let mut decode = self.decode.lock();
        let decode = &mut *decode;

        if let Some((required, geometry)) = decode.pending_growth {
            return Err(SessionError::GeometryGrowthRequired { required, geometry });
        }
        self.apply_port_events(comp.as_mut(), decode)?;

        loop {
            if let Some(handle) = decode.passthrough.pop_front() {
                return Ok(Some(self.hand_out(decode, handle)));
            }
            if let Some((_, handle)) = decode.display.pop_ready() {
                return Ok(Some(self.hand_out(decode, handle)));
            }
            match self.output.pop_completed() {
                Some(handle) => self.resolve_completed(comp.as_mut(), decode, handle)?,
                None => {
                    if decode.eos_output_seen {
                        if let Some((_, handle)) = decode.display.pop_any() {
                            return Ok(Some(self.hand_out(decode, handle)));
                        }
                    }
                    // Resubmit buffers returned while the component lock was busy
                    if self.output.is_enabled() {
                        self.output.submit_all_outputs(comp.as_mut())?;
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Like [`DecoderSession::drain_output`], waiting up to `timeout` for a
    /// picture to complete.
    pub fn drain_output_timeout(&self, timeout: Duration) -> Result<Option<FrameHandle>, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(handle) = self.drain_output()? {
                return Ok(Some(handle));
            }
            let now = Instant::now();
            if now >= deadline || !self.shared.run.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.output.wait_completion(deadline - now);
        }
    }

    fn hand_out(&self, decode: &mut DecodeState, handle: FrameHandle) -> FrameHandle {
        decode.stats.frames_output += 1;
        handle
    }

    /// Identify one completed output buffer.
    ///
    /// Pictures with a known timestamp go into the display reorder, pictures
    /// without one into the passthrough queue (no ordering is possible).
    /// Decode-only pictures and the end-of-stream marker go straight back to
    /// hardware.
    fn resolve_completed(
        &self,
        comp: &mut dyn DecoderComponent,
        decode: &mut DecodeState,
        handle: FrameHandle,
    ) -> Result<(), SessionError> {
        let Some((_, done)) = self.output.claim(handle.slot()) else {
            tracing::warn!("Completed frame slot {} has no claimable descriptor", handle.slot());
            return self.recycle_output(Some(comp), handle);
        };

        if done.flags.contains(BufferFlags::END_OF_STREAM) {
            tracing::debug!("End of stream reached");
            decode.eos_output_seen = true;
            if done.filled_len == 0 {
                return self.recycle_output(Some(comp), handle);
            }
        }

        if done.flags.contains(BufferFlags::CORRUPT) {
            tracing::debug!("Decoder flagged picture in buffer {} as damaged", done.index);
            self.shared.control.lock().corrupt_reports += 1;
        }
        let (kind, user_id, timestamp_us, key) = self.identify(decode, &done);
        if kind != UnitKind::Picture {
            decode.stats.decode_only_discarded += 1;
            return self.recycle_output(Some(comp), handle);
        }

        let Some(frames) = self.frames.read().clone() else {
            return Err(SessionError::InvalidState {
                operation: "drain_output",
                lifecycle: self.shared.lifecycle(),
            });
        };
        let crop = decode.crop;
        let interlace = decode.interlace;
        let duration_us = decode.last_duration_us;
        frames.update(&handle, |f| {
            // Geometry was stamped on the frame when the port took it
            f.crop = crop.unwrap_or_else(|| CropRect::full(f.geometry));
            f.interlace = interlace;
            f.timestamp_us = timestamp_us.unwrap_or(0);
            f.target_time_us = timestamp_us.unwrap_or(0);
            f.duration_us = duration_us;
            f.user_id = user_id;
            f.kind = kind;
            f.key = key;
            f.filled_len = done.filled_len;
            f.valid = timestamp_us.is_some();
        });

        match timestamp_us {
            Some(ts) => decode.display.insert(ts, handle),
            None => decode.passthrough.push_back(handle),
        }
        Ok(())
    }

    /// Recover (kind, user id, timestamp, key) for a completed picture
    fn identify(&self, decode: &mut DecodeState, done: &OutputDone) -> (UnitKind, u64, Option<i64>, bool) {
        let flag_kind = if done.flags.contains(BufferFlags::DECODE_ONLY) {
            UnitKind::DecodeOnly
        } else {
            UnitKind::Picture
        };
        let key = done.flags.contains(BufferFlags::KEY_UNIT);

        if !self.echoes_timestamps {
            // Strict FIFO: completions arrive in submission order
            let ts = decode.reorder.pop_timestamp();
            if ts.is_none() {
                decode.stats.untagged_frames += 1;
            }
            return (flag_kind, 0, ts, key);
        }
        match decode.reorder.lookup(done.tag) {
            Some(entry) => (entry.kind, entry.user_id, entry.timestamp_us, entry.key),
            None => {
                tracing::debug!("No reorder entry for tag {}", done.tag);
                decode.stats.untagged_frames += 1;
                (flag_kind, 0, done.timestamp_us, key)
            }
        }
    }

    /// Give a frame back to its descriptor (resubmitting if the component is
    /// at hand), or to the pool if its descriptor is gone.
    fn recycle_output(&self, comp: Option<&mut dyn DecoderComponent>, handle: FrameHandle) -> Result<(), SessionError> {
        match self.output.reclaim(handle) {
            Ok(index) => {
                if let Some(comp) = comp {
                    if self.output.is_enabled() && self.shared.lifecycle() != Lifecycle::Closing {
                        self.output.submit_output(comp, index)?;
                    }
                }
            }
            Err(handle) => self.release_to_pool(vec![handle]),
        }
        Ok(())
    }

    fn release_to_pool(&self, handles: Vec<FrameHandle>) {
        if handles.is_empty() {
            return;
        }
        match self.frames.read().as_ref() {
            Some(frames) => {
                for handle in handles {
                    frames.release(handle);
                }
            }
            None => tracing::error!("{} frames returned with no frame pool", handles.len()),
        }
    }

    /// Hand a frame back after presentation.
    ///
    /// Never blocks on the component: if another thread holds it, the
    /// descriptor stays `Ready` and is resubmitted by the next
    /// [`DecoderSession::drain_output`].
    pub fn return_frame(&self, handle: FrameHandle) -> Result<(), SessionError> {
        let healthy = self.shared.check_fatal().is_ok();
        match self.output.reclaim(handle) {
            Ok(index) => {
                if !healthy || !self.output.is_enabled() {
                    return Ok(());
                }
                if let Some(mut comp) = self.component.try_lock() {
                    if matches!(self.shared.lifecycle(), Lifecycle::Executing | Lifecycle::Draining) {
                        self.output.submit_output(comp.as_mut(), index)?;
                    }
                }
                Ok(())
            }
            Err(handle) => {
                self.release_to_pool(vec![handle]);
                Ok(())
            }
        }
    }

    /// Wait until an output completion or port event arrives
    pub fn wait_output(&self, timeout: Duration) -> bool {
        self.output.wait_completion(timeout)
    }

    // ========================================================================
    // Flush / Close
    // ========================================================================

    /// Discard everything in flight (seek). Frames already handed out stay
    /// valid and are returned as usual.
    pub fn flush(&self) -> Result<(), SessionError> {
        self.require("flush", &[Lifecycle::Executing, Lifecycle::Draining])?;
        let mut comp = self.component.lock();
        let mut decode = self.decode.lock();
        let decode = &mut *decode;

        self.output.set_discarding(true);
        self.send_and_wait(comp.as_mut(), Command::Flush(PortDirection::Input))?;
        self.send_and_wait(comp.as_mut(), Command::Flush(PortDirection::Output))?;
        let timeout = self.command_timeout();
        if !self.input.wait_drained(timeout, &self.shared.run) || !self.output.wait_drained(timeout, &self.shared.run) {
            return Err(SessionError::CommandTimeout(Command::Flush(PortDirection::Output)));
        }

        let orphans = self.output.recycle_completed();
        self.release_to_pool(orphans);
        let mut held: Vec<FrameHandle> = decode.passthrough.drain(..).collect();
        held.extend(decode.display.reset());
        for handle in held {
            if let Err(handle) = self.output.reclaim(handle) {
                self.release_to_pool(vec![handle]);
            }
        }
        decode.partial = None;
        decode.reorder.reset();
        decode.primer_pending = self.format.requires_primer();
        decode.eos_output_seen = false;
        decode.stats.flushes += 1;

        self.output.set_discarding(false);
        self.shared.set_lifecycle(Lifecycle::Executing);
        if self.output.is_enabled() {
            self.output.submit_all_outputs(comp.as_mut())?;
        }
        tracing::debug!("Session flushed");
        Ok(())
    }

    /// Tear the session down.
    ///
    /// A healthy component is walked back to `Loaded` first. Then the run
    /// flag is cleared, every waiter woken and the event pump joined, and only
    /// after that are the buffer pools freed.
    pub fn close(&self) -> Result<(), SessionError> {
        let lifecycle = self.shared.lifecycle();
        if lifecycle == Lifecycle::Closed {
            return Ok(());
        }
        self.shared.set_lifecycle(Lifecycle::Closing);
        let healthy = self.shared.check_fatal().is_ok();
        let mut comp = self.component.lock();
        let mut first_error = None;

        if healthy {
            if matches!(lifecycle, Lifecycle::Executing | Lifecycle::Draining) {
                self.output.set_discarding(true);
                if let Err(e) = self.send_and_wait(comp.as_mut(), Command::StateSet(ComponentState::Idle)) {
                    first_error.get_or_insert(e);
                }
            }
            if matches!(lifecycle, Lifecycle::Executing | Lifecycle::Draining | Lifecycle::Idle) {
                let timeout = self.command_timeout();
                self.input.wait_drained(timeout, &self.shared.run);
                self.output.wait_drained(timeout, &self.shared.run);
                if let Err(e) = self.send_and_wait(comp.as_mut(), Command::StateSet(ComponentState::Loaded)) {
                    first_error.get_or_insert(e);
                }
            }
        }

        // Signal, join, then free
        self.shared.run.store(false, Ordering::SeqCst);
        self.shared.cond.notify_all();
        self.input.notify_all();
        self.output.notify_all();
        self.events.post(HardwareEvent::Shutdown);
        if let Some(pump) = self.pump.lock().take() {
            if pump.join().is_err() {
                tracing::error!("Event pump panicked");
            }
        }

        let mut decode = self.decode.lock();
        for port in [&self.input, &self.output] {
            let returned = if healthy {
                match port.free_all(comp.as_mut()) {
                    Ok(returned) => returned,
                    Err(e) => {
                        tracing::warn!("{:?} port not freed cleanly: {}", port.direction(), e);
                        port.forget_all()
                    }
                }
            } else {
                // Hardware may still hold buffers; nothing more can be done
                port.forget_all()
            };
            self.release_to_pool(returned);
        }
        let mut held: Vec<FrameHandle> = decode.passthrough.drain(..).collect();
        held.extend(decode.display.reset());
        self.release_to_pool(held);
        decode.partial = None;
        drop(decode);
        drop(comp);

        self.shared.set_lifecycle(Lifecycle::Closed);
        tracing::info!("Closed {}", self.component_name);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    pub fn format(&self) -> CodecFormat {
        self.format
    }

    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    pub fn echoes_timestamps(&self) -> bool {
        self.echoes_timestamps
    }

    pub fn decoder_latency_us(&self) -> i64 {
        self.decoder_latency_us
    }

    /// Latched fatal error, if any
    pub fn fatal_error(&self) -> Option<SessionError> {
        self.shared.check_fatal().err()
    }

    pub fn frame_pool(&self) -> Option<Arc<FramePool>> {
        self.frames.read().clone()
    }

    pub fn input_snapshot(&self) -> PortSnapshot {
        self.input.snapshot()
    }

    pub fn output_snapshot(&self) -> PortSnapshot {
        self.output.snapshot()
    }

    pub fn stats(&self) -> SessionStats {
        let decode = self.decode.lock();
        let mut stats = decode.stats.clone();
        stats.lost_frames = decode.display.lost();
        stats.corrupt_reports = self.shared.control.lock().corrupt_reports;
        stats.input_in_flight = self.input.in_flight();
        stats.output_in_flight = self.output.in_flight();
        stats
    }
}

impl FrameRecycler for DecoderSession {
    fn return_frame(&self, handle: FrameHandle) {
        if let Err(e) = DecoderSession::return_frame(self, handle) {
            tracing::warn!("Returning frame failed: {}", e);
        }
    }
}

impl Drop for DecoderSession {
    fn drop(&mut self) {
        if self.shared.lifecycle() != Lifecycle::Closed {
            if let Err(e) = self.close() {
                tracing::warn!("Session close on drop: {}", e);
            }
        }
    }
}

// ============================================================================
// Event Pump
// ============================================================================

/// How often an idle pump checks the run flag
const PUMP_POLL: Duration = Duration::from_millis(50);

/// Applies hardware events. Never touches the component.
fn event_pump(
    rx: Receiver<HardwareEvent>,
    events: EventSink,
    shared: Arc<SessionShared>,
    input: Arc<BufferPort>,
    output: Arc<BufferPort>,
) {
    let port = |direction: PortDirection| match direction {
        PortDirection::Input => &input,
        PortDirection::Output => &output,
    };
    let mut lost_seen = 0;

    loop {
        // A lost completion leaves a buffer marked as owned by hardware
        let lost = events.lost_events();
        if lost > lost_seen {
            lost_seen = lost;
            tracing::error!("{} hardware events lost, buffer ownership no longer known", lost);
            shared.latch_fatal(SessionError::HardwareFatal { kind: FatalKind::Generic });
            input.notify_all();
            output.notify_all();
        }

        let event = match rx.recv_timeout(PUMP_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) if shared.run.load(Ordering::SeqCst) => continue,
            Err(_) => break,
        };
        match event {
            HardwareEvent::Shutdown => break,
            HardwareEvent::CommandComplete(command) => {
                shared.control.lock().completed.push(command);
                shared.cond.notify_all();
            }
            HardwareEvent::InputDone { index } => input.on_input_done(index),
            HardwareEvent::OutputDone(done) => output.on_output_done(done),
            HardwareEvent::PortSettingsChanged { direction, change } => port(direction).post_change(change),
            HardwareEvent::Error(code) => {
                if code.is_fatal() {
                    let kind = match code {
                        HwErrorCode::UnsupportedProfile => FatalKind::UnsupportedProfile,
                        _ => FatalKind::Generic,
                    };
                    shared.latch_fatal(SessionError::HardwareFatal { kind });
                    input.notify_all();
                    output.notify_all();
                } else {
                    tracing::warn!("Decoder reported {:?}", code);
                    shared.control.lock().corrupt_reports += 1;
                }
            }
        }
    }
    tracing::debug!("Event pump exiting");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::PortChange;
    use crate::loopback::{LoopbackConfig, LoopbackControl, LoopbackLoader, SubmittedInput};

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        check()
    }

    fn open_manual(format: CodecFormat, loopback: LoopbackConfig, config: SessionConfig) -> (DecoderSession, LoopbackControl) {
        let loader = Arc::new(LoopbackLoader::new(LoopbackConfig {
            auto_complete: false,
            ..loopback
        }));
        let mut registry = DecoderRegistry::new();
        loader.register(&mut registry, format, &["loop.manual"]);
        let session = DecoderSession::open(&registry, format, config).unwrap();
        let control = loader.last_control().unwrap();
        (session, control)
    }

    fn executing(loopback: LoopbackConfig, config: SessionConfig) -> (DecoderSession, LoopbackControl, Arc<FramePool>) {
        let (session, control) = open_manual(CodecFormat::H264, loopback, config);
        let (count, geometry) = session.output_requirements().unwrap();
        let frames = Arc::new(FramePool::new(count, geometry));
        session.prepare(frames.clone()).unwrap();
        (session, control, frames)
    }

    fn feed_pictures(session: &DecoderSession, timestamps: &[i64]) {
        for (i, ts) in timestamps.iter().enumerate() {
            let unit = CodedUnit::picture(vec![0u8; 64], *ts, i as u64, i == 0);
            assert_eq!(session.feed(&unit).unwrap(), 64);
        }
    }

    /// Let the component consume every input, as a decoder would
    fn consume_inputs(session: &DecoderSession, control: &LoopbackControl) -> Vec<SubmittedInput> {
        let inputs = control.complete_inputs();
        assert!(eventually(|| session.input.in_flight() == 0));
        inputs
    }

    fn tag_of(inputs: &[SubmittedInput], ts: i64) -> u32 {
        inputs.iter().find(|i| i.timestamp_us == Some(ts)).unwrap().tag
    }

    fn next_frame(session: &DecoderSession) -> FrameHandle {
        session.drain_output_timeout(Duration::from_secs(2)).unwrap().unwrap()
    }

    #[test]
    fn test_open_reaches_idle() {
        let (session, control) = open_manual(CodecFormat::H264, LoopbackConfig::default(), SessionConfig::default());
        assert_eq!(session.lifecycle(), Lifecycle::Idle);
        assert_eq!(session.component_name(), "loop.manual");
        assert_eq!(control.component_state(), ComponentState::Idle);
        assert_eq!(
            control.commands(),
            vec![
                Command::PortDisable(PortDirection::Output),
                Command::StateSet(ComponentState::Idle)
            ]
        );
        assert_eq!(session.input_snapshot().buffers.len(), 8);

        // Nothing can be fed before the output pool exists
        let unit = CodedUnit::picture(vec![1u8; 16], 0, 0, true);
        assert!(matches!(
            session.feed(&unit),
            Err(SessionError::InvalidState {
                operation: "feed",
                lifecycle: Lifecycle::Idle
            })
        ));
    }

    #[test]
    fn test_open_falls_back_to_next_candidate() {
        let loader = Arc::new(LoopbackLoader::new(LoopbackConfig::default()).refusing("loop.first"));
        let mut registry = DecoderRegistry::new();
        loader.register(&mut registry, CodecFormat::Hevc, &["loop.first", "loop.second"]);

        let session = DecoderSession::open(&registry, CodecFormat::Hevc, SessionConfig::default()).unwrap();
        assert_eq!(session.component_name(), "loop.second");
        assert_eq!(loader.opened(), vec!["loop.first".to_string(), "loop.second".to_string()]);
    }

    #[test]
    fn test_open_reports_every_candidate_tried() {
        let loader = Arc::new(
            LoopbackLoader::new(LoopbackConfig::default())
                .refusing("loop.a")
                .refusing("loop.b"),
        );
        let mut registry = DecoderRegistry::new();
        loader.register(&mut registry, CodecFormat::Av1, &["loop.a", "loop.b"]);

        match DecoderSession::open(&registry, CodecFormat::Av1, SessionConfig::default()) {
            Err(SessionError::NoDecoder { format, tried }) => {
                assert_eq!(format, CodecFormat::Av1);
                assert_eq!(tried, vec!["loop.a".to_string(), "loop.b".to_string()]);
            }
            other => panic!("expected NoDecoder, got {:?}", other.map(|s| s.lifecycle())),
        }

        match DecoderSession::open(&registry, CodecFormat::Vp8, SessionConfig::default()) {
            Err(SessionError::NoDecoder { tried, .. }) => assert!(tried.is_empty()),
            other => panic!("expected NoDecoder, got {:?}", other.map(|s| s.lifecycle())),
        }
    }

    #[test]
    fn test_out_of_order_completions_come_out_in_time_order() {
        let config = SessionConfig {
            reorder_window: 2,
            ..SessionConfig::default()
        };
        let (session, control, frames) = executing(LoopbackConfig::default(), config);
        assert_eq!(session.lifecycle(), Lifecycle::Executing);
        assert_eq!(control.held_outputs(), 4);

        feed_pictures(&session, &[100, 116, 132, 148]);
        let inputs = consume_inputs(&session, &control);
        assert_eq!(inputs.len(), 4);
        for ts in [132, 100, 148, 116] {
            assert!(control.emit_output(tag_of(&inputs, ts), Some(ts), BufferFlags::NONE));
        }

        let mut shown = Vec::new();
        for _ in 0..4 {
            let handle = next_frame(&session);
            shown.push(frames.read(&handle, |f| (f.timestamp_us, f.user_id, f.valid)));
            session.return_frame(handle).unwrap();
        }
        assert_eq!(
            shown,
            vec![(100, 0, true), (116, 1, true), (132, 2, true), (148, 3, true)]
        );
        assert!(eventually(|| control.held_outputs() == 4));

        let stats = session.stats();
        assert_eq!(stats.units_fed, 4);
        assert_eq!(stats.frames_output, 4);
        assert_eq!(stats.lost_frames, 0);
    }

    #[test]
    fn test_feed_applies_backpressure() {
        let (session, control, _frames) = executing(LoopbackConfig::default(), SessionConfig::default());

        feed_pictures(&session, &[0, 40, 80, 120]);
        let blocked = CodedUnit::picture(vec![2u8; 64], 160, 4, false);
        assert_eq!(session.feed(&blocked).unwrap(), 0);
        assert_eq!(session.feed_timeout(&blocked, Duration::from_millis(20)).unwrap(), 0);
        assert_eq!(session.stats().input_in_flight, 4);

        consume_inputs(&session, &control);
        assert_eq!(session.feed(&blocked).unwrap(), 64);
        assert_eq!(session.stats().units_fed, 5);
    }

    #[test]
    fn test_large_unit_is_split_and_resumed() {
        let loopback = LoopbackConfig {
            input_buffer_size: 16,
            ..LoopbackConfig::default()
        };
        let config = SessionConfig {
            input_buffer_size: 16,
            ..SessionConfig::default()
        };
        let (session, control, _frames) = executing(loopback, config);

        let unit = CodedUnit::picture(vec![3u8; 100], 0, 9, true);
        assert_eq!(session.feed(&unit).unwrap(), 64);
        let first = consume_inputs(&session, &control);
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|i| !i.flags.contains(BufferFlags::END_OF_UNIT)));

        assert_eq!(session.feed(&unit).unwrap(), 36);
        let rest = control.submitted_inputs();
        assert_eq!(rest.len(), 3);
        assert!(rest[2].flags.contains(BufferFlags::END_OF_UNIT));
        assert_eq!(rest[2].len, 4);
        // One decode id for the whole unit
        assert!(first.iter().chain(rest.iter()).all(|i| i.tag == first[0].tag));
        assert_eq!(session.stats().units_fed, 1);
        assert_eq!(session.stats().bytes_fed, 100);
    }

    #[test]
    fn test_primer_unit_precedes_first_picture() {
        let (session, control) = open_manual(CodecFormat::Vc1, LoopbackConfig::default(), SessionConfig::default());
        let (count, geometry) = session.output_requirements().unwrap();
        session.prepare(Arc::new(FramePool::new(count, geometry))).unwrap();
        session.set_codec_config(Bytes::from_static(b"seqhdr"));

        feed_pictures(&session, &[0]);
        let inputs = control.submitted_inputs();
        assert_eq!(inputs.len(), 2);
        assert!(inputs[0].flags.contains(BufferFlags::CODEC_CONFIG));
        assert_eq!(inputs[0].len, 6);
        assert!(!inputs[1].flags.contains(BufferFlags::CODEC_CONFIG));
        assert_eq!(session.stats().primers_sent, 1);

        // A flush means the decoder needs the header again
        session.flush().unwrap();
        feed_pictures(&session, &[1000]);
        assert_eq!(session.stats().primers_sent, 2);
    }

    #[test]
    fn test_untagged_outputs_take_timestamps_in_submission_order() {
        let loopback = LoopbackConfig {
            echo_timestamps: false,
            ..LoopbackConfig::default()
        };
        let (session, control, frames) = executing(loopback, SessionConfig::default());
        assert!(!session.echoes_timestamps());

        feed_pictures(&session, &[0, 33_000, 66_000]);
        consume_inputs(&session, &control);
        for _ in 0..3 {
            assert!(control.emit_output(0, None, BufferFlags::NONE));
        }

        let mut timestamps = Vec::new();
        for _ in 0..3 {
            let handle = next_frame(&session);
            timestamps.push(frames.read(&handle, |f| f.timestamp_us));
            session.return_frame(handle).unwrap();
        }
        assert_eq!(timestamps, vec![0, 33_000, 66_000]);
        assert_eq!(session.stats().untagged_frames, 0);
    }

    #[test]
    fn test_decode_only_pictures_are_recycled() {
        let (session, control, _frames) = executing(LoopbackConfig::default(), SessionConfig::default());

        let unit = CodedUnit {
            kind: UnitKind::DecodeOnly,
            ..CodedUnit::picture(vec![4u8; 32], 500, 7, false)
        };
        assert_eq!(session.feed(&unit).unwrap(), 32);
        let inputs = consume_inputs(&session, &control);
        assert!(inputs[0].flags.contains(BufferFlags::DECODE_ONLY));
        assert!(control.emit_output(inputs[0].tag, Some(500), BufferFlags::DECODE_ONLY));

        assert!(eventually(|| {
            session.drain_output().unwrap().is_none() && session.stats().decode_only_discarded == 1
        }));
        assert!(eventually(|| control.held_outputs() == 4));
        assert_eq!(session.stats().frames_output, 0);
    }

    #[test]
    fn test_crop_change_applies_to_next_picture() {
        let (session, control, frames) = executing(LoopbackConfig::default(), SessionConfig::default());
        let crop = CropRect {
            left: 0,
            top: 8,
            width: 320,
            height: 224,
        };
        control.post_port_change(PortDirection::Output, PortChange::CropChanged(crop));
        assert!(session.wait_output(Duration::from_secs(2)));

        feed_pictures(&session, &[0]);
        let inputs = consume_inputs(&session, &control);
        assert!(control.emit_output(inputs[0].tag, Some(0), BufferFlags::KEY_UNIT));
        let handle = next_frame(&session);
        let frame = frames.snapshot(&handle);
        assert_eq!(frame.crop, crop);
        assert!(frame.key);
        session.return_frame(handle).unwrap();
    }

    #[test]
    fn test_reconfigure_waits_for_pool_growth() {
        let (session, control, frames) = executing(LoopbackConfig::default(), SessionConfig::default());
        let big = FrameGeometry::new(640, 480);

        control.request_output_change(big, 6);
        assert!(eventually(|| session.output.has_pending_changes()));
        match session.drain_output() {
            Err(SessionError::GeometryGrowthRequired { required, geometry }) => {
                assert_eq!(required, 6);
                assert_eq!(geometry, big);
            }
            other => panic!("expected GeometryGrowthRequired, got {:?}", other),
        }
        // Old output pool is gone and every frame is back
        assert_eq!(frames.available(), 4);
        assert!(matches!(
            session.drain_output(),
            Err(SessionError::GeometryGrowthRequired { required: 6, .. })
        ));

        assert_eq!(frames.grow(6, big), 2);
        session.prepare(frames.clone()).unwrap();
        assert_eq!(control.held_outputs(), 6);
        assert_eq!(session.stats().reconfigurations, 1);
        assert!(control.commands().contains(&Command::PortEnable(PortDirection::Output)));

        feed_pictures(&session, &[0]);
        let inputs = consume_inputs(&session, &control);
        assert!(control.emit_output(inputs[0].tag, Some(0), BufferFlags::NONE));
        let handle = next_frame(&session);
        assert_eq!(frames.read(&handle, |f| f.geometry), big);
        assert_eq!(frames.read(&handle, |f| f.filled_len), big.buffer_size());
        session.return_frame(handle).unwrap();
    }

    #[test]
    fn test_fatal_error_is_latched() {
        let (session, control, frames) = executing(LoopbackConfig::default(), SessionConfig::default());

        control.post_error(HwErrorCode::StreamCorrupt);
        assert!(eventually(|| session.stats().corrupt_reports == 1));
        assert!(session.fatal_error().is_none());

        control.post_error(HwErrorCode::UnsupportedProfile);
        assert!(eventually(|| session.fatal_error().is_some()));
        let unit = CodedUnit::picture(vec![5u8; 8], 0, 0, true);
        for _ in 0..2 {
            assert!(matches!(
                session.feed(&unit),
                Err(SessionError::HardwareFatal {
                    kind: FatalKind::UnsupportedProfile
                })
            ));
        }
        assert!(matches!(session.drain_output(), Err(SessionError::HardwareFatal { .. })));

        // Teardown still returns every frame
        session.close().unwrap();
        assert_eq!(session.lifecycle(), Lifecycle::Closed);
        assert_eq!(frames.available(), frames.capacity());
    }

    #[test]
    fn test_echoing_decoder_does_not_queue_timestamps() {
        let (session, control, _frames) = executing(LoopbackConfig::default(), SessionConfig::default());
        assert!(session.echoes_timestamps());

        for batch in 0..10u64 {
            for i in 0..4 {
                let id = batch * 4 + i;
                let unit = CodedUnit::picture(vec![0u8; 64], id as i64 * 40_000, id, i == 0);
                assert_eq!(session.feed(&unit).unwrap(), 64);
            }
            consume_inputs(&session, &control);
        }
        assert_eq!(session.stats().units_fed, 40);
        assert_eq!(session.decode.lock().reorder.pending_timestamps(), 0);
    }

    #[test]
    fn test_small_event_queue_is_refused() {
        let config = SessionConfig {
            event_queue_depth: 16,
            ..SessionConfig::default()
        };
        let (session, _control) = open_manual(CodecFormat::H264, LoopbackConfig::default(), config);
        let (count, geometry) = session.output_requirements().unwrap();
        let frames = Arc::new(FramePool::new(count, geometry));

        // 8 input and 4 output completions plus headroom do not fit in 16
        assert!(matches!(session.prepare(frames.clone()), Err(SessionError::AllocationFailure(_))));
        assert_eq!(frames.available(), frames.capacity());
        session.close().unwrap();
    }

    #[test]
    fn test_lost_hardware_events_latch_fatal() {
        let config = SessionConfig {
            event_queue_depth: 16,
            ..SessionConfig::default()
        };
        let (session, control) = open_manual(CodecFormat::H264, LoopbackConfig::default(), config);

        let change = PortChange::InterlaceChanged(InterlaceMode::TopFieldFirst);
        let overflowed = (0..1_000_000).any(|_| !control.post_port_change(PortDirection::Input, change));
        assert!(overflowed);

        assert!(eventually(|| matches!(
            session.fatal_error(),
            Some(SessionError::HardwareFatal { kind: FatalKind::Generic })
        )));
        let (count, geometry) = session.output_requirements().unwrap();
        assert!(matches!(
            session.prepare(Arc::new(FramePool::new(count, geometry))),
            Err(SessionError::HardwareFatal { .. })
        ));
        session.close().unwrap();
        assert_eq!(session.lifecycle(), Lifecycle::Closed);
    }

    #[test]
    fn test_latched_errors_replay_as_themselves() {
        let command = Command::StateSet(ComponentState::Idle);
        assert!(matches!(replay(&SessionError::CommandTimeout(command)), SessionError::CommandTimeout(c) if c == command));
        assert!(matches!(replay(&SessionError::Cancelled), SessionError::Cancelled));
        assert!(matches!(
            replay(&SessionError::HardwareFatal {
                kind: FatalKind::UnsupportedProfile
            }),
            SessionError::HardwareFatal {
                kind: FatalKind::UnsupportedProfile
            }
        ));
        let geometry = FrameGeometry::new(640, 480);
        assert!(matches!(
            replay(&SessionError::GeometryGrowthRequired { required: 6, geometry }),
            SessionError::GeometryGrowthRequired { required: 6, geometry: g } if g == geometry
        ));
    }

    /// Deterministic shuffles for completion orders
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn shuffle<T>(&mut self, items: &mut [T]) {
            for i in (1..items.len()).rev() {
                let j = (self.next() % (i as u64 + 1)) as usize;
                items.swap(i, j);
            }
        }
    }

    #[test]
    fn test_any_completion_order_comes_out_in_time_order() {
        let (session, control, frames) = executing(LoopbackConfig::default(), SessionConfig::default());
        let mut rng = XorShift(0x2545_F491_4F6C_DD1D);

        for round in 0..50i64 {
            let base = round * 1_000_000;
            let timestamps: Vec<i64> = (0..4).map(|i| base + i * 40_000).collect();
            for (i, ts) in timestamps.iter().enumerate() {
                let unit = CodedUnit::picture(vec![0u8; 64], *ts, (round * 4) as u64 + i as u64, i == 0);
                assert_eq!(session.feed(&unit).unwrap(), 64);
            }
            let inputs = consume_inputs(&session, &control);

            let mut order = timestamps.clone();
            rng.shuffle(&mut order);
            assert!(eventually(|| control.held_outputs() == 4));
            for ts in &order {
                assert!(control.emit_output(tag_of(&inputs, *ts), Some(*ts), BufferFlags::NONE));
            }

            let mut shown = Vec::new();
            for _ in 0..4 {
                let handle = next_frame(&session);
                shown.push(frames.read(&handle, |f| f.timestamp_us));
                session.return_frame(handle).unwrap();
            }
            assert_eq!(shown, timestamps, "completion order {:?}", order);
        }

        let stats = session.stats();
        assert_eq!(stats.frames_output, 200);
        assert_eq!(stats.lost_frames, 0);
    }

    #[test]
    fn test_flush_discards_pictures_in_flight() {
        let (session, control, frames) = executing(LoopbackConfig::default(), SessionConfig::default());

        feed_pictures(&session, &[0, 40_000, 80_000]);
        let inputs = consume_inputs(&session, &control);
        // Only a later picture completes; the reorder holds it back
        assert!(control.emit_output(tag_of(&inputs, 80_000), Some(80_000), BufferFlags::NONE));
        assert!(eventually(|| session.output.completed_len() == 1));
        assert!(session.drain_output().unwrap().is_none());

        session.flush().unwrap();
        let commands = control.commands();
        assert!(commands.contains(&Command::Flush(PortDirection::Input)));
        assert!(commands.contains(&Command::Flush(PortDirection::Output)));
        assert_eq!(session.stats().flushes, 1);
        assert_eq!(session.lifecycle(), Lifecycle::Executing);
        assert_eq!(control.held_outputs(), 4);
        assert_eq!(frames.available(), 0);

        // Timestamps before the flush are no longer waited for
        feed_pictures(&session, &[1_000_000]);
        let inputs = consume_inputs(&session, &control);
        assert!(control.emit_output(inputs[0].tag, Some(1_000_000), BufferFlags::NONE));
        let handle = next_frame(&session);
        assert_eq!(frames.read(&handle, |f| f.timestamp_us), 1_000_000);
        session.return_frame(handle).unwrap();
    }

    #[test]
    fn test_drain_delivers_everything_then_reports_drained() {
        let (session, control, frames) = executing(LoopbackConfig::default(), SessionConfig::default());

        feed_pictures(&session, &[0, 40_000]);
        session.drain().unwrap();
        assert_eq!(session.lifecycle(), Lifecycle::Draining);
        let inputs = consume_inputs(&session, &control);
        assert!(inputs[2].flags.contains(BufferFlags::END_OF_STREAM));

        assert!(control.emit_output(tag_of(&inputs, 40_000), Some(40_000), BufferFlags::NONE));
        assert!(control.emit_output(tag_of(&inputs, 0), Some(0), BufferFlags::NONE));
        assert!(control.emit_output(0, None, BufferFlags::END_OF_STREAM));

        let mut timestamps = Vec::new();
        for _ in 0..2 {
            let handle = next_frame(&session);
            timestamps.push(frames.read(&handle, |f| f.timestamp_us));
            session.return_frame(handle).unwrap();
        }
        assert_eq!(timestamps, vec![0, 40_000]);
        assert!(eventually(|| session.drain_output().unwrap().is_none() && session.is_drained()));
    }

    #[test]
    fn test_close_walks_back_to_loaded_and_returns_frames() {
        let (session, control, frames) = executing(LoopbackConfig::default(), SessionConfig::default());
        feed_pictures(&session, &[0, 40_000]);

        session.close().unwrap();
        assert_eq!(session.lifecycle(), Lifecycle::Closed);
        assert_eq!(control.component_state(), ComponentState::Loaded);
        let commands = control.commands();
        assert_eq!(
            &commands[commands.len() - 2..],
            &[
                Command::StateSet(ComponentState::Idle),
                Command::StateSet(ComponentState::Loaded)
            ]
        );
        assert_eq!(frames.available(), frames.capacity());
        assert!(matches!(session.feed(&CodedUnit::picture(vec![1u8], 0, 0, true)), Err(SessionError::InvalidState { .. })));

        // Closing twice is harmless
        session.close().unwrap();
    }
}
