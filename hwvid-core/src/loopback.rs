//! # Loopback Backend
//!
//! An in-process [`DecoderComponent`] that honours the port protocol without
//! decoding anything. Every coded access unit becomes one "picture" whose
//! output buffer carries the unit's tag and timestamp back. Like a real
//! decoder it holds `reorder_depth` pictures and emits the earliest first.
//!
//! Two ways to drive it:
//!
//! - `auto_complete`: a worker thread completes inputs and emits pictures as
//!   soon as output buffers are available (pipeline runs, the player binary)
//! - manual: tests hold a [`LoopbackControl`] and decide exactly which buffer
//!   comes back when, and in what order
//!
//! Also here: [`SyntheticDemuxer`] (decode-order units with B-frame style
//! timestamp reordering) and [`RecordingSink`] (remembers what was shown).

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::{Frame, FrameGeometry, UnitKind};
use crate::hardware::{
    BufferFlags, Candidate, CodecFormat, Command, ComponentLoader, ComponentState, DecoderComponent, DecoderRegistry,
    EventSink, HwError, HwErrorCode, InputBuffer, OutputDone, PlatformHandle, PortChange, PortDirection, PortGeometry,
};
use crate::pipeline::Demuxer;
use crate::scheduler::DisplaySink;
use crate::session::CodedUnit;

// ============================================================================
// Configuration
// ============================================================================

/// Mid-stream output change: after `after_frames` pictures the component
/// asks for a new output pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeEvent {
    pub after_frames: u64,
    pub frame: FrameGeometry,
    pub buffer_count_min: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackConfig {
    /// Carry the input tag and timestamp to the output buffer
    pub echo_timestamps: bool,
    /// Complete buffers on a worker thread
    pub auto_complete: bool,
    pub input_buffers: usize,
    pub input_buffer_size: usize,
    pub output_buffers_min: usize,
    pub frame: FrameGeometry,
    /// Pictures held back to restore presentation order
    pub reorder_depth: usize,
    /// Reported decoder latency (microseconds)
    pub latency_us: i64,
    pub resize_at: Option<ResizeEvent>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            echo_timestamps: true,
            auto_complete: true,
            input_buffers: 4,
            input_buffer_size: 64 * 1024,
            output_buffers_min: 4,
            frame: FrameGeometry::new(320, 240),
            reorder_depth: 2,
            latency_us: 0,
            resize_at: None,
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// An input buffer currently held by the component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedInput {
    pub index: usize,
    pub tag: u32,
    pub timestamp_us: Option<i64>,
    pub flags: BufferFlags,
    pub len: usize,
}

/// A decoded picture waiting for an output buffer
#[derive(Debug, Clone, Copy)]
struct Picture {
    tag: u32,
    timestamp_us: Option<i64>,
    flags: BufferFlags,
}

impl Picture {
    fn end_of_stream() -> Self {
        Self {
            tag: 0,
            timestamp_us: None,
            flags: BufferFlags::END_OF_STREAM,
        }
    }
}

fn port_slot(direction: PortDirection) -> usize {
    match direction {
        PortDirection::Input => 0,
        PortDirection::Output => 1,
    }
}

struct LoopbackState {
    component_state: ComponentState,
    geometry: [PortGeometry; 2],
    enabled: [bool; 2],
    allocated: [HashSet<usize>; 2],
    inputs: VecDeque<SubmittedInput>,
    outputs: VecDeque<usize>,
    /// Decoded, not yet emitted, in decode order
    pictures: Vec<Picture>,
    /// End of stream seen on the input; emitted after the last picture
    eos_pending: bool,
    emitted: u64,
    resized: bool,
    /// Output port waits for a disable/enable cycle
    awaiting_reconfig: bool,
    commands: Vec<Command>,
    stop: bool,
}

struct LoopbackShared {
    config: LoopbackConfig,
    state: Mutex<LoopbackState>,
    cond: Condvar,
    events: EventSink,
}

impl LoopbackShared {
    /// Give back every output buffer held, unfilled
    fn return_outputs(&self, state: &mut LoopbackState) {
        for index in state.outputs.drain(..) {
            self.events.output_done(OutputDone {
                index,
                filled_len: 0,
                tag: 0,
                timestamp_us: None,
                flags: BufferFlags::NONE,
            });
        }
    }

    fn return_inputs(&self, state: &mut LoopbackState) {
        for input in state.inputs.drain(..) {
            self.events.input_done(input.index);
        }
    }

    /// Complete inputs and emit whatever pictures have an output buffer.
    /// Returns how many events were posted.
    fn process(&self, state: &mut LoopbackState) -> usize {
        if state.component_state != ComponentState::Executing {
            return 0;
        }
        let mut posted = 0;

        while let Some(input) = state.inputs.pop_front() {
            self.events.input_done(input.index);
            posted += 1;
            if input.flags.contains(BufferFlags::CODEC_CONFIG) {
                continue;
            }
            if input.flags.contains(BufferFlags::END_OF_STREAM) {
                state.eos_pending = true;
            } else if input.flags.contains(BufferFlags::END_OF_UNIT) {
                let mut flags = BufferFlags::NONE;
                for carried in [BufferFlags::KEY_UNIT, BufferFlags::DECODE_ONLY] {
                    if input.flags.contains(carried) {
                        flags |= carried;
                    }
                }
                state.pictures.push(Picture {
                    tag: input.tag,
                    timestamp_us: input.timestamp_us,
                    flags,
                });
            }
        }

        while !state.awaiting_reconfig && state.enabled[1] {
            if let Some(resize) = self.config.resize_at {
                if !state.resized && state.emitted >= resize.after_frames {
                    self.start_resize(state, resize.frame, resize.buffer_count_min);
                    posted += 1;
                    break;
                }
            }
            if state.outputs.is_empty() {
                break;
            }
            let Some(picture) = self.next_picture(state) else {
                break;
            };
            let Some(index) = state.outputs.pop_front() else {
                break;
            };
            self.emit(state, index, picture);
            posted += 1;
        }
        posted
    }

    /// Earliest of the oldest `reorder_depth + 1` pictures once more than
    /// `reorder_depth` are held (or the stream ended), then the end-of-stream
    /// marker
    fn next_picture(&self, state: &mut LoopbackState) -> Option<Picture> {
        let flushing = state.eos_pending;
        if state.pictures.len() > self.config.reorder_depth || flushing && !state.pictures.is_empty() {
            let window = (self.config.reorder_depth + 1).min(state.pictures.len());
            let (pos, _) = state.pictures[..window]
                .iter()
                .enumerate()
                .min_by_key(|(pos, p)| (p.timestamp_us.unwrap_or(i64::MIN), *pos))?;
            return Some(state.pictures.remove(pos));
        }
        if flushing {
            state.eos_pending = false;
            return Some(Picture::end_of_stream());
        }
        None
    }

    fn emit(&self, state: &mut LoopbackState, index: usize, picture: Picture) {
        let eos = picture.flags.contains(BufferFlags::END_OF_STREAM);
        let (tag, timestamp_us) = if self.config.echo_timestamps {
            (picture.tag, picture.timestamp_us)
        } else {
            (0, None)
        };
        let filled_len = if eos { 0 } else { state.geometry[1].frame.buffer_size() };
        if !eos {
            state.emitted += 1;
        }
        self.events.output_done(OutputDone {
            index,
            filled_len,
            tag,
            timestamp_us,
            flags: picture.flags,
        });
    }

    fn start_resize(&self, state: &mut LoopbackState, frame: FrameGeometry, buffer_count_min: usize) {
        let geometry = &mut state.geometry[1];
        geometry.frame = frame;
        geometry.buffer_count_min = buffer_count_min;
        geometry.buffer_count = geometry.buffer_count.max(buffer_count_min);
        geometry.buffer_size = frame.buffer_size();
        state.resized = true;
        state.awaiting_reconfig = true;
        tracing::debug!("Loopback output now {}x{}, {} buffers", frame.width, frame.height, buffer_count_min);
        self.events.port_changed(PortDirection::Output, PortChange::Reconfigure);
    }
}

fn worker(shared: Arc<LoopbackShared>) {
    let mut state = shared.state.lock();
    while !state.stop {
        shared.process(&mut state);
        shared.cond.wait_for(&mut state, Duration::from_millis(10));
    }
}

// ============================================================================
// Component
// ============================================================================

pub struct LoopbackComponent {
    name: String,
    shared: Arc<LoopbackShared>,
    worker: Option<JoinHandle<()>>,
}

impl LoopbackComponent {
    pub fn new(name: impl Into<String>, config: LoopbackConfig, events: EventSink) -> Result<Self, HwError> {
        let name = name.into();
        let input = PortGeometry {
            frame: FrameGeometry::default(),
            buffer_count_min: config.input_buffers,
            buffer_count: config.input_buffers,
            buffer_size: config.input_buffer_size,
        };
        let output = PortGeometry {
            frame: config.frame,
            buffer_count_min: config.output_buffers_min,
            buffer_count: config.output_buffers_min,
            buffer_size: config.frame.buffer_size(),
        };
        let shared = Arc::new(LoopbackShared {
            state: Mutex::new(LoopbackState {
                component_state: ComponentState::Loaded,
                geometry: [input, output],
                enabled: [true, true],
                allocated: [HashSet::new(), HashSet::new()],
                inputs: VecDeque::new(),
                outputs: VecDeque::new(),
                pictures: Vec::new(),
                eos_pending: false,
                emitted: 0,
                resized: false,
                awaiting_reconfig: false,
                commands: Vec::new(),
                stop: false,
            }),
            cond: Condvar::new(),
            events,
            config,
        });

        let worker = if shared.config.auto_complete {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker", name))
                .spawn(move || worker(shared))
                .map_err(|e| HwError::AllocationFailed(format!("loopback worker: {}", e)))?;
            Some(handle)
        } else {
            None
        };

        Ok(Self { name, shared, worker })
    }

    /// Handle for driving the component by hand
    pub fn control(&self) -> LoopbackControl {
        LoopbackControl {
            shared: self.shared.clone(),
        }
    }

    fn wake(&self) {
        self.shared.cond.notify_all();
    }
}

impl DecoderComponent for LoopbackComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn port_geometry(&self, direction: PortDirection) -> Result<PortGeometry, HwError> {
        Ok(self.shared.state.lock().geometry[port_slot(direction)])
    }

    fn set_port_geometry(&mut self, direction: PortDirection, geometry: &PortGeometry) -> Result<(), HwError> {
        let mut state = self.shared.state.lock();
        let current = &mut state.geometry[port_slot(direction)];
        if geometry.buffer_count < current.buffer_count_min {
            return Err(HwError::BadParameter(format!(
                "{:?} buffer count {} below minimum {}",
                direction, geometry.buffer_count, current.buffer_count_min
            )));
        }
        current.buffer_count = geometry.buffer_count;
        current.buffer_size = geometry.buffer_size;
        if direction == PortDirection::Output && geometry.frame != current.frame {
            return Err(HwError::BadParameter("output frame geometry is decided by the decoder".into()));
        }
        Ok(())
    }

    fn allocate_buffer(&mut self, direction: PortDirection, index: usize, _size: usize) -> Result<PlatformHandle, HwError> {
        let mut state = self.shared.state.lock();
        let slot = port_slot(direction);
        if index >= state.geometry[slot].buffer_count || !state.allocated[slot].insert(index) {
            return Err(HwError::InvalidIndex { direction, index });
        }
        Ok(PlatformHandle(((slot as u64) << 32) | index as u64))
    }

    fn free_buffer(&mut self, direction: PortDirection, index: usize, _handle: PlatformHandle) -> Result<(), HwError> {
        let mut state = self.shared.state.lock();
        if !state.allocated[port_slot(direction)].remove(&index) {
            return Err(HwError::InvalidIndex { direction, index });
        }
        Ok(())
    }

    fn send_command(&mut self, command: Command) -> Result<(), HwError> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        match command {
            Command::StateSet(target) => {
                if target == ComponentState::Loaded && state.component_state == ComponentState::Executing {
                    return Err(HwError::WrongState("Executing -> Loaded"));
                }
                if state.component_state == ComponentState::Executing && target == ComponentState::Idle {
                    shared.return_inputs(&mut state);
                    shared.return_outputs(&mut state);
                    state.pictures.clear();
                    state.eos_pending = false;
                }
                state.component_state = target;
            }
            Command::PortDisable(direction) => {
                state.enabled[port_slot(direction)] = false;
                match direction {
                    PortDirection::Input => shared.return_inputs(&mut state),
                    PortDirection::Output => shared.return_outputs(&mut state),
                }
            }
            Command::PortEnable(direction) => {
                state.enabled[port_slot(direction)] = true;
                if direction == PortDirection::Output {
                    state.awaiting_reconfig = false;
                }
            }
            Command::Flush(PortDirection::Input) => {
                shared.return_inputs(&mut state);
                state.pictures.clear();
                state.eos_pending = false;
            }
            Command::Flush(PortDirection::Output) => shared.return_outputs(&mut state),
        }
        state.commands.push(command);
        shared.events.command_complete(command);
        drop(state);
        self.wake();
        Ok(())
    }

    fn empty_buffer(&mut self, buffer: InputBuffer<'_>) -> Result<(), HwError> {
        let mut state = self.shared.state.lock();
        if state.component_state != ComponentState::Executing || !state.enabled[0] {
            return Err(HwError::WrongState("empty_buffer"));
        }
        if !state.allocated[0].contains(&buffer.index) {
            return Err(HwError::InvalidIndex {
                direction: PortDirection::Input,
                index: buffer.index,
            });
        }
        state.inputs.push_back(SubmittedInput {
            index: buffer.index,
            tag: buffer.tag,
            timestamp_us: buffer.timestamp_us,
            flags: buffer.flags,
            len: buffer.data.len(),
        });
        drop(state);
        self.wake();
        Ok(())
    }

    fn fill_buffer(&mut self, index: usize, _handle: PlatformHandle) -> Result<(), HwError> {
        let mut state = self.shared.state.lock();
        if state.component_state != ComponentState::Executing || !state.enabled[1] {
            return Err(HwError::WrongState("fill_buffer"));
        }
        if !state.allocated[1].contains(&index) {
            return Err(HwError::InvalidIndex {
                direction: PortDirection::Output,
                index,
            });
        }
        state.outputs.push_back(index);
        drop(state);
        self.wake();
        Ok(())
    }

    fn echoes_timestamps(&self) -> bool {
        self.shared.config.echo_timestamps
    }

    fn latency_us(&self) -> i64 {
        self.shared.config.latency_us
    }
}

impl Drop for LoopbackComponent {
    fn drop(&mut self) {
        self.shared.state.lock().stop = true;
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// ============================================================================
// Manual Control
// ============================================================================

/// Test-side handle on a loopback component
#[derive(Clone)]
pub struct LoopbackControl {
    shared: Arc<LoopbackShared>,
}

impl LoopbackControl {
    pub fn component_state(&self) -> ComponentState {
        self.shared.state.lock().component_state
    }

    /// Commands received so far, in order
    pub fn commands(&self) -> Vec<Command> {
        self.shared.state.lock().commands.clone()
    }

    pub fn submitted_inputs(&self) -> Vec<SubmittedInput> {
        self.shared.state.lock().inputs.iter().copied().collect()
    }

    pub fn held_outputs(&self) -> usize {
        self.shared.state.lock().outputs.len()
    }

    /// Consume every held input without producing pictures
    pub fn complete_inputs(&self) -> Vec<SubmittedInput> {
        let mut state = self.shared.state.lock();
        let inputs: Vec<SubmittedInput> = state.inputs.drain(..).collect();
        for input in &inputs {
            self.shared.events.input_done(input.index);
        }
        inputs
    }

    /// Return one held output buffer as a decoded picture.
    /// False if the component holds no output buffer.
    pub fn emit_output(&self, tag: u32, timestamp_us: Option<i64>, flags: BufferFlags) -> bool {
        let mut state = self.shared.state.lock();
        let Some(index) = state.outputs.pop_front() else {
            return false;
        };
        self.shared.emit(&mut state, index, Picture { tag, timestamp_us, flags });
        true
    }

    /// Run one completion pass, as the worker would
    pub fn process(&self) -> usize {
        let mut state = self.shared.state.lock();
        self.shared.process(&mut state)
    }

    /// Change what the output port needs and tell the session
    pub fn request_output_change(&self, frame: FrameGeometry, buffer_count_min: usize) {
        let mut state = self.shared.state.lock();
        self.shared.start_resize(&mut state, frame, buffer_count_min);
    }

    /// False if the event channel was full
    pub fn post_port_change(&self, direction: PortDirection, change: PortChange) -> bool {
        self.shared.events.port_changed(direction, change)
    }

    pub fn post_error(&self, code: HwErrorCode) -> bool {
        self.shared.events.error(code)
    }
}

// ============================================================================
// Loader
// ============================================================================

/// Opens loopback components; names listed in `refuse` decline to open
pub struct LoopbackLoader {
    config: LoopbackConfig,
    refuse: Vec<String>,
    opened: Mutex<Vec<String>>,
    last: Mutex<Option<LoopbackControl>>,
}

impl LoopbackLoader {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            refuse: Vec::new(),
            opened: Mutex::new(Vec::new()),
            last: Mutex::new(None),
        }
    }

    pub fn refusing(mut self, name: impl Into<String>) -> Self {
        self.refuse.push(name.into());
        self
    }

    /// Register `names` as candidates for `format`, in order
    pub fn register(self: &Arc<Self>, registry: &mut DecoderRegistry, format: CodecFormat, names: &[&str]) {
        for name in names {
            let role = format!("video_decoder.{:?}", format).to_lowercase();
            registry.register(format, Candidate::new(*name, role), self.clone());
        }
    }

    /// Names of every open attempt, refused ones included
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    /// Control handle of the most recently opened component
    pub fn last_control(&self) -> Option<LoopbackControl> {
        self.last.lock().clone()
    }
}

impl ComponentLoader for LoopbackLoader {
    fn open(&self, candidate: &Candidate, events: EventSink) -> Result<Box<dyn DecoderComponent>, HwError> {
        self.opened.lock().push(candidate.name.clone());
        if self.refuse.contains(&candidate.name) {
            return Err(HwError::Refused(candidate.name.clone()));
        }
        let component = LoopbackComponent::new(candidate.name.clone(), self.config.clone(), events)?;
        *self.last.lock() = Some(component.control());
        Ok(Box::new(component))
    }
}

// ============================================================================
// Synthetic Demuxer
// ============================================================================

/// Produces `frames` coded units in decode order.
///
/// With `reorder` set, every group of three pictures after the first is sent
/// as P B B (presentation 3 1 2, 6 4 5, ...), the way a stream with
/// B-frames arrives from a container.
pub struct SyntheticDemuxer {
    format: CodecFormat,
    /// Presentation index of each unit, in decode order
    order: Vec<u64>,
    cursor: usize,
    frame_duration_us: i64,
    gop: u64,
    unit_size: usize,
}

impl SyntheticDemuxer {
    pub fn new(format: CodecFormat, frames: u64, fps: u32, reorder: bool) -> Self {
        let mut order = Vec::with_capacity(frames as usize);
        if frames > 0 {
            order.push(0);
        }
        let mut i = 1;
        while i < frames {
            if reorder && i + 2 < frames {
                order.extend_from_slice(&[i + 2, i, i + 1]);
                i += 3;
            } else {
                order.push(i);
                i += 1;
            }
        }
        Self {
            format,
            order,
            cursor: 0,
            frame_duration_us: 1_000_000 / fps.max(1) as i64,
            gop: 12,
            unit_size: 2048,
        }
    }

    pub fn with_unit_size(mut self, unit_size: usize) -> Self {
        self.unit_size = unit_size.max(1);
        self
    }

    pub fn frame_duration_us(&self) -> i64 {
        self.frame_duration_us
    }

    pub fn remaining(&self) -> usize {
        self.order.len() - self.cursor
    }

    fn is_key(&self, index: u64) -> bool {
        index % self.gop == 0
    }
}

impl Demuxer for SyntheticDemuxer {
    fn format(&self) -> CodecFormat {
        self.format
    }

    fn codec_config(&self) -> Bytes {
        Bytes::from_static(&[0x00, 0x00, 0x01, 0x0f])
    }

    fn read_unit(&mut self) -> Option<CodedUnit> {
        let index = *self.order.get(self.cursor)?;
        self.cursor += 1;
        Some(CodedUnit {
            data: Bytes::from(vec![(index & 0xff) as u8; self.unit_size]),
            timestamp_us: Some(index as i64 * self.frame_duration_us),
            duration_us: self.frame_duration_us,
            kind: UnitKind::Picture,
            user_id: index,
            key: self.is_key(index),
        })
    }

    fn skip_to_key_unit(&mut self) -> usize {
        let start = self.cursor;
        while let Some(&index) = self.order.get(self.cursor) {
            if self.cursor > start && self.is_key(index) {
                break;
            }
            self.cursor += 1;
        }
        self.cursor - start
    }

    /// Restart from the key unit at or before `target_us`
    fn seek(&mut self, target_us: i64) -> bool {
        let index = (target_us.max(0) / self.frame_duration_us) as u64;
        let key = index - index % self.gop;
        match self.order.iter().position(|&i| i == key) {
            Some(pos) => {
                self.cursor = pos;
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Recording Sink
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShownFrame {
    pub timestamp_us: i64,
    pub user_id: u64,
    pub slot: usize,
    pub geometry: FrameGeometry,
}

#[derive(Debug, Default)]
struct SinkLog {
    shown: Vec<ShownFrame>,
    resizes: Vec<FrameGeometry>,
    flushes: u64,
}

/// Display sink that records every frame; clones share the record
#[derive(Clone, Default)]
pub struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
    latency_us: i64,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency_us: i64) -> Self {
        Self {
            log: Arc::default(),
            latency_us,
        }
    }

    pub fn shown(&self) -> Vec<ShownFrame> {
        self.log.lock().shown.clone()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.log.lock().shown.iter().map(|f| f.timestamp_us).collect()
    }

    pub fn resizes(&self) -> Vec<FrameGeometry> {
        self.log.lock().resizes.clone()
    }

    pub fn flushes(&self) -> u64 {
        self.log.lock().flushes
    }
}

impl DisplaySink for RecordingSink {
    fn put(&mut self, frame: &Frame) -> i64 {
        self.log.lock().shown.push(ShownFrame {
            timestamp_us: frame.timestamp_us,
            user_id: frame.user_id,
            slot: frame.slot,
            geometry: frame.geometry,
        });
        frame.target_time_us + self.latency_us
    }

    fn flush(&mut self) {
        self.log.lock().flushes += 1;
    }

    fn resize(&mut self, geometry: FrameGeometry) {
        tracing::debug!("Sink resized to {}x{}", geometry.width, geometry.height);
        self.log.lock().resizes.push(geometry);
    }

    fn latency_us(&self) -> i64 {
        self.latency_us
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{event_channel, HardwareEvent};

    fn manual() -> LoopbackConfig {
        LoopbackConfig {
            auto_complete: false,
            ..LoopbackConfig::default()
        }
    }

    #[test]
    fn test_commands_complete_and_return_buffers() {
        let (events, rx) = event_channel(64);
        let mut comp = LoopbackComponent::new("loop", manual(), events).unwrap();
        let control = comp.control();

        comp.send_command(Command::StateSet(ComponentState::Idle)).unwrap();
        comp.allocate_buffer(PortDirection::Output, 0, 1024).unwrap();
        comp.send_command(Command::StateSet(ComponentState::Executing)).unwrap();
        comp.fill_buffer(0, PlatformHandle(0)).unwrap();
        assert_eq!(control.held_outputs(), 1);

        comp.send_command(Command::PortDisable(PortDirection::Output)).unwrap();
        assert_eq!(control.held_outputs(), 0);

        let events: Vec<HardwareEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                HardwareEvent::CommandComplete(Command::StateSet(ComponentState::Idle)),
                HardwareEvent::CommandComplete(Command::StateSet(ComponentState::Executing)),
                HardwareEvent::OutputDone(OutputDone {
                    index: 0,
                    filled_len: 0,
                    tag: 0,
                    timestamp_us: None,
                    flags: BufferFlags::NONE,
                }),
                HardwareEvent::CommandComplete(Command::PortDisable(PortDirection::Output)),
            ]
        );
    }

    #[test]
    fn test_buffers_rejected_outside_executing() {
        let (events, _rx) = event_channel(16);
        let mut comp = LoopbackComponent::new("loop", manual(), events).unwrap();
        comp.allocate_buffer(PortDirection::Output, 0, 1024).unwrap();
        assert!(matches!(comp.fill_buffer(0, PlatformHandle(0)), Err(HwError::WrongState(_))));
        assert!(matches!(
            comp.allocate_buffer(PortDirection::Output, 0, 1024),
            Err(HwError::InvalidIndex { .. })
        ));
    }

    fn executing(config: LoopbackConfig) -> (LoopbackComponent, crossbeam::channel::Receiver<HardwareEvent>) {
        let (events, rx) = event_channel(64);
        let mut comp = LoopbackComponent::new("loop", config, events).unwrap();
        comp.send_command(Command::StateSet(ComponentState::Executing)).unwrap();
        for i in 0..2 {
            comp.allocate_buffer(PortDirection::Input, i, 64).unwrap();
            comp.allocate_buffer(PortDirection::Output, i, 64).unwrap();
            comp.fill_buffer(i, PlatformHandle(0)).unwrap();
        }
        comp.empty_buffer(InputBuffer {
            index: 0,
            handle: PlatformHandle(0),
            data: b"a",
            tag: 7,
            timestamp_us: Some(100),
            flags: BufferFlags::END_OF_UNIT | BufferFlags::KEY_UNIT,
        })
        .unwrap();
        comp.empty_buffer(InputBuffer {
            index: 1,
            handle: PlatformHandle(0),
            data: b"b",
            tag: 8,
            timestamp_us: Some(50),
            flags: BufferFlags::END_OF_UNIT,
        })
        .unwrap();
        rx.try_iter().for_each(drop);
        (comp, rx)
    }

    fn emitted(rx: &crossbeam::channel::Receiver<HardwareEvent>) -> Vec<(u32, Option<i64>)> {
        rx.try_iter()
            .filter_map(|e| match e {
                HardwareEvent::OutputDone(done) => Some((done.tag, done.timestamp_us)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_process_without_reorder_emits_in_decode_order() {
        let (comp, rx) = executing(LoopbackConfig {
            reorder_depth: 0,
            ..manual()
        });
        assert_eq!(comp.control().process(), 4);
        assert_eq!(emitted(&rx), vec![(7, Some(100)), (8, Some(50))]);
    }

    #[test]
    fn test_process_holds_pictures_for_reorder() {
        let (comp, rx) = executing(LoopbackConfig {
            reorder_depth: 1,
            ..manual()
        });
        let control = comp.control();
        // Two held, depth one: the earlier timestamp goes first
        assert_eq!(control.process(), 3);
        assert_eq!(emitted(&rx), vec![(8, Some(50))]);
        assert_eq!(control.process(), 0);
    }

    #[test]
    fn test_synthetic_demuxer_order() {
        let mut demuxer = SyntheticDemuxer::new(CodecFormat::H264, 8, 25, true);
        let mut ids = Vec::new();
        while let Some(unit) = demuxer.read_unit() {
            ids.push(unit.user_id);
        }
        assert_eq!(ids, vec![0, 3, 1, 2, 6, 4, 5, 7]);

        let mut demuxer = SyntheticDemuxer::new(CodecFormat::H264, 30, 25, false);
        let first = demuxer.read_unit().unwrap();
        assert!(first.key);
        assert_eq!(first.timestamp_us, Some(0));
        assert_eq!(demuxer.skip_to_key_unit(), 11);
        let next = demuxer.read_unit().unwrap();
        assert_eq!(next.user_id, 12);
        assert!(next.key);

        assert!(demuxer.seek(1_000_000));
        assert_eq!(demuxer.read_unit().unwrap().user_id, 24);
        assert!(!demuxer.seek(10_000_000));
    }

    #[test]
    fn test_loader_refuses_and_records() {
        let loader = LoopbackLoader::new(manual()).refusing("hw.bad");
        let (events, _rx) = event_channel(8);
        assert!(matches!(
            loader.open(&Candidate::new("hw.bad", "video_decoder.avc"), events.clone()),
            Err(HwError::Refused(_))
        ));
        assert!(loader.last_control().is_none());
        loader.open(&Candidate::new("hw.good", "video_decoder.avc"), events).unwrap();
        assert!(loader.last_control().is_some());
        assert_eq!(loader.opened(), vec!["hw.bad", "hw.good"]);
    }
}
