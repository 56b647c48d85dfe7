// HARDWARE - Decoder Component Interface
//
// The concrete decoder (an OpenMAX-style component, a V4L2 mem2mem device, a
// vendor SDK) sits behind `DecoderComponent`. It exchanges buffers with the
// session through two ports and reports progress asynchronously:
//
// • Commands (state change, port enable/disable, flush) complete later
// • Input buffers come back once their bytes are consumed
// • Output buffers come back holding a decoded picture
// • Port settings changes and errors may arrive at any time
//
// Callbacks run on whatever thread the hardware likes. They only push an
// event into a bounded channel; the session's event pump applies it.

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::frame::{CropRect, FrameGeometry, InterlaceMode};

#[derive(Debug, Error)]
pub enum HwError {
    #[error("Component {0} refused to open")]
    Refused(String),
    #[error("Command {command:?} failed with code {code}")]
    CommandFailed { command: Command, code: i32 },
    #[error("Invalid buffer index {index} on {direction:?} port")]
    InvalidIndex { direction: PortDirection, index: usize },
    #[error("Buffer allocation failed: {0}")]
    AllocationFailed(String),
    #[error("Bad parameter: {0}")]
    BadParameter(String),
    #[error("Component is in the wrong state for {0}")]
    WrongState(&'static str),
}

// ============================================================================
// Formats and Ports
// ============================================================================

/// Coded video formats the registry can route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecFormat {
    H264,
    Hevc,
    Vp8,
    Vp9,
    Av1,
    Mpeg2,
    Mpeg4,
    Vc1,
}

impl CodecFormat {
    /// Parse from string (fourcc or name)
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "h264" | "avc" | "avc1" => Some(Self::H264),
            "h265" | "hevc" | "hvc1" | "hev1" => Some(Self::Hevc),
            "vp8" => Some(Self::Vp8),
            "vp9" => Some(Self::Vp9),
            "av1" | "av01" => Some(Self::Av1),
            "mpeg2" | "mpg2" | "mp2v" => Some(Self::Mpeg2),
            "mpeg4" | "mp4v" | "xvid" => Some(Self::Mpeg4),
            "vc1" | "wvc1" => Some(Self::Vc1),
            _ => None,
        }
    }

    /// Formats whose decoders want the codec configuration as a separate
    /// header unit before the first picture
    pub fn requires_primer(&self) -> bool {
        matches!(self, Self::Vc1 | Self::Mpeg4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    /// Coded data in
    Input,
    /// Decoded pictures out
    Output,
}

/// Negotiated shape of a port's buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortGeometry {
    /// Picture dimensions (output port only)
    pub frame: FrameGeometry,
    /// Smallest pool the component accepts
    pub buffer_count_min: usize,
    /// Pool size actually used
    pub buffer_count: usize,
    /// Bytes per buffer
    pub buffer_size: usize,
}

/// Opaque platform reference for one allocated buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PlatformHandle(pub u64);

/// Per-buffer flags passed to and from the component
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    /// Last chunk of an access unit
    pub const END_OF_UNIT: Self = Self(1 << 0);
    pub const END_OF_STREAM: Self = Self(1 << 1);
    /// Payload is codec configuration, not a picture
    pub const CODEC_CONFIG: Self = Self(1 << 2);
    pub const KEY_UNIT: Self = Self(1 << 3);
    /// Decode but do not present
    pub const DECODE_ONLY: Self = Self(1 << 4);
    /// Timestamp field carries nothing meaningful
    pub const TIME_UNKNOWN: Self = Self(1 << 5);
    /// Decoder reported damage in this picture
    pub const CORRUPT: Self = Self(1 << 6);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for BufferFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(BufferFlags, &str); 7] = [
            (BufferFlags::END_OF_UNIT, "EOU"),
            (BufferFlags::END_OF_STREAM, "EOS"),
            (BufferFlags::CODEC_CONFIG, "CONFIG"),
            (BufferFlags::KEY_UNIT, "KEY"),
            (BufferFlags::DECODE_ONLY, "DECODE_ONLY"),
            (BufferFlags::TIME_UNKNOWN, "TIME_UNKNOWN"),
            (BufferFlags::CORRUPT, "CORRUPT"),
        ];
        let set: Vec<&str> = NAMES.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, n)| *n).collect();
        write!(f, "BufferFlags({})", set.join("|"))
    }
}

// ============================================================================
// Commands and Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentState {
    Loaded,
    Idle,
    Executing,
}

/// Asynchronous commands; each completes with `HardwareEvent::CommandComplete`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    StateSet(ComponentState),
    PortDisable(PortDirection),
    PortEnable(PortDirection),
    /// Return every buffer held on the port without processing it
    Flush(PortDirection),
}

/// Unsolicited change reported on a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChange {
    /// Buffer count or size must be renegotiated
    Reconfigure,
    CropChanged(CropRect),
    InterlaceChanged(InterlaceMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwErrorCode {
    /// Profile or level beyond what the hardware decodes
    UnsupportedProfile,
    /// Damaged bitstream; decoding continues
    StreamCorrupt,
    /// Anything else the platform reports
    Platform(i32),
}

impl HwErrorCode {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::StreamCorrupt)
    }
}

/// A completed output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputDone {
    pub index: usize,
    pub filled_len: usize,
    /// Decode id echoed from the input unit, 0 if the component drops it
    pub tag: u32,
    pub timestamp_us: Option<i64>,
    pub flags: BufferFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareEvent {
    CommandComplete(Command),
    InputDone { index: usize },
    OutputDone(OutputDone),
    PortSettingsChanged { direction: PortDirection, change: PortChange },
    Error(HwErrorCode),
    /// Posted by the session itself to stop its event pump
    Shutdown,
}

/// Callback side of the event channel, handed to the component on open.
///
/// Never blocks: a full channel is reported and the event dropped. Every
/// drop is counted so the receiving side can treat the session as broken.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<HardwareEvent>,
    lost: Arc<AtomicU64>,
}

impl EventSink {
    pub fn post(&self, event: HardwareEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.lost.fetch_add(1, Ordering::SeqCst);
                tracing::error!("Hardware event channel full, dropped {:?}", event);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Events dropped because the channel was full, across all clones
    pub fn lost_events(&self) -> u64 {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }

    pub fn command_complete(&self, command: Command) -> bool {
        self.post(HardwareEvent::CommandComplete(command))
    }

    pub fn input_done(&self, index: usize) -> bool {
        self.post(HardwareEvent::InputDone { index })
    }

    pub fn output_done(&self, done: OutputDone) -> bool {
        self.post(HardwareEvent::OutputDone(done))
    }

    pub fn port_changed(&self, direction: PortDirection, change: PortChange) -> bool {
        self.post(HardwareEvent::PortSettingsChanged { direction, change })
    }

    pub fn error(&self, code: HwErrorCode) -> bool {
        self.post(HardwareEvent::Error(code))
    }
}

/// Create the bounded channel between hardware callbacks and the event pump
pub fn event_channel(capacity: usize) -> (EventSink, Receiver<HardwareEvent>) {
    let (tx, rx) = channel::bounded(capacity);
    let sink = EventSink {
        tx,
        lost: Arc::new(AtomicU64::new(0)),
    };
    (sink, rx)
}

// ============================================================================
// Component Interface
// ============================================================================

/// One coded buffer handed to the component
#[derive(Debug)]
pub struct InputBuffer<'a> {
    pub index: usize,
    pub handle: PlatformHandle,
    pub data: &'a [u8],
    pub tag: u32,
    pub timestamp_us: Option<i64>,
    pub flags: BufferFlags,
}

/// An opened hardware decoder
pub trait DecoderComponent: Send {
    fn name(&self) -> &str;

    fn port_geometry(&self, direction: PortDirection) -> Result<PortGeometry, HwError>;

    fn set_port_geometry(&mut self, direction: PortDirection, geometry: &PortGeometry) -> Result<(), HwError>;

    /// Allocate (or register) the buffer at `index` on a port
    fn allocate_buffer(&mut self, direction: PortDirection, index: usize, size: usize) -> Result<PlatformHandle, HwError>;

    fn free_buffer(&mut self, direction: PortDirection, index: usize, handle: PlatformHandle) -> Result<(), HwError>;

    /// Start an asynchronous command
    fn send_command(&mut self, command: Command) -> Result<(), HwError>;

    /// Pass coded data to the decoder. The buffer comes back via `InputDone`.
    fn empty_buffer(&mut self, buffer: InputBuffer<'_>) -> Result<(), HwError>;

    /// Lend an output buffer to the decoder. It comes back via `OutputDone`.
    fn fill_buffer(&mut self, index: usize, handle: PlatformHandle) -> Result<(), HwError>;

    /// Whether output buffers carry the input tag back
    fn echoes_timestamps(&self) -> bool {
        true
    }

    /// Pipeline delay added by the decoder (microseconds)
    fn latency_us(&self) -> i64 {
        0
    }
}

/// Name and role of one candidate decoder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub role: String,
}

impl Candidate {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
        }
    }
}

/// Opens components by name. Returns `HwError::Refused` for a candidate
/// that cannot handle the stream; the session then tries the next one.
pub trait ComponentLoader: Send + Sync {
    fn open(&self, candidate: &Candidate, events: EventSink) -> Result<Box<dyn DecoderComponent>, HwError>;
}

// ============================================================================
// Decoder Registry
// ============================================================================

struct Registration {
    format: CodecFormat,
    candidate: Candidate,
    loader: Arc<dyn ComponentLoader>,
}

/// Format → candidate decoders, built once at startup and passed to sessions
#[derive(Default)]
pub struct DecoderRegistry {
    entries: Vec<Registration>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate. Earlier registrations are tried first.
    pub fn register(&mut self, format: CodecFormat, candidate: Candidate, loader: Arc<dyn ComponentLoader>) -> &mut Self {
        tracing::debug!("Registered {} ({}) for {:?}", candidate.name, candidate.role, format);
        self.entries.push(Registration {
            format,
            candidate,
            loader,
        });
        self
    }

    /// Candidates for a format, in try order
    pub fn candidates(&self, format: CodecFormat) -> Vec<(Candidate, Arc<dyn ComponentLoader>)> {
        self.entries
            .iter()
            .filter(|r| r.format == format)
            .map(|r| (r.candidate.clone(), r.loader.clone()))
            .collect()
    }

    pub fn supports(&self, format: CodecFormat) -> bool {
        self.entries.iter().any(|r| r.format == format)
    }

    pub fn formats(&self) -> Vec<CodecFormat> {
        let mut formats: Vec<CodecFormat> = Vec::new();
        for r in &self.entries {
            if !formats.contains(&r.format) {
                formats.push(r.format);
            }
        }
        formats
    }
}

// ============================================================================
// Tests
// ============================================================================
