//! # Buffer Port
//!
//! One of the two buffer-exchange endpoints of a decoder session. A port owns
//! a fixed pool of [`BufferDescriptor`]s and tracks who holds each one:
//!
//! ```text
//!   Init/Ready ──submit──► Submitted ──complete──► Completed ──claim──► Claimed
//!        ▲                  (hardware)      │       (queue)             (caller)
//!        │                                  │ input / discarding           │
//!        └──────────────────────────────────┴──────────── reclaim ◄────────┘
//! ```
//!
//! All state changes happen under the port lock. Completion handlers only
//! update state and signal; they never block.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::frame::{CropRect, FrameHandle, FramePool, InterlaceMode};
use crate::frame_queue::FrameQueue;
use crate::hardware::{
    BufferFlags, DecoderComponent, HwError, InputBuffer, OutputDone, PlatformHandle, PortChange, PortDirection,
    PortGeometry,
};

#[derive(Debug, Error)]
pub enum PortError {
    #[error(transparent)]
    Hardware(#[from] HwError),
    #[error("Frame pool has {available} free frames, port needs {needed}")]
    PoolExhausted { needed: usize, available: usize },
    #[error("{0} buffers still owned by hardware")]
    BuffersInFlight(usize),
    #[error("Payload of {len} bytes exceeds buffer size {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },
    #[error("Output port has no frame pool")]
    NoFramePool,
}

// ============================================================================
// Descriptors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Allocated, never used
    Init,
    /// Free, owned by the port
    Ready,
    /// Owned by hardware
    Submitted,
    /// Returned by hardware, waiting in the completion queue
    Completed,
    /// Handed to the caller
    Claimed,
}

/// Bookkeeping for one hardware-visible buffer slot
#[derive(Debug)]
pub struct BufferDescriptor {
    pub index: usize,
    pub state: BufferState,
    pub direction: PortDirection,
    pub platform_handle: PlatformHandle,
    /// Frame lent to this slot (output port); absent while queued or claimed
    backing_frame: Option<FrameHandle>,
    /// Pool slot of the backing frame, kept while the handle is elsewhere
    backing_slot: Option<usize>,
    /// Coded bytes (input port)
    payload: Vec<u8>,
    last_done: Option<OutputDone>,
}

impl BufferDescriptor {
    pub fn backing_slot(&self) -> Option<usize> {
        self.backing_slot
    }

    fn is_free(&self) -> bool {
        matches!(self.state, BufferState::Init | BufferState::Ready)
    }
}

/// Pending port change notifications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortEvents(u8);

impl PortEvents {
    pub const RECONFIGURE: Self = Self(1 << 0);
    pub const CROP_CHANGED: Self = Self(1 << 1);
    pub const INTERLACE_CHANGED: Self = Self(1 << 2);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Port change notifications taken in one go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingChanges {
    pub events: PortEvents,
    pub crop: Option<CropRect>,
    pub interlace: Option<InterlaceMode>,
}

/// Result of an attempted submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Submitted,
    /// At the in-flight limit, descriptor busy, or port disabled
    Busy,
}

struct PortState {
    descriptors: Vec<BufferDescriptor>,
    geometry: PortGeometry,
    max_in_flight: usize,
    in_flight: usize,
    enabled: bool,
    /// While set, output completions are recycled instead of queued
    discarding: bool,
    pending: PendingChanges,
    submitted_total: u64,
    completed_total: u64,
}

// ============================================================================
// Buffer Port
// ============================================================================

pub struct BufferPort {
    direction: PortDirection,
    state: Mutex<PortState>,
    cond: Condvar,
    completion_queue: FrameQueue,
}

impl BufferPort {
    pub fn new(direction: PortDirection) -> Self {
        let queue_name = match direction {
            PortDirection::Input => "input-completions",
            PortDirection::Output => "output-completions",
        };
        Self {
            direction,
            state: Mutex::new(PortState {
                descriptors: Vec::new(),
                geometry: PortGeometry::default(),
                max_in_flight: 0,
                in_flight: 0,
                enabled: false,
                discarding: false,
                pending: PendingChanges::default(),
                submitted_total: 0,
                completed_total: 0,
            }),
            cond: Condvar::new(),
            completion_queue: FrameQueue::new(queue_name),
        }
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    // ========================================================================
    // Pool lifecycle
    // ========================================================================

    /// Build the descriptor pool for `geometry`.
    ///
    /// Output descriptors each take a frame from `frames`, waiting up to
    /// `frame_wait` for frames still out with the caller. At most
    /// `in_flight_limit` descriptors may be with hardware at once.
    pub fn allocate(
        &self,
        component: &mut dyn DecoderComponent,
        geometry: PortGeometry,
        in_flight_limit: usize,
        frames: Option<&Arc<FramePool>>,
        frame_wait: Duration,
    ) -> Result<(), PortError> {
        let in_flight = self.state.lock().in_flight;
        if in_flight > 0 {
            return Err(PortError::BuffersInFlight(in_flight));
        }

        // Frames come back through `reclaim`, which needs the port lock
        let count = geometry.buffer_count;
        let mut backing = Vec::new();
        if self.direction == PortDirection::Output {
            let pool = frames.ok_or(PortError::NoFramePool)?;
            let deadline = Instant::now() + frame_wait;
            for _ in 0..count {
                let wait = deadline.saturating_duration_since(Instant::now());
                match pool.acquire_timeout(wait) {
                    Some(handle) => backing.push(handle),
                    None => {
                        let available = backing.len();
                        for handle in backing {
                            pool.release(handle);
                        }
                        return Err(PortError::PoolExhausted { needed: count, available });
                    }
                }
            }
        }

        let mut state = self.state.lock();
        let mut descriptors: Vec<BufferDescriptor> = Vec::with_capacity(count);
        let mut backing = backing.into_iter();
        for index in 0..count {
            let platform_handle = match component.allocate_buffer(self.direction, index, geometry.buffer_size) {
                Ok(handle) => handle,
                Err(e) => {
                    // Undo what was allocated so far
                    for desc in descriptors.drain(..) {
                        if let Err(e) = component.free_buffer(self.direction, desc.index, desc.platform_handle) {
                            tracing::warn!("{:?} port: free_buffer({}) failed: {}", self.direction, desc.index, e);
                        }
                        if let (Some(pool), Some(handle)) = (frames, desc.backing_frame) {
                            pool.release(handle);
                        }
                    }
                    if let Some(pool) = frames {
                        for handle in backing {
                            pool.release(handle);
                        }
                    }
                    return Err(PortError::Hardware(e));
                }
            };
            let backing_frame = backing.next();
            let payload = match self.direction {
                PortDirection::Input => Vec::with_capacity(geometry.buffer_size),
                PortDirection::Output => Vec::new(),
            };
            descriptors.push(BufferDescriptor {
                index,
                state: BufferState::Init,
                direction: self.direction,
                platform_handle,
                backing_slot: backing_frame.as_ref().map(FrameHandle::slot),
                backing_frame,
                payload,
                last_done: None,
            });
        }

        state.descriptors = descriptors;
        state.geometry = geometry;
        state.max_in_flight = in_flight_limit.clamp(1, count.max(1));
        state.discarding = false;
        tracing::debug!(
            "{:?} port: {} buffers of {} bytes, {} in flight max",
            self.direction,
            count,
            geometry.buffer_size,
            state.max_in_flight
        );
        Ok(())
    }

    /// Free every descriptor. Hardware must hold none of them.
    ///
    /// Returns backing frames the port still held, including frames waiting in
    /// the completion queue. Frames the caller holds are returned later through
    /// [`BufferPort::reclaim`], which will no longer find their descriptor.
    pub fn free_all(&self, component: &mut dyn DecoderComponent) -> Result<Vec<FrameHandle>, PortError> {
        let mut state = self.state.lock();
        if state.in_flight > 0 {
            return Err(PortError::BuffersInFlight(state.in_flight));
        }
        let mut frames = self.completion_queue.flush();
        for desc in state.descriptors.drain(..) {
            if let Err(e) = component.free_buffer(self.direction, desc.index, desc.platform_handle) {
                tracing::warn!("{:?} port: free_buffer({}) failed: {}", self.direction, desc.index, e);
            }
            if let Some(handle) = desc.backing_frame {
                frames.push(handle);
            }
        }
        state.max_in_flight = 0;
        Ok(frames)
    }

    /// Drop descriptors without telling hardware (component already gone)
    pub fn forget_all(&self) -> Vec<FrameHandle> {
        let mut state = self.state.lock();
        let mut frames = self.completion_queue.flush();
        frames.extend(state.descriptors.drain(..).filter_map(|d| d.backing_frame));
        state.in_flight = 0;
        state.max_in_flight = 0;
        drop(state);
        self.cond.notify_all();
        frames
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Copy coded bytes into a free input descriptor and hand it to hardware
    pub fn submit_input(
        &self,
        component: &mut dyn DecoderComponent,
        index: usize,
        data: &[u8],
        tag: u32,
        timestamp_us: Option<i64>,
        flags: BufferFlags,
    ) -> Result<Submit, PortError> {
        let mut state = self.state.lock();
        if !Self::can_submit(&state, index) {
            return Ok(Submit::Busy);
        }
        let capacity = state.geometry.buffer_size;
        if data.len() > capacity {
            return Err(PortError::PayloadTooLarge { len: data.len(), capacity });
        }

        let desc = &mut state.descriptors[index];
        desc.payload.clear();
        desc.payload.extend_from_slice(data);
        component.empty_buffer(InputBuffer {
            index,
            handle: desc.platform_handle,
            data: &desc.payload,
            tag,
            timestamp_us,
            flags,
        })?;
        desc.state = BufferState::Submitted;
        state.in_flight += 1;
        state.submitted_total += 1;
        Ok(Submit::Submitted)
    }

    /// Lend a free output descriptor to hardware
    pub fn submit_output(&self, component: &mut dyn DecoderComponent, index: usize) -> Result<Submit, PortError> {
        let mut state = self.state.lock();
        if !Self::can_submit(&state, index) || state.descriptors[index].backing_frame.is_none() {
            return Ok(Submit::Busy);
        }
        let desc = &mut state.descriptors[index];
        component.fill_buffer(index, desc.platform_handle)?;
        desc.state = BufferState::Submitted;
        desc.last_done = None;
        state.in_flight += 1;
        state.submitted_total += 1;
        Ok(Submit::Submitted)
    }

    /// Lend every free output descriptor, stopping at the in-flight limit
    pub fn submit_all_outputs(&self, component: &mut dyn DecoderComponent) -> Result<usize, PortError> {
        let count = self.state.lock().descriptors.len();
        let mut submitted = 0;
        for index in 0..count {
            if self.submit_output(component, index)? == Submit::Submitted {
                submitted += 1;
            }
        }
        Ok(submitted)
    }

    fn can_submit(state: &PortState, index: usize) -> bool {
        state.enabled
            && state.in_flight < state.max_in_flight
            && state.descriptors.get(index).map_or(false, BufferDescriptor::is_free)
    }

    /// Find a free descriptor that may be submitted now
    pub fn acquire_free(&self) -> Option<usize> {
        let state = self.state.lock();
        Self::find_free(&state)
    }

    /// Like [`BufferPort::acquire_free`], waiting up to `timeout`.
    ///
    /// Gives up early once `run` is cleared.
    pub fn acquire_free_timeout(&self, timeout: Duration, run: &AtomicBool) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(index) = Self::find_free(&state) {
                return Some(index);
            }
            if !run.load(Ordering::SeqCst) {
                return None;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Self::find_free(&state);
            }
        }
    }

    fn find_free(state: &PortState) -> Option<usize> {
        if !state.enabled || state.in_flight >= state.max_in_flight {
            return None;
        }
        state.descriptors.iter().find(|d| d.is_free()).map(|d| d.index)
    }

    // ========================================================================
    // Completion (event pump context)
    // ========================================================================

    /// Hardware is done with an input buffer
    pub fn on_input_done(&self, index: usize) {
        let mut state = self.state.lock();
        match state.descriptors.get_mut(index) {
            Some(desc) if desc.state == BufferState::Submitted => {
                desc.state = BufferState::Ready;
                state.in_flight -= 1;
                state.completed_total += 1;
            }
            _ => {
                tracing::warn!("{:?} port: completion for buffer {} not owned by hardware", self.direction, index);
                return;
            }
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Hardware returned an output buffer
    pub fn on_output_done(&self, done: OutputDone) {
        let mut state = self.state.lock();
        let discarding = state.discarding || !state.enabled;
        let Some(desc) = state.descriptors.get_mut(done.index) else {
            tracing::warn!("{:?} port: completion for unknown buffer {}", self.direction, done.index);
            return;
        };
        if desc.state != BufferState::Submitted {
            tracing::warn!("{:?} port: completion for buffer {} in state {:?}", self.direction, done.index, desc.state);
            return;
        }

        let queued = if discarding || done.filled_len == 0 && !done.flags.contains(BufferFlags::END_OF_STREAM) {
            desc.state = BufferState::Ready;
            None
        } else {
            desc.state = BufferState::Completed;
            desc.last_done = Some(done);
            desc.backing_frame.take()
        };
        state.in_flight -= 1;
        state.completed_total += 1;
        if let Some(handle) = queued {
            if let Err(handle) = self.completion_queue.push_back(handle) {
                // Queue closed during teardown; keep the frame on the descriptor
                if let Some(desc) = state.descriptors.get_mut(done.index) {
                    desc.state = BufferState::Ready;
                    desc.backing_frame = Some(handle);
                }
            }
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Record an unsolicited port change
    pub fn post_change(&self, change: PortChange) {
        let mut state = self.state.lock();
        match change {
            PortChange::Reconfigure => state.pending.events.insert(PortEvents::RECONFIGURE),
            PortChange::CropChanged(crop) => {
                state.pending.events.insert(PortEvents::CROP_CHANGED);
                state.pending.crop = Some(crop);
            }
            PortChange::InterlaceChanged(mode) => {
                state.pending.events.insert(PortEvents::INTERLACE_CHANGED);
                state.pending.interlace = Some(mode);
            }
        }
        drop(state);
        self.cond.notify_all();
        self.completion_queue.wake();
    }

    /// Take and clear pending change notifications
    pub fn take_changes(&self) -> PendingChanges {
        std::mem::take(&mut self.state.lock().pending)
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.state.lock().pending.events.is_empty()
    }

    /// Wake every waiter (shutdown, fatal error)
    pub fn notify_all(&self) {
        self.cond.notify_all();
        self.completion_queue.wake();
    }

    // ========================================================================
    // Caller side (output port)
    // ========================================================================

    /// Next completed output frame, in completion order
    pub fn pop_completed(&self) -> Option<FrameHandle> {
        self.completion_queue.pop()
    }

    /// Wait for a completed frame or a port change notification
    pub fn wait_completion(&self, timeout: Duration) -> bool {
        if self.has_pending_changes() {
            return true;
        }
        self.completion_queue.wait_nonempty(timeout) || self.has_pending_changes()
    }

    /// Mark the descriptor backing `slot` as handed to the caller
    pub fn claim(&self, slot: usize) -> Option<(usize, OutputDone)> {
        let mut state = self.state.lock();
        let desc = state
            .descriptors
            .iter_mut()
            .find(|d| d.backing_slot == Some(slot) && d.state == BufferState::Completed)?;
        let done = desc.last_done?;
        desc.state = BufferState::Claimed;
        Some((desc.index, done))
    }

    /// Give a caller-held frame back to its descriptor, which becomes `Ready`.
    ///
    /// Returns the handle if its descriptor no longer exists (pool was rebuilt);
    /// the caller then returns it to the frame pool.
    pub fn reclaim(&self, handle: FrameHandle) -> Result<usize, FrameHandle> {
        let mut state = self.state.lock();
        let slot = handle.slot();
        let Some(desc) = state
            .descriptors
            .iter_mut()
            .find(|d| d.backing_slot == Some(slot) && d.backing_frame.is_none())
        else {
            return Err(handle);
        };
        desc.backing_frame = Some(handle);
        desc.state = BufferState::Ready;
        desc.last_done = None;
        let index = desc.index;
        drop(state);
        self.cond.notify_all();
        Ok(index)
    }

    /// Move completed-but-unclaimed frames back to their descriptors.
    ///
    /// Returns frames whose descriptor no longer exists.
    pub fn recycle_completed(&self) -> Vec<FrameHandle> {
        let mut orphans = Vec::new();
        while let Some(handle) = self.completion_queue.pop() {
            if let Err(handle) = self.reclaim(handle) {
                tracing::warn!("Completed frame slot {} has no descriptor", handle.slot());
                orphans.push(handle);
            }
        }
        orphans
    }

    // ========================================================================
    // Enable / disable bookkeeping
    // ========================================================================

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
        self.cond.notify_all();
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Route output completions back to `Ready` instead of the queue
    pub fn set_discarding(&self, discarding: bool) {
        self.state.lock().discarding = discarding;
    }

    /// Wait until hardware holds no buffers of this port
    pub fn wait_drained(&self, timeout: Duration, run: &AtomicBool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.in_flight > 0 {
            if !run.load(Ordering::SeqCst) {
                return false;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.in_flight == 0;
            }
        }
        true
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn geometry(&self) -> PortGeometry {
        self.state.lock().geometry
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().descriptors.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    pub fn completed_len(&self) -> usize {
        self.completion_queue.len()
    }

    /// Ownership view of every descriptor
    pub fn snapshot(&self) -> PortSnapshot {
        let state = self.state.lock();
        PortSnapshot {
            direction: self.direction,
            buffers: state
                .descriptors
                .iter()
                .map(|d| BufferView {
                    index: d.index,
                    state: d.state,
                    backing_slot: d.backing_slot,
                    holds_frame: d.backing_frame.is_some(),
                })
                .collect(),
            queued_slots: self.completion_queue.slots(),
            in_flight: state.in_flight,
            max_in_flight: state.max_in_flight,
            submitted_total: state.submitted_total,
            completed_total: state.completed_total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferView {
    pub index: usize,
    pub state: BufferState,
    pub backing_slot: Option<usize>,
    pub holds_frame: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSnapshot {
    pub direction: PortDirection,
    pub buffers: Vec<BufferView>,
    pub queued_slots: Vec<usize>,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub submitted_total: u64,
    pub completed_total: u64,
}

impl PortSnapshot {
    pub fn count(&self, state: BufferState) -> usize {
        self.buffers.iter().filter(|b| b.state == state).count()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameGeometry;
    use crate::hardware::{Command, PortDirection};

    /// Accepts everything, remembers nothing
    struct StubComponent {
        allocated: usize,
        freed: usize,
        /// Refuse to allocate this index
        fail_at: Option<usize>,
    }

    impl DecoderComponent for StubComponent {
        fn name(&self) -> &str {
            "stub"
        }
        fn port_geometry(&self, _: PortDirection) -> Result<PortGeometry, HwError> {
            Ok(PortGeometry::default())
        }
        fn set_port_geometry(&mut self, _: PortDirection, _: &PortGeometry) -> Result<(), HwError> {
            Ok(())
        }
        fn allocate_buffer(&mut self, _: PortDirection, index: usize, _: usize) -> Result<PlatformHandle, HwError> {
            if self.fail_at == Some(index) {
                return Err(HwError::AllocationFailed(format!("buffer {}", index)));
            }
            self.allocated += 1;
            Ok(PlatformHandle(index as u64 + 100))
        }
        fn free_buffer(&mut self, _: PortDirection, _: usize, _: PlatformHandle) -> Result<(), HwError> {
            self.freed += 1;
            Ok(())
        }
        fn send_command(&mut self, _: Command) -> Result<(), HwError> {
            Ok(())
        }
        fn empty_buffer(&mut self, _: InputBuffer<'_>) -> Result<(), HwError> {
            Ok(())
        }
        fn fill_buffer(&mut self, _: usize, _: PlatformHandle) -> Result<(), HwError> {
            Ok(())
        }
    }

    fn stub() -> StubComponent {
        StubComponent {
            allocated: 0,
            freed: 0,
            fail_at: None,
        }
    }

    fn input_geometry(count: usize) -> PortGeometry {
        PortGeometry {
            frame: FrameGeometry::default(),
            buffer_count_min: 1,
            buffer_count: count,
            buffer_size: 1024,
        }
    }

    fn done(index: usize, tag: u32) -> OutputDone {
        OutputDone {
            index,
            filled_len: 64,
            tag,
            timestamp_us: Some(tag as i64),
            flags: BufferFlags::NONE,
        }
    }

    /// Tiny deterministic PRNG for the ownership fuzz
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test]
    fn test_backpressure_at_in_flight_limit() {
        let mut hw = stub();
        let port = BufferPort::new(PortDirection::Input);
        port.allocate(&mut hw, input_geometry(6), 4, None, Duration::ZERO).unwrap();
        port.set_enabled(true);

        for _ in 0..4 {
            let index = port.acquire_free().unwrap();
            assert_eq!(port.submit_input(&mut hw, index, b"au", 1, Some(0), BufferFlags::END_OF_UNIT).unwrap(), Submit::Submitted);
        }
        // Free descriptors exist, but the in-flight window is full
        assert_eq!(port.acquire_free(), None);
        assert_eq!(port.submit_input(&mut hw, 4, b"au", 1, None, BufferFlags::NONE).unwrap(), Submit::Busy);

        port.on_input_done(2);
        let index = port.acquire_free().unwrap();
        assert_eq!(port.submit_input(&mut hw, index, b"au", 1, None, BufferFlags::NONE).unwrap(), Submit::Submitted);
        assert_eq!(port.in_flight(), 4);
    }

    #[test]
    fn test_acquire_free_timeout_wakes_on_completion() {
        let mut hw = stub();
        let port = Arc::new(BufferPort::new(PortDirection::Input));
        port.allocate(&mut hw, input_geometry(1), 1, None, Duration::ZERO).unwrap();
        port.set_enabled(true);
        port.submit_input(&mut hw, 0, b"x", 1, None, BufferFlags::NONE).unwrap();

        let run = Arc::new(AtomicBool::new(true));
        let completer = {
            let port = port.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                port.on_input_done(0);
            })
        };
        assert_eq!(port.acquire_free_timeout(Duration::from_secs(5), &run), Some(0));
        completer.join().unwrap();
    }

    #[test]
    fn test_acquire_free_cancelled() {
        let mut hw = stub();
        let port = BufferPort::new(PortDirection::Input);
        port.allocate(&mut hw, input_geometry(1), 1, None, Duration::ZERO).unwrap();
        port.set_enabled(true);
        port.submit_input(&mut hw, 0, b"x", 1, None, BufferFlags::NONE).unwrap();
        let run = AtomicBool::new(false);
        assert_eq!(port.acquire_free_timeout(Duration::from_secs(5), &run), None);
    }

    #[test]
    fn test_payload_too_large() {
        let mut hw = stub();
        let port = BufferPort::new(PortDirection::Input);
        port.allocate(&mut hw, input_geometry(1), 1, None, Duration::ZERO).unwrap();
        port.set_enabled(true);
        let big = vec![0u8; 2048];
        assert!(matches!(
            port.submit_input(&mut hw, 0, &big, 1, None, BufferFlags::NONE),
            Err(PortError::PayloadTooLarge { len: 2048, capacity: 1024 })
        ));
        assert_eq!(port.in_flight(), 0);
    }

    #[test]
    fn test_output_cycle_and_reclaim() {
        let mut hw = stub();
        let frames = Arc::new(FramePool::new(3, FrameGeometry::new(64, 64)));
        let port = BufferPort::new(PortDirection::Output);
        port.allocate(&mut hw, input_geometry(3), 3, Some(&frames), Duration::ZERO).unwrap();
        port.set_enabled(true);
        assert_eq!(port.submit_all_outputs(&mut hw).unwrap(), 3);
        assert_eq!(frames.available(), 0);

        port.on_output_done(done(1, 7));
        let handle = port.pop_completed().unwrap();
        let (index, info) = port.claim(handle.slot()).unwrap();
        assert_eq!(index, 1);
        assert_eq!(info.tag, 7);
        assert_eq!(port.snapshot().count(BufferState::Claimed), 1);

        assert_eq!(port.reclaim(handle), Ok(1));
        assert_eq!(port.submit_output(&mut hw, 1).unwrap(), Submit::Submitted);
    }

    #[test]
    fn test_discarding_recycles_outputs() {
        let mut hw = stub();
        let frames = Arc::new(FramePool::new(2, FrameGeometry::new(64, 64)));
        let port = BufferPort::new(PortDirection::Output);
        port.allocate(&mut hw, input_geometry(2), 2, Some(&frames), Duration::ZERO).unwrap();
        port.set_enabled(true);
        port.submit_all_outputs(&mut hw).unwrap();

        port.set_discarding(true);
        port.on_output_done(done(0, 1));
        port.on_output_done(done(1, 2));
        assert_eq!(port.completed_len(), 0);
        assert_eq!(port.snapshot().count(BufferState::Ready), 2);

        let run = AtomicBool::new(true);
        assert!(port.wait_drained(Duration::from_millis(10), &run));
        let returned = port.free_all(&mut hw).unwrap();
        assert_eq!(returned.len(), 2);
        for h in returned {
            frames.release(h);
        }
        assert_eq!(hw.freed, 2);
    }

    #[test]
    fn test_free_all_refuses_while_in_flight() {
        let mut hw = stub();
        let port = BufferPort::new(PortDirection::Input);
        port.allocate(&mut hw, input_geometry(2), 2, None, Duration::ZERO).unwrap();
        port.set_enabled(true);
        port.submit_input(&mut hw, 0, b"x", 1, None, BufferFlags::NONE).unwrap();
        assert!(matches!(port.free_all(&mut hw), Err(PortError::BuffersInFlight(1))));
    }

    #[test]
    fn test_pool_exhausted_returns_frames() {
        let mut hw = stub();
        let frames = Arc::new(FramePool::new(2, FrameGeometry::new(64, 64)));
        let port = BufferPort::new(PortDirection::Output);
        let err = port.allocate(&mut hw, input_geometry(4), 4, Some(&frames), Duration::ZERO).unwrap_err();
        assert!(matches!(err, PortError::PoolExhausted { needed: 4, available: 2 }));
        assert_eq!(frames.available(), 2);
    }

    #[test]
    fn test_failed_allocation_rolls_back() {
        let mut hw = StubComponent {
            fail_at: Some(2),
            ..stub()
        };
        let frames = Arc::new(FramePool::new(4, FrameGeometry::new(64, 64)));
        let port = BufferPort::new(PortDirection::Output);
        let err = port.allocate(&mut hw, input_geometry(4), 4, Some(&frames), Duration::ZERO).unwrap_err();
        assert!(matches!(err, PortError::Hardware(HwError::AllocationFailed(_))));

        // The two buffers allocated before the failure are freed again
        assert_eq!(hw.allocated, 2);
        assert_eq!(hw.freed, 2);
        assert_eq!(port.buffer_count(), 0);
        assert_eq!(frames.available(), 4);
    }

    #[test]
    fn test_reclaim_after_rebuild_hands_frame_back() {
        let mut hw = stub();
        let frames = Arc::new(FramePool::new(4, FrameGeometry::new(64, 64)));
        let port = BufferPort::new(PortDirection::Output);
        port.allocate(&mut hw, input_geometry(2), 2, Some(&frames), Duration::ZERO).unwrap();
        port.set_enabled(true);
        port.submit_all_outputs(&mut hw).unwrap();
        port.on_output_done(done(0, 1));
        let held = port.pop_completed().unwrap();
        port.claim(held.slot()).unwrap();

        port.set_discarding(true);
        port.on_output_done(done(1, 2));
        for h in port.free_all(&mut hw).unwrap() {
            frames.release(h);
        }
        port.allocate(&mut hw, input_geometry(2), 2, Some(&frames), Duration::ZERO).unwrap();

        // The old descriptor is gone; the caller releases to the pool instead
        let orphan = port.reclaim(held).unwrap_err();
        frames.release(orphan);
        assert_eq!(frames.available(), 2);
    }

    #[test]
    fn test_port_change_bits() {
        let port = BufferPort::new(PortDirection::Output);
        let crop = CropRect { left: 0, top: 0, width: 1920, height: 1080 };
        port.post_change(PortChange::CropChanged(crop));
        port.post_change(PortChange::Reconfigure);
        assert!(port.has_pending_changes());

        let changes = port.take_changes();
        assert!(changes.events.contains(PortEvents::RECONFIGURE));
        assert!(changes.events.contains(PortEvents::CROP_CHANGED));
        assert!(!changes.events.contains(PortEvents::INTERLACE_CHANGED));
        assert_eq!(changes.crop, Some(crop));
        assert!(!port.has_pending_changes());
    }

    #[test]
    fn test_ownership_exclusivity_fuzz() {
        let mut hw = stub();
        let frames = Arc::new(FramePool::new(6, FrameGeometry::new(32, 32)));
        let port = BufferPort::new(PortDirection::Output);
        port.allocate(&mut hw, input_geometry(6), 4, Some(&frames), Duration::ZERO).unwrap();
        port.set_enabled(true);

        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
        let mut caller: Vec<FrameHandle> = Vec::new();

        for step in 0..5000 {
            match rng.next() % 4 {
                0 => {
                    if let Some(index) = port.acquire_free() {
                        port.submit_output(&mut hw, index).unwrap();
                    }
                }
                1 => {
                    let snap = port.snapshot();
                    let submitted: Vec<usize> = snap
                        .buffers
                        .iter()
                        .filter(|b| b.state == BufferState::Submitted)
                        .map(|b| b.index)
                        .collect();
                    if !submitted.is_empty() {
                        let index = submitted[(rng.next() as usize) % submitted.len()];
                        port.on_output_done(done(index, step));
                    }
                }
                2 => {
                    if let Some(handle) = port.pop_completed() {
                        port.claim(handle.slot()).unwrap();
                        caller.push(handle);
                    }
                }
                _ => {
                    if !caller.is_empty() {
                        let pick = (rng.next() as usize) % caller.len();
                        let handle = caller.swap_remove(pick);
                        port.reclaim(handle).unwrap();
                    }
                }
            }

            // Every slot is in exactly one place
            let snap = port.snapshot();
            assert!(snap.in_flight <= snap.max_in_flight);
            assert_eq!(snap.in_flight, snap.count(BufferState::Submitted));
            let mut owners = vec![0u32; 6];
            for b in &snap.buffers {
                let slot = b.backing_slot.unwrap();
                match b.state {
                    BufferState::Init | BufferState::Ready | BufferState::Submitted => {
                        assert!(b.holds_frame);
                        owners[slot] += 1;
                    }
                    BufferState::Completed | BufferState::Claimed => assert!(!b.holds_frame),
                }
            }
            for slot in &snap.queued_slots {
                owners[*slot] += 1;
            }
            for h in &caller {
                owners[h.slot()] += 1;
            }
            assert!(owners.iter().all(|&n| n == 1), "step {}: {:?}", step, owners);
        }

        for h in caller {
            port.reclaim(h).unwrap();
        }
    }
}
