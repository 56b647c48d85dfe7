//! Presentation order recovery.
//!
//! The decoder may complete pictures in a different order than they were
//! submitted, and not every decoder echoes the timestamp it was given. Two
//! structures recover what the demuxer originally said about each picture:
//!
//! - [`TimestampReorderMap`]: decode id → (kind, user id, timestamp) in a
//!   fixed ring, plus a strict FIFO of submitted timestamps, kept only for
//!   decoders that drop them.
//! - [`DisplayReorder`]: holds completed pictures until they are the earliest
//!   timestamp still outstanding, or until the reorder window overflows.

use std::collections::BTreeMap;

use crate::frame::UnitKind;

/// Ring size of the decode id map
pub const REORDER_SLOTS: usize = 32;
/// Depth of the submitted timestamp FIFO
pub const TIMESTAMP_FIFO_DEPTH: usize = 32;

/// What was recorded for one submitted access unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorderEntry {
    pub decode_id: u32,
    pub kind: UnitKind,
    pub user_id: u64,
    /// `None` when the demuxer had no timestamp for the unit
    pub timestamp_us: Option<i64>,
    pub key: bool,
}

// ============================================================================
// Timestamp Reorder Map
// ============================================================================

pub struct TimestampReorderMap {
    slots: [Option<ReorderEntry>; REORDER_SLOTS],
    /// Next slot to write; the newest entry sits just behind it
    cursor: usize,
    next_decode_id: u32,
    /// Decoder echoes tags, so completions are found by lookup alone
    echoes_timestamps: bool,
    ts_fifo: [i64; TIMESTAMP_FIFO_DEPTH],
    fifo_head: usize,
    fifo_len: usize,
}

impl TimestampReorderMap {
    /// `echoes_timestamps` false keeps the submitted timestamp FIFO
    pub fn new(echoes_timestamps: bool) -> Self {
        Self {
            slots: [None; REORDER_SLOTS],
            cursor: 0,
            next_decode_id: 1,
            echoes_timestamps,
            ts_fifo: [0; TIMESTAMP_FIFO_DEPTH],
            fifo_head: 0,
            fifo_len: 0,
        }
    }

    /// Record a submitted unit, returning the decode id to tag it with.
    ///
    /// The oldest slot is overwritten once the ring is full.
    pub fn record(&mut self, kind: UnitKind, user_id: u64, timestamp_us: Option<i64>, key: bool) -> u32 {
        let decode_id = self.next_decode_id;
        // Zero is reserved for "no tag"
        self.next_decode_id = self.next_decode_id.wrapping_add(1).max(1);

        self.slots[self.cursor] = Some(ReorderEntry {
            decode_id,
            kind,
            user_id,
            timestamp_us,
            key,
        });
        self.cursor = (self.cursor + 1) % REORDER_SLOTS;

        if kind != UnitKind::Primer && !self.echoes_timestamps {
            if let Some(ts) = timestamp_us {
                self.push_timestamp(ts);
            }
        }
        decode_id
    }

    /// Find the entry for a decode id, scanning from the newest slot backwards
    pub fn lookup(&self, decode_id: u32) -> Option<ReorderEntry> {
        (1..=REORDER_SLOTS)
            .map(|back| (self.cursor + REORDER_SLOTS - back) % REORDER_SLOTS)
            .filter_map(|slot| self.slots[slot])
            .find(|entry| entry.decode_id == decode_id)
    }

    fn push_timestamp(&mut self, ts: i64) {
        if self.fifo_len == TIMESTAMP_FIFO_DEPTH {
            tracing::warn!("Timestamp FIFO full, dropping oldest {}", self.ts_fifo[self.fifo_head]);
            self.fifo_head = (self.fifo_head + 1) % TIMESTAMP_FIFO_DEPTH;
            self.fifo_len -= 1;
        }
        let tail = (self.fifo_head + self.fifo_len) % TIMESTAMP_FIFO_DEPTH;
        self.ts_fifo[tail] = ts;
        self.fifo_len += 1;
    }

    /// Oldest submitted timestamp, strict FIFO
    pub fn pop_timestamp(&mut self) -> Option<i64> {
        if self.fifo_len == 0 {
            return None;
        }
        let ts = self.ts_fifo[self.fifo_head];
        self.fifo_head = (self.fifo_head + 1) % TIMESTAMP_FIFO_DEPTH;
        self.fifo_len -= 1;
        Some(ts)
    }

    pub fn pending_timestamps(&self) -> usize {
        self.fifo_len
    }

    /// Forget everything (seek, flush, open)
    pub fn reset(&mut self) {
        self.slots = [None; REORDER_SLOTS];
        self.cursor = 0;
        self.fifo_head = 0;
        self.fifo_len = 0;
    }
}

// ============================================================================
// Display Reorder
// ============================================================================

/// Releases completed items in timestamp order.
///
/// An item is released once its timestamp is the smallest one still
/// outstanding. If more than `window` items are held, the earliest is
/// released anyway and any smaller outstanding timestamps are written off as
/// lost, so a picture the decoder never emits cannot stall the stream.
pub struct DisplayReorder<T> {
    window: usize,
    outstanding: BTreeMap<i64, usize>,
    held: BTreeMap<(i64, u64), T>,
    seq: u64,
    lost: u64,
}

impl<T> DisplayReorder<T> {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            outstanding: BTreeMap::new(),
            held: BTreeMap::new(),
            seq: 0,
            lost: 0,
        }
    }

    pub fn set_window(&mut self, window: usize) {
        self.window = window;
    }

    /// A picture with this timestamp was submitted and will be presented
    pub fn expect(&mut self, ts: i64) {
        *self.outstanding.entry(ts).or_insert(0) += 1;
    }

    /// A completed picture arrived
    pub fn insert(&mut self, ts: i64, item: T) {
        self.seq += 1;
        self.held.insert((ts, self.seq), item);
    }

    /// Next item in presentation order, if one may go out now
    pub fn pop_ready(&mut self) -> Option<(i64, T)> {
        let (&(ts, _), _) = self.held.iter().next()?;
        let earliest_outstanding = self.outstanding.keys().next().copied();
        let in_order = earliest_outstanding.map_or(true, |min| ts <= min);
        if !in_order && self.held.len() <= self.window {
            return None;
        }
        if !in_order {
            let skipped: Vec<i64> = self.outstanding.range(..ts).map(|(k, _)| *k).collect();
            for k in skipped {
                if let Some(count) = self.outstanding.remove(&k) {
                    self.lost += count as u64;
                }
            }
            tracing::debug!("Display reorder window overflow at {}us", ts);
        }
        self.retire(ts);
        self.held.pop_first().map(|((ts, _), item)| (ts, item))
    }

    /// Release the earliest held item regardless of outstanding timestamps
    pub fn pop_any(&mut self) -> Option<(i64, T)> {
        let ((ts, _), item) = self.held.pop_first()?;
        self.retire(ts);
        Some((ts, item))
    }

    fn retire(&mut self, ts: i64) {
        if let Some(count) = self.outstanding.get_mut(&ts) {
            *count -= 1;
            if *count == 0 {
                self.outstanding.remove(&ts);
            }
        }
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.values().sum()
    }

    /// Pictures written off because the window overflowed before they arrived
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Clear all state, handing back held items
    pub fn reset(&mut self) -> Vec<T> {
        self.outstanding.clear();
        std::mem::take(&mut self.held).into_values().collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
