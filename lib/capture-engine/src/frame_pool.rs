use crate::SlotError;
use capture_device::CaptureScreens;
use log::warn;
use std::{
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

pub const NUM_READER_ROLES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderRole {
    Video,
    Audio,
}

impl ReaderRole {
    pub const ALL: [ReaderRole; NUM_READER_ROLES] = [ReaderRole::Video, ReaderRole::Audio];

    fn index(self) -> usize {
        match self {
            ReaderRole::Video => 0,
            ReaderRole::Audio => 1,
        }
    }
}

/// Minimum pool size that lets every lane write while both roles hold a
/// slot and the last completed frame stays untouched.
pub fn min_pool_slots(writer_lanes: usize) -> usize {
    NUM_READER_ROLES + 1 + writer_lanes
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMeta {
    /// Bytes of the payload holding frame data
    pub length: usize,

    /// Time since the previously delivered frame
    pub time_delta: Duration,

    /// Time since the previous completion on the same lane
    pub lane_elapsed: Duration,

    pub screens: CaptureScreens,

    /// Bytes at the front of the payload to skip
    pub leading_offset: usize,

    /// Delivered while the session cooldown was running
    pub discard_candidate: bool,

    /// Assigned by the pool when the frame becomes visible
    pub sequence: u64,
}

#[derive(Debug)]
pub struct FrameSlot {
    index: usize,
    payload: Box<[u8]>,
    meta: FrameMeta,
}

impl FrameSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    /// Whole slot buffer.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Frame bytes, without the leading offset.
    pub fn data(&self) -> &[u8] {
        let end = self.meta.length.min(self.payload.len());
        let start = self.meta.leading_offset.min(end);
        &self.payload[start..end]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotState {
    pub writer_active: bool,
    pub reader_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub frames_promoted: u64,
    pub writer_starved: u64,
}

#[derive(Debug)]
struct PoolState {
    last_completed: Option<usize>,
    writer_slot: Vec<Option<usize>>,
    reader_slot: [Option<usize>; NUM_READER_ROLES],
    writer_active: Vec<bool>,
    reader_count: Vec<usize>,
    delivered: Vec<[bool; NUM_READER_ROLES]>,

    // `None` while the slot is leased to a writer
    frames: Vec<Option<Arc<FrameSlot>>>,

    sequence: u64,
    writer_starved: u64,
}

#[derive(Debug)]
struct PoolShared {
    state: Mutex<PoolState>,
    slot_capacity: usize,
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, lane: usize, mut slot: FrameSlot, promote: bool) {
        if slot.payload.len() != self.slot_capacity {
            warn!(
                "slot {} came back with a {} byte buffer, reallocating",
                slot.index,
                slot.payload.len()
            );
            slot.payload = vec![0; self.slot_capacity].into_boxed_slice();
        }

        let mut state = self.state();
        let index = slot.index;

        if promote {
            slot.meta.sequence = state.sequence;
            state.sequence += 1;
            state.last_completed = Some(index);
            state.delivered[index] = [false; NUM_READER_ROLES];
        }

        state.frames[index] = Some(Arc::new(slot));
        state.writer_active[index] = false;
        if state.writer_slot[lane] == Some(index) {
            state.writer_slot[lane] = None;
        }
    }
}

/// Fixed set of frame slots shared by the writer lanes and the two reader
/// roles.
///
/// Only the bookkeeping is behind the mutex. A writer owns its slot through
/// [`WriterSlot`] and fills it without holding any lock. Readers get shared,
/// immutable access through [`ReaderSlot`].
#[derive(Debug, Clone)]
pub struct FrameBufferPool {
    shared: Arc<PoolShared>,
}

impl FrameBufferPool {
    pub fn new(num_slots: usize, writer_lanes: usize, slot_capacity: usize) -> Self {
        let frames = (0..num_slots)
            .map(|index| {
                Some(Arc::new(FrameSlot {
                    index,
                    payload: vec![0; slot_capacity].into_boxed_slice(),
                    meta: FrameMeta::default(),
                }))
            })
            .collect();

        let state = PoolState {
            last_completed: None,
            writer_slot: vec![None; writer_lanes],
            reader_slot: [None; NUM_READER_ROLES],
            writer_active: vec![false; num_slots],
            reader_count: vec![0; num_slots],
            delivered: vec![[true; NUM_READER_ROLES]; num_slots],
            frames,
            sequence: 0,
            writer_starved: 0,
        };

        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(state),
                slot_capacity,
            }),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.shared.state().frames.len()
    }

    pub fn writer_lanes(&self) -> usize {
        self.shared.state().writer_slot.len()
    }

    pub fn slot_capacity(&self) -> usize {
        self.shared.slot_capacity
    }

    pub fn last_completed(&self) -> Option<usize> {
        self.shared.state().last_completed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state();
        PoolStats {
            frames_promoted: state.sequence,
            writer_starved: state.writer_starved,
        }
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        let state = self.shared.state();
        state
            .writer_active
            .iter()
            .zip(state.reader_count.iter())
            .map(|(writer_active, reader_count)| SlotState {
                writer_active: *writer_active,
                reader_count: *reader_count,
            })
            .collect()
    }

    /// Slot currently leased to `lane`.
    pub fn writer_slot_index(&self, lane: usize) -> Option<usize> {
        self.shared.state().writer_slot.get(lane).copied().flatten()
    }

    /// Lease a free slot to `lane`.
    ///
    /// A lane holds at most one lease. While its lease is outstanding this
    /// fails with [`SlotError::AlreadyLeased`], and with
    /// [`SlotError::Exhausted`] when every slot is being read, written or is
    /// the last completed frame. Neither changes any slot.
    pub fn get_writer_slot(&self, lane: usize) -> Result<WriterSlot, SlotError> {
        let mut state = self.shared.state();

        match state.writer_slot.get(lane) {
            None => return Err(SlotError::LaneOutOfRange(lane)),
            Some(Some(index)) => return Err(SlotError::AlreadyLeased(*index)),
            Some(None) => (),
        }

        for index in 0..state.frames.len() {
            if state.reader_count[index] != 0
                || state.last_completed == Some(index)
                || state.writer_active[index]
            {
                continue;
            }

            let Some(frame) = state.frames[index].take() else {
                continue;
            };

            match Arc::try_unwrap(frame) {
                Ok(slot) => {
                    state.writer_active[index] = true;
                    state.writer_slot[lane] = Some(index);
                    state.delivered[index] = [false; NUM_READER_ROLES];

                    return Ok(WriterSlot {
                        lane,
                        slot: Some(slot),
                        pool: self.shared.clone(),
                    });
                }

                // A released reader still holds its handle
                Err(frame) => state.frames[index] = Some(frame),
            }
        }

        state.writer_starved += 1;
        Err(SlotError::Exhausted)
    }

    pub fn release_writer_slot(&self, mut lease: WriterSlot, promote: bool) {
        if let Some(slot) = lease.slot.take() {
            self.shared.release(lease.lane, slot, promote);
        }
    }

    /// Record a finished frame and make it visible to the readers.
    ///
    /// With `bytes == None` the payload is already in the slot and only the
    /// metadata changes. A frame whose leading offset covers its whole
    /// length is dropped instead. Returns whether the frame was promoted.
    pub fn write_payload(&self, mut lease: WriterSlot, bytes: Option<&[u8]>, meta: FrameMeta) -> bool {
        if meta.leading_offset >= meta.length {
            self.release_writer_slot(lease, false);
            return false;
        }

        if let Some(slot) = lease.slot.as_mut() {
            if let Some(bytes) = bytes {
                let n = bytes.len().min(slot.payload.len());
                slot.payload[..n].copy_from_slice(&bytes[..n]);
            }

            let length = meta.length.min(slot.payload.len());
            slot.meta = FrameMeta { length, ..meta };
        }

        self.release_writer_slot(lease, true);
        true
    }

    /// Latch `role` onto the newest frame it has not seen yet.
    ///
    /// Calling again before [`Self::release_reader_slot`] returns the same
    /// slot.
    pub fn get_reader_slot(&self, role: ReaderRole) -> Option<ReaderSlot> {
        let mut state = self.shared.state();
        let role_index = role.index();

        if let Some(index) = state.reader_slot[role_index] {
            let slot = state.frames[index].clone()?;
            return Some(ReaderSlot { role, slot });
        }

        let index = state.last_completed?;
        if state.delivered[index][role_index] {
            return None;
        }

        let slot = state.frames[index].clone()?;
        state.delivered[index][role_index] = true;
        state.reader_count[index] += 1;
        state.reader_slot[role_index] = Some(index);

        Some(ReaderSlot { role, slot })
    }

    pub fn release_reader_slot(&self, role: ReaderRole) {
        let mut state = self.shared.state();
        if let Some(index) = state.reader_slot[role.index()].take() {
            state.reader_count[index] = state.reader_count[index].saturating_sub(1);
        }
    }
}

/// Exclusive lease on one slot, held by a writer lane.
///
/// Dropping the lease gives the slot back without publishing it.
#[derive(Debug)]
pub struct WriterSlot {
    lane: usize,
    slot: Option<FrameSlot>,
    pool: Arc<PoolShared>,
}

impl WriterSlot {
    pub fn lane(&self) -> usize {
        self.lane
    }

    pub fn index(&self) -> usize {
        self.slot.as_ref().map(|s| s.index).unwrap_or_default()
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        match self.slot.as_mut() {
            Some(slot) => &mut slot.payload,
            None => &mut [],
        }
    }

    /// Move the buffer out, to hand it to a transfer.
    pub fn take_payload(&mut self) -> Box<[u8]> {
        self.slot
            .as_mut()
            .map(|slot| std::mem::take(&mut slot.payload))
            .unwrap_or_default()
    }

    pub fn restore_payload(&mut self, payload: Box<[u8]>) {
        if let Some(slot) = self.slot.as_mut() {
            slot.payload = payload;
        }
    }
}

impl Drop for WriterSlot {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(self.lane, slot, false);
        }
    }
}

/// Shared read access to a completed frame.
#[derive(Debug)]
pub struct ReaderSlot {
    role: ReaderRole,
    slot: Arc<FrameSlot>,
}

impl ReaderSlot {
    pub fn role(&self) -> ReaderRole {
        self.role
    }
}

impl Deref for ReaderSlot {
    type Target = FrameSlot;

    fn deref(&self) -> &Self::Target {
        &self.slot
    }
}
