//! Shared-memory layout of one channel.
//!
//! ```text
//! [ChannelHeader][pad][CommandHeader; command_capacity][pad][DataWord; data_capacity]
//! ```
//!
//! Offsets are aligned to [`REGION_ALIGN`]. The file backing a segment starts
//! zero-filled, which is a valid "uninitialized" header: every atomic is 0.

use crate::command::{CommandHeader, DataWord};
use crossbeam_utils::CachePadded;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Alignment of each region inside a segment.
pub(crate) const REGION_ALIGN: usize = 128;

/// Identifies an initialized channel segment.
pub(crate) const CHANNEL_MAGIC: u64 = 0x4252_4944_4745_4348; // "BRIDGECH"

pub(crate) const STATE_UNINIT: u32 = 0;
pub(crate) const STATE_INITIALIZING: u32 = 1;
pub(crate) const STATE_READY: u32 = 2;

#[inline]
pub(crate) const fn align_up(x: usize, a: usize) -> usize {
    (x + a - 1) & !(a - 1)
}

/// Write/read positions of one ring.
///
/// `write` is stored only by the producer process, `read` only by the
/// consumer process. Both are logical positions that never wrap.
#[repr(C)]
#[derive(Default)]
pub(crate) struct RingControl {
    pub(crate) write: CachePadded<AtomicU64>,
    pub(crate) read: CachePadded<AtomicU64>,
}

/// Header at offset 0 of every channel segment.
#[repr(C)]
pub(crate) struct ChannelHeader {
    pub(crate) magic: AtomicU64,
    pub(crate) init_state: AtomicU32,
    pub(crate) command_capacity: AtomicU64,
    pub(crate) data_capacity: AtomicU64,
    /// Set by the writer when its data position completes a lap, cleared by
    /// the reader once it has followed.
    pub(crate) reset_required: CachePadded<AtomicBool>,
    /// Logical data position where the writer left the last lap.
    pub(crate) wrap_pos: CachePadded<AtomicU64>,
    pub(crate) commands: RingControl,
    pub(crate) data: RingControl,
}

impl ChannelHeader {
    /// Writes magic and capacities. Caller must own `init_state == INITIALIZING`.
    pub(crate) fn initialize(&self, command_capacity: usize, data_capacity: usize) {
        self.command_capacity
            .store(command_capacity as u64, Ordering::Relaxed);
        self.data_capacity.store(data_capacity as u64, Ordering::Relaxed);
        self.reset_required.store(false, Ordering::Relaxed);
        self.wrap_pos.store(0, Ordering::Relaxed);
        self.magic.store(CHANNEL_MAGIC, Ordering::Relaxed);
        self.init_state.store(STATE_READY, Ordering::Release);
    }
}

/// Byte offsets of the regions of one channel segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChannelLayout {
    pub(crate) command_capacity: usize,
    pub(crate) data_capacity: usize,
    pub(crate) commands_offset: usize,
    pub(crate) data_offset: usize,
    total_size: usize,
}

impl ChannelLayout {
    pub(crate) fn new(command_capacity: usize, data_capacity: usize) -> Self {
        let commands_offset = align_up(size_of::<ChannelHeader>(), REGION_ALIGN);
        let commands_end = commands_offset + command_capacity * size_of::<CommandHeader>();
        let data_offset = align_up(commands_end, REGION_ALIGN);
        let total_size = data_offset + data_capacity * size_of::<DataWord>();
        Self {
            command_capacity,
            data_capacity,
            commands_offset,
            data_offset,
            total_size,
        }
    }

    pub(crate) fn total_size(&self) -> usize {
        self.total_size
    }
}
