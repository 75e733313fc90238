use crate::error::QueueError;
use crate::invariants::{
    debug_assert_bounded_count, debug_assert_contiguous, debug_assert_monotonic,
    debug_assert_read_not_past_write,
};
use crate::layout::RingControl;
use crate::role::{Direction, Reader, Writer};
use crate::shm::SharedSegment;
use bytemuck::Pod;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// One writer process and one reader process share a `RingControl` and the
// slot array. Each process holds exactly one `RingBuffer` view of its end.
//
// ## Logical Positions
//
// `write` and `read` are unbounded u64 positions; the slot index is
// `position & mask`. They never wrap in practice, so `write - read` is always
// the number of occupied slots and a lap is simply `position / capacity`
// changing.
//
// ## Memory Ordering Protocol
//
// **Writer:**
// 1. Use the local staged position (only this process writes `write`)
// 2. Check room against the cached read position; refresh with Acquire if short
// 3. Write slots (plain stores, protected by the protocol)
// 4. Store `write` with Release (publishes slots), unless publication is held
//
// **Reader:**
// 1. Use the local read position (only this process writes `read`)
// 2. Check availability against the cached write position; refresh with Acquire
// 3. Read slots
// 4. Store `read` with Release (hands the slots back), unless publication is held
//
// ## Held Publication
//
// `hold()` defers step 4 so several pushes (or pulls) become visible to the
// peer in a single store: the reader never observes half of a batch.
//
// =============================================================================

/// One end of a fixed-capacity circular buffer living in a shared segment.
///
/// `D` is the compile-time direction: producer operations exist only on
/// `RingBuffer<T, Writer>`, consumer operations only on `RingBuffer<T, Reader>`.
pub struct RingBuffer<T, D> {
    segment: Arc<SharedSegment>,
    control: NonNull<RingControl>,
    slots: NonNull<T>,
    capacity: usize,
    mask: usize,
    shift: u32,
    /// This side's position (writer: staged write, reader: read).
    local: u64,
    /// Last value stored into this side's shared position.
    published: u64,
    /// Last observed value of the peer's shared position.
    cached_peer: u64,
    held: bool,
    start_lap: u64,
    _dir: PhantomData<D>,
}

// Safety: the slots and control block live in `segment`, which outlives the
// view. Shared state is only touched through atomics and the single-writer
// protocol; `&self` methods only load atomics.
unsafe impl<T: Send, D: Direction> Send for RingBuffer<T, D> {}
unsafe impl<T: Sync, D: Direction> Sync for RingBuffer<T, D> {}

impl<T: Pod, D: Direction> RingBuffer<T, D> {
    /// Creates a view over a ring stored in `segment`.
    ///
    /// # Safety
    ///
    /// - `control` must point to a `RingControl` inside `segment`.
    /// - `slots_offset .. slots_offset + capacity * size_of::<T>()` must lie
    ///   inside `segment` and be aligned for `T`.
    /// - At most one view per direction may exist for a given ring.
    pub(crate) unsafe fn from_segment(
        segment: Arc<SharedSegment>,
        control: NonNull<RingControl>,
        slots_offset: usize,
        capacity: usize,
    ) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = segment.ptr_at(slots_offset).cast::<T>();
        debug_assert_eq!(slots.as_ptr() as usize % std::mem::align_of::<T>(), 0);

        let ctrl = control.as_ref();
        let (local, peer) = if D::IS_WRITER {
            (ctrl.write.load(Ordering::Acquire), ctrl.read.load(Ordering::Acquire))
        } else {
            (ctrl.read.load(Ordering::Acquire), ctrl.write.load(Ordering::Acquire))
        };
        let shift = capacity.trailing_zeros();

        Self {
            segment,
            control,
            slots,
            capacity,
            mask: capacity - 1,
            shift,
            local,
            published: local,
            cached_peer: peer,
            held: false,
            start_lap: local >> shift,
            _dir: PhantomData,
        }
    }

    // ---------------------------------------------------------------------
    // CONSTANTS & STATUS
    // ---------------------------------------------------------------------

    /// Returns the ring capacity in slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mapped offset of this side's position (`position mod capacity`).
    #[inline]
    pub fn get_pos(&self) -> usize {
        (self.local as usize) & self.mask
    }

    /// This side's logical position.
    #[inline]
    pub fn logical_pos(&self) -> u64 {
        self.local
    }

    /// Index of the lap this side is on.
    #[inline]
    pub fn lap_index(&self) -> u64 {
        self.local >> self.shift
    }

    /// Logical position where the next lap begins.
    #[inline]
    pub fn next_lap_start(&self) -> u64 {
        (self.lap_index() + 1) << self.shift
    }

    /// Laps completed by this side since the view was created.
    #[inline]
    pub fn laps(&self) -> u64 {
        self.lap_index() - self.start_lap
    }

    /// Occupied slots according to the published positions.
    #[inline]
    pub fn len(&self) -> usize {
        let ctrl = self.control();
        let write = ctrl.write.load(Ordering::Acquire);
        let read = ctrl.read.load(Ordering::Acquire);
        write.wrapping_sub(read) as usize
    }

    /// Returns true if nothing is published and unread.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while publication is held.
    #[inline]
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Name of the segment holding this ring.
    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }

    #[inline]
    fn control(&self) -> &RingControl {
        // SAFETY: `control` points into `segment`, which we keep alive.
        unsafe { self.control.as_ref() }
    }

    #[inline]
    fn own_position(&self) -> &AtomicU64 {
        let ctrl = self.control();
        if D::IS_WRITER {
            &ctrl.write
        } else {
            &ctrl.read
        }
    }

    #[inline]
    fn peer_position(&self) -> &AtomicU64 {
        let ctrl = self.control();
        if D::IS_WRITER {
            &ctrl.read
        } else {
            &ctrl.write
        }
    }

    /// Reloads the peer's published position.
    #[inline]
    pub(crate) fn refresh_peer(&mut self) -> u64 {
        self.cached_peer = self.peer_position().load(Ordering::Acquire);
        self.cached_peer
    }

    #[inline]
    fn slot_ptr(&self, pos: u64) -> *mut T {
        // SAFETY: the masked index is within the slot array.
        unsafe { self.slots.as_ptr().add((pos as usize) & self.mask) }
    }

    // ---------------------------------------------------------------------
    // POSITION MANAGEMENT (both sides)
    // ---------------------------------------------------------------------

    /// Moves this side forward by `n` slots, publishing unless held.
    pub(crate) fn advance(&mut self, n: usize) {
        let old = self.local;
        let new = old.wrapping_add(n as u64);

        debug_assert_monotonic!(D::NAME, old, new);
        if D::IS_WRITER {
            debug_assert_bounded_count!(new.wrapping_sub(self.cached_peer), self.capacity);
        } else {
            debug_assert_read_not_past_write!(new, self.cached_peer);
        }

        self.local = new;
        if !self.held {
            self.publish();
        }
    }

    /// Moves this side forward to `pos` (padding skip).
    pub(crate) fn skip_to(&mut self, pos: u64) {
        debug_assert_monotonic!(D::NAME, self.local, pos);
        self.advance(pos.wrapping_sub(self.local) as usize);
    }

    /// Stores the local position into shared memory. Returns the number of
    /// slots newly made visible to the peer.
    pub(crate) fn publish(&mut self) -> usize {
        let n = self.local.wrapping_sub(self.published) as usize;
        if n > 0 {
            self.own_position().store(self.local, Ordering::Release);
            self.published = self.local;
        }
        n
    }

    /// Defers publication until [`release`](Self::release).
    pub fn hold(&mut self) -> Result<(), QueueError> {
        if self.held {
            return Err(QueueError::BatchActive);
        }
        self.held = true;
        Ok(())
    }

    /// Publishes everything staged since [`hold`](Self::hold).
    pub fn release(&mut self) -> Result<usize, QueueError> {
        if !self.held {
            return Err(QueueError::NoBatch);
        }
        self.held = false;
        Ok(self.publish())
    }
}

// ---------------------------------------------------------------------
// PRODUCER API
// ---------------------------------------------------------------------

impl<T: Pod> RingBuffer<T, Writer> {
    /// Free slots, refreshing the reader's position.
    #[inline]
    pub fn free_slots(&mut self) -> usize {
        let read = self.refresh_peer();
        self.capacity - self.local.wrapping_sub(read) as usize
    }

    /// Returns true if `n` slots can be written without overrunning the reader.
    ///
    /// Fast path uses the cached read position; the shared one is only loaded
    /// when the cache says the ring is too full.
    #[inline]
    pub fn has_room(&mut self, n: usize) -> bool {
        let cached_free = self.capacity - self.local.wrapping_sub(self.cached_peer) as usize;
        cached_free >= n || self.free_slots() >= n
    }

    /// Slots left before the end of the current lap.
    #[inline]
    pub fn room_until_end(&self) -> usize {
        self.capacity - self.get_pos()
    }

    /// Appends one item.
    pub fn push(&mut self, item: T) -> Result<(), QueueError> {
        if !self.has_room(1) {
            return Err(QueueError::Full);
        }
        self.write_at(self.local, item);
        self.advance(1);
        Ok(())
    }

    /// Appends all of `items` or nothing.
    pub fn push_slice(&mut self, items: &[T]) -> Result<(), QueueError> {
        if items.len() > self.capacity {
            return Err(QueueError::TooLarge {
                needed: items.len(),
                capacity: self.capacity,
            });
        }
        if !self.has_room(items.len()) {
            return Err(QueueError::Full);
        }
        for (i, item) in items.iter().enumerate() {
            self.write_at(self.local.wrapping_add(i as u64), *item);
        }
        self.advance(items.len());
        Ok(())
    }

    /// Writes `item` at logical position `pos` without advancing.
    ///
    /// The caller must have checked room for `pos`.
    #[inline]
    pub(crate) fn write_at(&mut self, pos: u64, item: T) {
        // SAFETY: the slot is in bounds and, since room was checked, not
        // readable by the consumer until the write position passes it.
        unsafe { ptr::write(self.slot_ptr(pos), item) };
    }

    /// Mutable view of `n` contiguous slots starting at the staged position.
    ///
    /// The caller must have checked room and contiguity.
    pub(crate) fn contiguous_mut(&mut self, n: usize) -> &mut [T] {
        let offset = self.get_pos();
        debug_assert_contiguous!(offset, n, self.capacity);
        // SAFETY: the range is in bounds (contiguity) and owned by the writer
        // until published (room).
        unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(self.local), n) }
    }
}

// ---------------------------------------------------------------------
// CONSUMER API
// ---------------------------------------------------------------------

impl<T: Pod> RingBuffer<T, Reader> {
    /// Published slots not yet read, refreshing the writer's position.
    #[inline]
    pub fn available(&mut self) -> usize {
        let write = self.refresh_peer();
        write.wrapping_sub(self.local) as usize
    }

    /// Returns true if at least `n` slots are readable.
    #[inline]
    pub fn has_data(&mut self, n: usize) -> bool {
        self.cached_peer.wrapping_sub(self.local) as usize >= n || self.available() >= n
    }

    /// Published write position of the peer.
    #[inline]
    pub(crate) fn peer_write_pos(&mut self) -> u64 {
        self.refresh_peer()
    }

    /// Copies the next item without consuming it.
    pub fn peek(&mut self) -> Option<T> {
        self.has_data(1).then(|| self.read_at(self.local))
    }

    /// Removes and returns the next item.
    pub fn pull(&mut self) -> Option<T> {
        let item = self.peek()?;
        self.advance(1);
        Some(item)
    }

    /// Reads the item at logical position `pos`.
    ///
    /// The caller must have checked that `pos` is published.
    #[inline]
    pub(crate) fn read_at(&self, pos: u64) -> T {
        // SAFETY: the slot is in bounds and was published by the writer
        // (Acquire on the write position synchronizes with its Release).
        unsafe { ptr::read(self.slot_ptr(pos)) }
    }

    /// View of `n` contiguous published slots starting at `pos`.
    pub(crate) fn contiguous(&self, pos: u64, n: usize) -> &[T] {
        let offset = (pos as usize) & self.mask;
        debug_assert_contiguous!(offset, n, self.capacity);
        // SAFETY: in bounds (contiguity); the writer does not reuse these
        // slots until the read position passes them.
        unsafe { std::slice::from_raw_parts(self.slot_ptr(pos), n) }
    }

    /// Discards everything currently readable. Returns the number of slots dropped.
    pub fn discard_all(&mut self) -> usize {
        let n = self.available();
        if n > 0 {
            self.advance(n);
        }
        n
    }
}

impl<T, D> std::fmt::Debug for RingBuffer<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("direction", &std::any::type_name::<D>())
            .field("segment", &self.segment.name())
            .field("capacity", &self.capacity)
            .field("local", &self.local)
            .field("published", &self.published)
            .field("held", &self.held)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layout::ChannelLayout;

    /// Writer and reader views over one in-process ring.
    pub(crate) fn ring_pair<T: Pod>(
        capacity: usize,
    ) -> (RingBuffer<T, Writer>, RingBuffer<T, Reader>) {
        // The command region is sized for 24-byte headers, enough for any T used in tests.
        let layout = ChannelLayout::new(capacity, 1);
        let segment = Arc::new(SharedSegment::anonymous("ring-test", layout.total_size()).unwrap());
        let control = NonNull::from(&segment.header().commands);
        // SAFETY: control and slots come from the layout of this segment.
        unsafe {
            (
                RingBuffer::from_segment(
                    Arc::clone(&segment),
                    control,
                    layout.commands_offset,
                    capacity,
                ),
                RingBuffer::from_segment(segment, control, layout.commands_offset, capacity),
            )
        }
    }

    #[test]
    fn test_ring_push_pull_fifo() {
        let (mut w, mut r) = ring_pair::<u64>(8);

        for i in 0..5 {
            w.push(i * 10).unwrap();
        }
        assert_eq!(w.len(), 5);

        assert_eq!(r.peek(), Some(0));
        for i in 0..5 {
            assert_eq!(r.pull(), Some(i * 10));
        }
        assert_eq!(r.pull(), None);
        assert!(r.is_empty());
    }

    #[test]
    fn test_ring_full() {
        let (mut w, mut r) = ring_pair::<u32>(4);

        for i in 0..4 {
            w.push(i).unwrap();
        }
        assert_eq!(w.push(99), Err(QueueError::Full));

        assert_eq!(r.pull(), Some(0));
        w.push(4).unwrap();
        assert_eq!(w.free_slots(), 0);
    }

    #[test]
    fn test_ring_wraps_and_counts_laps() {
        let (mut w, mut r) = ring_pair::<u32>(4);

        for round in 0..3u32 {
            for i in 0..4 {
                w.push(round * 10 + i).unwrap();
            }
            for i in 0..4 {
                assert_eq!(r.pull(), Some(round * 10 + i));
            }
        }

        assert_eq!(w.logical_pos(), 12);
        assert_eq!(w.get_pos(), 0);
        assert_eq!(w.laps(), 3);
        assert_eq!(r.laps(), 3);
    }

    #[test]
    fn test_ring_hold_publishes_atomically() {
        let (mut w, mut r) = ring_pair::<u32>(8);

        w.hold().unwrap();
        assert_eq!(w.hold(), Err(QueueError::BatchActive));
        w.push(1).unwrap();
        w.push(2).unwrap();
        assert_eq!(r.available(), 0, "held writes must not be visible");

        assert_eq!(w.release(), Ok(2));
        assert_eq!(w.release(), Err(QueueError::NoBatch));
        assert_eq!(r.available(), 2);
    }

    #[test]
    fn test_ring_push_slice_all_or_nothing() {
        let (mut w, mut r) = ring_pair::<u32>(4);

        w.push_slice(&[1, 2, 3]).unwrap();
        assert_eq!(w.push_slice(&[4, 5]), Err(QueueError::Full));
        assert_eq!(
            w.push_slice(&[0; 5]),
            Err(QueueError::TooLarge {
                needed: 5,
                capacity: 4
            })
        );
        assert_eq!(r.available(), 3);
    }

    #[test]
    fn test_reader_view_resumes_from_shared_position() {
        let layout = ChannelLayout::new(8, 1);
        let segment = Arc::new(SharedSegment::anonymous("resume", layout.total_size()).unwrap());
        let control = NonNull::from(&segment.header().commands);

        // SAFETY: as in `ring_pair`.
        let (mut w, mut r) = unsafe {
            (
                RingBuffer::<u32, Writer>::from_segment(
                    Arc::clone(&segment),
                    control,
                    layout.commands_offset,
                    8,
                ),
                RingBuffer::<u32, Reader>::from_segment(
                    Arc::clone(&segment),
                    control,
                    layout.commands_offset,
                    8,
                ),
            )
        };
        w.push(7).unwrap();
        w.push(8).unwrap();
        assert_eq!(r.pull(), Some(7));
        drop(r);

        // SAFETY: the previous reader view was dropped.
        let mut r2 = unsafe {
            RingBuffer::<u32, Reader>::from_segment(segment, control, layout.commands_offset, 8)
        };
        assert_eq!(r2.logical_pos(), 1);
        assert_eq!(r2.pull(), Some(8));
    }
}
