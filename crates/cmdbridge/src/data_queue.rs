//! Word-granular payload stream of a channel.
//!
//! Payloads are single words, fixed-arity word groups, or blobs laid out as
//! `[byte_len][ceil(byte_len / 4) words]`. A blob is always contiguous in the
//! mapped ring so it can be written and read in place; when it would straddle
//! the end of the ring the writer pads up to the boundary first.
//!
//! ## Lap handshake
//!
//! The channel header carries `reset_required` and `wrap_pos`:
//!
//! - Before a write that starts a new lap, the writer requires
//!   `reset_required == false`, then stores `wrap_pos` (where padding starts,
//!   or the boundary itself) and sets `reset_required`, both before the
//!   crossing write is published.
//! - The reader skips padding when it sits on `wrap_pos`, and clears
//!   `reset_required` when its own lap index advances.
//!
//! At most one lap transition is ever outstanding, so a single `wrap_pos`
//! suffices and the flag flips exactly twice per lap.

use crate::command::{words_for, DataWord};
use crate::error::QueueError;
use crate::invariants::debug_assert_lap_acknowledged;
use crate::layout::{ChannelHeader, ChannelLayout};
use crate::ring::RingBuffer;
use crate::role::{Direction, Reader, Writer};
use crate::shm::SharedSegment;
use bytemuck::Pod;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Writer-side back-pressure state for a pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The write can proceed now.
    Ready,
    /// Not enough free words yet.
    Full {
        /// Words currently free.
        free: usize,
    },
    /// The write starts a lap the reader has not been told about yet.
    LapPending,
}

/// One end of a channel's data ring.
#[derive(Debug)]
pub struct DataQueue<D> {
    ring: RingBuffer<DataWord, D>,
    segment: Arc<SharedSegment>,
    /// Words reserved by `begin_blob_push`, not yet committed.
    open_blob: Option<usize>,
}

impl<D: Direction> DataQueue<D> {
    pub(crate) fn attach(segment: &Arc<SharedSegment>, layout: &ChannelLayout) -> Self {
        let control = NonNull::from(&segment.header().data);
        // SAFETY: control and the data region come from the layout this
        // segment was validated against; the channel owns the only view of
        // its direction.
        let ring = unsafe {
            RingBuffer::from_segment(
                Arc::clone(segment),
                control,
                layout.data_offset,
                layout.data_capacity,
            )
        };
        Self {
            ring,
            segment: Arc::clone(segment),
            open_blob: None,
        }
    }

    #[inline]
    fn header(&self) -> &ChannelHeader {
        self.segment.header()
    }

    /// Capacity in words.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Mapped offset of this side's position.
    #[inline]
    pub fn get_pos(&self) -> usize {
        self.ring.get_pos()
    }

    /// This side's logical position.
    #[inline]
    pub fn logical_pos(&self) -> u64 {
        self.ring.logical_pos()
    }

    /// Laps completed by this side.
    #[inline]
    pub fn laps(&self) -> u64 {
        self.ring.laps()
    }

    /// Returns `true` while the writer has started a lap the reader has not followed.
    #[inline]
    pub fn reset_required(&self) -> bool {
        self.header().reset_required.load(Ordering::Acquire)
    }

    /// Returns `true` while a batch holds publication.
    #[inline]
    pub fn is_batching(&self) -> bool {
        self.ring.is_held()
    }
}

// ---------------------------------------------------------------------
// WRITER
// ---------------------------------------------------------------------

impl DataQueue<Writer> {
    /// Free words, refreshing the reader's position.
    pub fn free_words(&mut self) -> usize {
        self.ring.free_slots()
    }

    #[inline]
    fn crosses_lap(&self, words: usize) -> bool {
        self.ring.get_pos() + words >= self.ring.capacity()
    }

    /// Records that the next publication starts a new lap at `wrap_pos`.
    fn mark_lap(&self, wrap_pos: u64) {
        let header = self.header();
        debug_assert_lap_acknowledged!(
            header.reset_required.load(Ordering::Acquire),
            header.wrap_pos.load(Ordering::Relaxed)
        );
        header.wrap_pos.store(wrap_pos, Ordering::Release);
        header.reset_required.store(true, Ordering::Release);
        trace!(segment = self.segment.name(), wrap_pos, "data writer completed a lap");
    }

    /// Non-blocking back-pressure check for a write of `words` words.
    ///
    /// With `contiguous`, a run that would straddle the end of the ring is
    /// preceded by padding, which this call writes as soon as it has room.
    /// Returns `Ok(())` once `words` can be written immediately; `Full` or
    /// `LapPending` tell the caller to wait for the reader and retry.
    pub fn prepare(&mut self, words: usize, contiguous: bool) -> Result<(), QueueError> {
        let capacity = self.ring.capacity();
        if words > capacity {
            return Err(QueueError::TooLarge {
                needed: words,
                capacity,
            });
        }
        if self.open_blob.is_some() {
            return Err(QueueError::BlobActive);
        }

        let pad = self.ring.room_until_end();
        if contiguous && pad < words {
            if self.reset_required() {
                return Err(QueueError::LapPending);
            }
            if !self.ring.has_room(pad) {
                return Err(QueueError::Full);
            }
            let start = self.ring.logical_pos();
            self.mark_lap(start);
            self.ring.skip_to(start + pad as u64);
        }

        if self.crosses_lap(words) && self.reset_required() {
            return Err(QueueError::LapPending);
        }
        if !self.ring.has_room(words) {
            return Err(QueueError::Full);
        }
        Ok(())
    }

    /// [`prepare`](Self::prepare) reported as a back-pressure state.
    pub fn readiness(&mut self, words: usize, contiguous: bool) -> Readiness {
        match self.prepare(words, contiguous) {
            Ok(()) => Readiness::Ready,
            Err(QueueError::LapPending) => Readiness::LapPending,
            Err(_) => Readiness::Full {
                free: self.ring.free_slots(),
            },
        }
    }

    /// Appends one word.
    pub fn push(&mut self, word: DataWord) -> Result<(), QueueError> {
        self.push_many([word])
    }

    /// Appends a fixed-arity group of words contiguously in stream order,
    /// without a size prefix.
    pub fn push_many<const N: usize>(&mut self, words: [DataWord; N]) -> Result<(), QueueError> {
        self.prepare(N, false)?;
        if self.crosses_lap(N) {
            self.mark_lap(self.ring.next_lap_start());
        }
        self.ring.push_slice(&words)
    }

    /// Appends a size-prefixed blob.
    pub fn push_blob(&mut self, bytes: &[u8]) -> Result<(), QueueError> {
        let len = blob_len(bytes.len())?;
        let words = 1 + words_for(bytes.len());
        self.prepare(words, true)?;

        let slots = self.ring.contiguous_mut(words);
        slots[0] = len;
        write_payload(&mut slots[1..], bytes);
        self.commit_blob(words);
        Ok(())
    }

    /// Appends the bytes of a plain-old-data value as a blob.
    pub fn push_value<T: Pod>(&mut self, value: &T) -> Result<(), QueueError> {
        self.push_blob(bytemuck::bytes_of(value))
    }

    /// Reserves a blob of `len` bytes in place and returns its payload bytes.
    ///
    /// Nothing becomes visible to the reader until [`end_blob_push`](Self::end_blob_push).
    pub fn begin_blob_push(&mut self, len: usize) -> Result<&mut [u8], QueueError> {
        let size_word = blob_len(len)?;
        let words = 1 + words_for(len);
        self.prepare(words, true)?;
        self.open_blob = Some(words);

        let slots = self.ring.contiguous_mut(words);
        slots[0] = size_word;
        if words > 1 {
            slots[words - 1] = 0;
        }
        Ok(&mut bytemuck::cast_slice_mut::<DataWord, u8>(&mut slots[1..])[..len])
    }

    /// Commits the blob opened by [`begin_blob_push`](Self::begin_blob_push).
    pub fn end_blob_push(&mut self) -> Result<(), QueueError> {
        let words = self.open_blob.take().ok_or(QueueError::NoBlob)?;
        self.commit_blob(words);
        Ok(())
    }

    /// Returns `true` while an in-place blob is open.
    pub fn has_open_blob(&self) -> bool {
        self.open_blob.is_some()
    }

    /// Drops the blob opened by [`begin_blob_push`](Self::begin_blob_push)
    /// without publishing it. Returns `false` if none was open.
    pub fn abandon_blob(&mut self) -> bool {
        self.open_blob.take().is_some()
    }

    fn commit_blob(&mut self, words: usize) {
        if self.crosses_lap(words) {
            self.mark_lap(self.ring.next_lap_start());
        }
        self.ring.advance(words);
    }

    /// Starts deferring publication of pushes.
    pub fn begin_batch(&mut self) -> Result<(), QueueError> {
        self.ring.hold()
    }

    /// Publishes the batch. Returns the number of words made visible.
    pub fn end_batch(&mut self) -> Result<usize, QueueError> {
        self.ring.release()
    }
}

fn blob_len(len: usize) -> Result<DataWord, QueueError> {
    DataWord::try_from(len).map_err(|_| QueueError::TooLarge {
        needed: words_for(len),
        capacity: DataWord::MAX as usize,
    })
}

fn write_payload(slots: &mut [DataWord], bytes: &[u8]) {
    if let Some(last) = slots.last_mut() {
        *last = 0;
    }
    bytemuck::cast_slice_mut::<DataWord, u8>(slots)[..bytes.len()].copy_from_slice(bytes);
}

// ---------------------------------------------------------------------
// READER
// ---------------------------------------------------------------------

impl DataQueue<Reader> {
    /// Words published and not yet read (padding included).
    pub fn available(&mut self) -> usize {
        self.ring.available()
    }

    /// Jumps over the writer's padding if the reader sits on it.
    ///
    /// Only skips once the writer has published up to the boundary, so the
    /// read position never overtakes the write position.
    pub fn skip_padding(&mut self) -> bool {
        let header = self.segment.header();
        if !header.reset_required.load(Ordering::Acquire) {
            return false;
        }
        let wrap_pos = header.wrap_pos.load(Ordering::Acquire);
        let pos = self.ring.logical_pos();
        if wrap_pos != pos || self.ring.get_pos() == 0 {
            return false;
        }

        let lap = self.ring.lap_index();
        let boundary = self.ring.next_lap_start();
        if self.ring.peer_write_pos() < boundary {
            return false;
        }
        self.ring.skip_to(boundary);
        self.note_lap(lap);
        true
    }

    /// Clears the reset flag if the last read moved this side onto a new lap.
    fn note_lap(&mut self, previous_lap: u64) {
        if self.ring.lap_index() > previous_lap {
            let header = self.segment.header();
            if header.reset_required.load(Ordering::Acquire) {
                header.reset_required.store(false, Ordering::Release);
                trace!(
                    segment = self.segment.name(),
                    pos = self.ring.logical_pos(),
                    "data reader followed the writer onto a new lap"
                );
            }
        }
    }

    /// Reads the next word.
    pub fn pull(&mut self) -> Option<DataWord> {
        self.skip_padding();
        // After the skip: it already acknowledged its own lap.
        let lap = self.ring.lap_index();
        let word = self.ring.pull();
        self.note_lap(lap);
        word
    }

    /// Reads the next blob in place, handing its bytes to `f`.
    ///
    /// Returns `None` if the blob is not (fully) published yet.
    pub fn pull_blob_with<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.skip_padding();
        let lap = self.ring.lap_index();
        if !self.ring.has_data(1) {
            return None;
        }

        let pos = self.ring.logical_pos();
        let len = self.ring.read_at(pos) as usize;
        let words = 1 + words_for(len);
        if words > self.ring.capacity() - self.ring.get_pos() {
            error!(
                segment = self.segment.name(),
                len,
                offset = self.ring.get_pos(),
                "blob size prefix does not fit the ring; reader is out of sync with the writer"
            );
            return None;
        }
        if !self.ring.has_data(words) {
            return None;
        }

        let result = {
            let slots = self.ring.contiguous(pos, words);
            f(&bytemuck::cast_slice::<DataWord, u8>(&slots[1..])[..len])
        };
        self.ring.advance(words);
        self.note_lap(lap);
        Some(result)
    }

    /// Reads the next blob into an owned buffer.
    pub fn pull_blob(&mut self) -> Option<Vec<u8>> {
        self.pull_blob_with(<[u8]>::to_vec)
    }

    /// Copies the next blob into `dst` and returns the transmitted byte length.
    ///
    /// Copies `min(len, size_of::<T>())` bytes. A length different from
    /// `size_of::<T>()` means the two processes disagree on the payload
    /// layout; with `check_size` it is logged, never fatal.
    pub fn pull_and_copy<T: Pod>(&mut self, dst: &mut T, check_size: bool) -> Option<usize> {
        let len = self.pull_blob_with(|bytes| {
            let dst_bytes = bytemuck::bytes_of_mut(dst);
            let n = bytes.len().min(dst_bytes.len());
            dst_bytes[..n].copy_from_slice(&bytes[..n]);
            bytes.len()
        })?;

        let expected = std::mem::size_of::<T>();
        if check_size && len != expected {
            warn!(
                segment = self.segment.name(),
                received = len,
                expected,
                "data queue copy: size of source and target object does not match"
            );
        }
        Some(len)
    }

    /// Drops everything currently readable. Returns the number of words dropped.
    pub fn discard_all(&mut self) -> usize {
        let lap = self.ring.lap_index();
        let n = self.ring.discard_all();
        self.note_lap(lap);
        n
    }

    /// Starts deferring the release of consumed words to the writer.
    pub fn begin_read_batch(&mut self) -> Result<(), QueueError> {
        self.ring.hold()
    }

    /// Releases the words consumed since [`begin_read_batch`](Self::begin_read_batch).
    pub fn end_read_batch(&mut self) -> Result<usize, QueueError> {
        self.ring.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WORD_SIZE;

    fn queue_pair(capacity: usize) -> (DataQueue<Writer>, DataQueue<Reader>) {
        let layout = ChannelLayout::new(1, capacity);
        let segment = Arc::new(SharedSegment::anonymous("data-test", layout.total_size()).unwrap());
        segment
            .attach_channel(&layout, std::time::Duration::from_millis(10))
            .unwrap();
        (
            DataQueue::attach(&segment, &layout),
            DataQueue::attach(&segment, &layout),
        )
    }

    #[test]
    fn test_scalar_and_many() {
        let (mut w, mut r) = queue_pair(16);

        w.push(0xFF00_00FF).unwrap();
        w.push_many([1, 2, 3]).unwrap();

        assert_eq!(r.pull(), Some(0xFF00_00FF));
        assert_eq!(r.pull(), Some(1));
        assert_eq!(r.pull(), Some(2));
        assert_eq!(r.pull(), Some(3));
        assert_eq!(r.pull(), None);
    }

    #[test]
    fn test_blob_round_trip() {
        let (mut w, mut r) = queue_pair(16);

        w.push_blob(b"hello").unwrap();
        // 1 size word + 2 payload words
        assert_eq!(w.logical_pos(), 3);
        assert_eq!(r.pull_blob().unwrap(), b"hello");
        assert_eq!(r.logical_pos(), 3);
    }

    #[test]
    fn test_empty_blob() {
        let (mut w, mut r) = queue_pair(16);

        w.push_blob(&[]).unwrap();
        assert_eq!(r.pull_blob().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_pull_and_copy_size_mismatch_does_not_desync() {
        let (mut w, mut r) = queue_pair(32);

        w.push_value(&[1u32, 2, 3]).unwrap();
        w.push(77).unwrap();

        let mut small = 0u32;
        assert_eq!(r.pull_and_copy(&mut small, true), Some(3 * WORD_SIZE));
        assert_eq!(small, 1);
        assert_eq!(r.pull(), Some(77));
    }

    #[test]
    fn test_in_place_blob_is_invisible_until_committed() {
        let (mut w, mut r) = queue_pair(16);

        let bytes = w.begin_blob_push(6).unwrap();
        bytes.copy_from_slice(b"abcdef");
        assert_eq!(w.push(1), Err(QueueError::BlobActive));
        assert_eq!(r.available(), 0);

        w.end_blob_push().unwrap();
        assert_eq!(w.end_blob_push(), Err(QueueError::NoBlob));
        assert_eq!(r.pull_blob().unwrap(), b"abcdef");
    }

    #[test]
    fn test_abandoned_blob_frees_the_writer() {
        let (mut w, mut r) = queue_pair(16);

        w.begin_blob_push(4).unwrap().copy_from_slice(b"lost");
        assert_eq!(w.push(1), Err(QueueError::BlobActive));
        assert!(w.abandon_blob());
        assert!(!w.abandon_blob());

        w.push(1).unwrap();
        assert_eq!(r.pull(), Some(1));
        assert_eq!(r.available(), 0);
    }

    #[test]
    fn test_batch_publishes_once() {
        let (mut w, mut r) = queue_pair(16);

        w.begin_batch().unwrap();
        w.push(1).unwrap();
        w.push_blob(b"xy").unwrap();
        assert_eq!(r.available(), 0);
        assert_eq!(w.end_batch(), Ok(3));
        assert_eq!(r.pull(), Some(1));
        assert_eq!(r.pull_blob().unwrap(), b"xy");
    }

    #[test]
    fn test_blob_pads_across_boundary_and_flag_flips_once() {
        let (mut w, mut r) = queue_pair(8);

        for i in 0..6 {
            w.push(i).unwrap();
        }
        for i in 0..6 {
            assert_eq!(r.pull(), Some(i));
        }
        assert!(!w.reset_required());

        // 1 + 2 words do not fit in the 2 words left: pad to the boundary.
        w.push_blob(b"12345678").unwrap();
        assert_eq!(w.logical_pos(), 8 + 3);
        assert!(w.reset_required());

        assert_eq!(r.pull_blob().unwrap(), b"12345678");
        assert_eq!(r.get_pos(), 3);
        assert_eq!(r.laps(), 1);
        assert!(!r.reset_required());
    }

    #[test]
    fn test_next_lap_flag_survives_read_after_skip() {
        let (mut w, mut r) = queue_pair(8);

        w.push_many([0, 1, 2, 3, 4, 5]).unwrap();
        for _ in 0..6 {
            r.pull().unwrap();
        }
        // Pads 6..8, blob at 8..11.
        w.push_blob(b"12345678").unwrap();

        // While the reader is inside the blob it has just skipped to, the
        // writer pads 11..16 for the following lap.
        let bytes = r
            .pull_blob_with(|bytes| {
                assert_eq!(w.prepare(6, true), Err(QueueError::Full));
                assert!(w.reset_required());
                bytes.to_vec()
            })
            .unwrap();
        assert_eq!(bytes, b"12345678");
        assert_eq!(r.logical_pos(), 11);
        assert!(r.reset_required(), "flag of the next lap was cleared early");

        // The padding is skipped, never read as a blob.
        assert_eq!(r.pull_blob(), None);
        assert_eq!(r.logical_pos(), 16);
        assert!(!w.reset_required());
        assert_eq!(r.laps(), 2);

        w.push_blob(b"abc").unwrap();
        assert_eq!(r.pull_blob().unwrap(), b"abc");
    }

    #[test]
    fn test_writer_waits_for_reader_to_follow_lap() {
        let (mut w, mut r) = queue_pair(4);

        // Lap 0 → 1.
        for i in 0..4 {
            w.push(i).unwrap();
        }
        assert!(w.reset_required());
        assert_eq!(w.push(4), Err(QueueError::Full));

        for _ in 0..3 {
            r.pull().unwrap();
        }
        // The reader has room-freed 3 words but not crossed yet.
        assert!(w.reset_required());
        w.push_many([4, 5, 6]).unwrap();
        assert_eq!(r.pull(), Some(3));
        assert!(!w.reset_required());

        // Lap 1 → 2 is now allowed.
        r.pull().unwrap();
        w.push(7).unwrap();
        assert!(w.reset_required());
    }

    #[test]
    fn test_lap_pending_blocks_second_crossing() {
        let (mut w, mut r) = queue_pair(4);

        w.push_many([0, 1, 2, 3]).unwrap();
        assert!(w.reset_required());
        for _ in 0..3 {
            r.pull().unwrap();
        }
        // A full lap would cross again while the reader is still on lap 0.
        assert_eq!(w.prepare(4, false), Err(QueueError::LapPending));
        assert_eq!(w.readiness(4, false), Readiness::LapPending);
        assert_eq!(r.pull(), Some(3));
        assert_eq!(w.readiness(4, false), Readiness::Ready);
    }

    #[test]
    fn test_reader_skips_padding_before_payload_is_published() {
        let (mut w, mut r) = queue_pair(8);

        w.push_many([0, 1, 2, 3, 4, 5]).unwrap();
        for _ in 0..6 {
            r.pull().unwrap();
        }

        // Blob of 7 words: padding (2) fits now, the blob itself needs the
        // reader to leave the padding first.
        assert_eq!(w.prepare(7, true), Err(QueueError::Full));
        assert_eq!(w.logical_pos(), 8);
        assert!(r.skip_padding());
        assert_eq!(r.logical_pos(), 8);
        w.prepare(7, true).unwrap();
        w.push_blob(&[9u8; 24]).unwrap();
        assert_eq!(r.pull_blob().unwrap(), vec![9u8; 24]);
    }

    #[test]
    fn test_too_large_is_rejected() {
        let (mut w, _r) = queue_pair(4);
        assert_eq!(
            w.push_blob(&[0u8; 16]),
            Err(QueueError::TooLarge {
                needed: 5,
                capacity: 4
            })
        );
    }

    #[test]
    fn test_discard_all_clears_flag() {
        let (mut w, mut r) = queue_pair(4);
        w.push_many([1, 2, 3, 4]).unwrap();
        assert!(w.reset_required());
        assert_eq!(r.discard_all(), 4);
        assert!(!w.reset_required());
    }
}
