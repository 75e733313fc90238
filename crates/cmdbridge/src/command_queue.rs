//! Header stream of a channel.

use crate::command::CommandHeader;
use crate::error::QueueError;
use crate::layout::ChannelLayout;
use crate::ring::RingBuffer;
use crate::role::{Direction, Reader, Writer};
use crate::shm::SharedSegment;
use std::ptr::NonNull;
use std::sync::Arc;

/// One end of a channel's command ring.
///
/// Consumers inspect the next header with [`pull`](CommandQueue::pull) and
/// consume it separately with [`pop_front`](CommandQueue::pop_front).
#[derive(Debug)]
pub struct CommandQueue<D> {
    ring: RingBuffer<CommandHeader, D>,
}

impl<D: Direction> CommandQueue<D> {
    pub(crate) fn attach(segment: &Arc<SharedSegment>, layout: &ChannelLayout) -> Self {
        let control = NonNull::from(&segment.header().commands);
        // SAFETY: the command region and its control block come from the
        // layout this segment was validated against.
        let ring = unsafe {
            RingBuffer::from_segment(
                Arc::clone(segment),
                control,
                layout.commands_offset,
                layout.command_capacity,
            )
        };
        Self { ring }
    }

    /// Capacity in headers.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Mapped offset of this side's position.
    #[inline]
    pub fn get_pos(&self) -> usize {
        self.ring.get_pos()
    }

    /// Headers published and not yet popped.
    #[inline]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` if no header is pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl CommandQueue<Writer> {
    /// Appends a header.
    pub fn push(&mut self, header: CommandHeader) -> Result<(), QueueError> {
        self.ring.push(header)
    }

    /// Returns `true` if `n` headers can be pushed now.
    pub fn has_room(&mut self, n: usize) -> bool {
        self.ring.has_room(n)
    }

    /// Defers publication so the following headers become visible together.
    pub fn begin_write_batch(&mut self) -> Result<(), QueueError> {
        self.ring.hold()
    }

    /// Publishes the batch. Returns the number of headers made visible.
    pub fn end_write_batch(&mut self) -> Result<usize, QueueError> {
        self.ring.release()
    }

    /// Returns `true` while a write batch is open.
    pub fn is_batching(&self) -> bool {
        self.ring.is_held()
    }
}

impl CommandQueue<Reader> {
    /// Next header, left in place.
    pub fn pull(&mut self) -> Option<CommandHeader> {
        self.ring.peek()
    }

    /// Consumes the next header.
    pub fn pop_front(&mut self) -> Option<CommandHeader> {
        self.ring.pull()
    }

    /// Drops every published header. Returns how many were dropped.
    pub fn discard_all(&mut self) -> usize {
        self.ring.discard_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandId, Flags};
    use std::time::Duration;

    fn queue_pair(capacity: usize) -> (CommandQueue<Writer>, CommandQueue<Reader>) {
        let layout = ChannelLayout::new(capacity, 4);
        let segment = Arc::new(SharedSegment::anonymous("cmd-test", layout.total_size()).unwrap());
        segment
            .attach_channel(&layout, Duration::from_millis(10))
            .unwrap();
        (
            CommandQueue::attach(&segment, &layout),
            CommandQueue::attach(&segment, &layout),
        )
    }

    fn header(id: u32, seq: u64) -> CommandHeader {
        CommandHeader::new(CommandId::user(id), 0, Flags::NONE, seq)
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (mut w, mut r) = queue_pair(4);
        w.push(header(1, 0)).unwrap();

        assert_eq!(r.pull(), Some(header(1, 0)));
        assert_eq!(r.pull(), Some(header(1, 0)));
        assert_eq!(r.pop_front(), Some(header(1, 0)));
        assert_eq!(r.pull(), None);
        assert_eq!(r.pop_front(), None);
    }

    #[test]
    fn test_write_batch_all_or_nothing() {
        let (mut w, mut r) = queue_pair(8);

        w.begin_write_batch().unwrap();
        assert_eq!(w.begin_write_batch(), Err(QueueError::BatchActive));
        for seq in 0..3 {
            w.push(header(2, seq)).unwrap();
        }
        assert_eq!(r.pull(), None);

        assert_eq!(w.end_write_batch(), Ok(3));
        assert_eq!(w.end_write_batch(), Err(QueueError::NoBatch));
        for seq in 0..3 {
            assert_eq!(r.pop_front().map(|h| h.sequence), Some(seq));
        }
    }

    #[test]
    fn test_full_and_discard() {
        let (mut w, mut r) = queue_pair(2);
        w.push(header(1, 0)).unwrap();
        w.push(header(1, 1)).unwrap();
        assert_eq!(w.push(header(1, 2)), Err(QueueError::Full));
        assert_eq!(r.discard_all(), 2);
        assert!(r.is_empty());
        w.push(header(1, 2)).unwrap();
        assert_eq!(r.pop_front().map(|h| h.sequence), Some(2));
    }
}
