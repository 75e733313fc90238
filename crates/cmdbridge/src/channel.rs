use crate::command_queue::CommandQueue;
use crate::config::ChannelConfig;
use crate::data_queue::DataQueue;
use crate::error::Result;
use crate::layout::ChannelLayout;
use crate::role::{Direction, Reader, Writer};
use crate::shm::SharedSegment;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One direction of a bridge: a command ring and a data ring in one shared
/// segment, plus the lap flag both ends share.
///
/// A process holds one [`WriterChannel`] and one [`ReaderChannel`].
#[derive(Debug)]
pub struct Channel<D> {
    /// Header stream.
    pub commands: CommandQueue<D>,
    /// Payload stream.
    pub data: DataQueue<D>,
    segment: Arc<SharedSegment>,
}

/// The channel this process pushes to.
pub type WriterChannel = Channel<Writer>;

/// The channel this process pops from.
pub type ReaderChannel = Channel<Reader>;

impl<D: Direction> Channel<D> {
    /// Creates or attaches the named segment in `dir` and maps both rings.
    ///
    /// Whichever process arrives first initializes the header; the other
    /// validates that it was sized identically.
    pub fn attach(
        dir: &Path,
        name: &str,
        config: &ChannelConfig,
        attach_timeout: Duration,
    ) -> Result<Self> {
        config.validate()?;
        let layout = ChannelLayout::new(config.command_capacity, config.data_capacity);
        let segment = SharedSegment::open_or_create(dir, name, config.mem_size)?;
        segment.attach_channel(&layout, attach_timeout)?;

        debug!(
            channel = name,
            direction = D::NAME,
            commands = config.command_capacity,
            data_words = config.data_capacity,
            "channel attached"
        );
        Ok(Self::from_segment(Arc::new(segment), &layout))
    }

    fn from_segment(segment: Arc<SharedSegment>, layout: &ChannelLayout) -> Self {
        Self {
            commands: CommandQueue::attach(&segment, layout),
            data: DataQueue::attach(&segment, layout),
            segment,
        }
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.segment.name()
    }
}

impl Channel<Writer> {
    /// Both ends of one channel in an anonymous in-process mapping.
    pub fn anonymous_pair(config: &ChannelConfig) -> Result<(WriterChannel, ReaderChannel)> {
        config.validate()?;
        let layout = ChannelLayout::new(config.command_capacity, config.data_capacity);
        let segment = Arc::new(SharedSegment::anonymous("anonymous", layout.total_size())?);
        segment.attach_channel(&layout, Duration::ZERO)?;
        Ok((
            Channel::from_segment(Arc::clone(&segment), &layout),
            Channel::from_segment(segment, &layout),
        ))
    }
}

impl Channel<Reader> {
    /// Drops every readable header and word. Returns `(headers, words)` dropped.
    pub fn discard_all(&mut self) -> (usize, usize) {
        (self.commands.discard_all(), self.data.discard_all())
    }
}
