use crate::channel::{Channel, ReaderChannel, WriterChannel};
use crate::command::{words_for, CommandFilter, CommandHeader, CommandId, DataWord, Flags};
use crate::config::{BridgeConfig, ChannelConfig};
use crate::error::{BridgeError, QueueError, Result};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::options::BridgeOptions;
use crate::role::{BridgeId, Role};
use crate::signal::{poll_until, CancelToken, RunningFlag};
use crate::transaction::Command;
use bytemuck::Pod;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, trace};

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// One side of a command bridge: the channel this process writes and the
/// channel it reads.
///
/// Any number of threads may share a `Bridge`. Writers serialize on the
/// command lock, which a [`Command`] holds from the moment its header is
/// written until it is dropped, so the peer always sees a header followed by
/// exactly that command's payload. Readers serialize on a second lock.
///
/// Every blocking call takes or derives a timeout; none waits forever.
///
/// # Example
///
/// ```no_run
/// use cmdbridge::{
///     Bridge, BridgeConfig, CancelToken, CommandFilter, CommandId, Device, Flags, Role,
///     RunningFlag, StaticOptions, MODULE_CHANNEL_CONFIG,
/// };
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let running = RunningFlag::new(true);
/// let options = Arc::new(StaticOptions::default());
/// let config = BridgeConfig::symmetric(MODULE_CHANNEL_CONFIG);
///
/// let client = Bridge::<Device>::init("app-", Role::Client, config.clone(), options.clone(), running.clone())?;
/// let server = Bridge::<Device>::init("app-", Role::Server, config, options, running)?;
///
/// const CLEAR: CommandId = CommandId::user(1);
/// client.issue(CLEAR, 7, Flags::NONE, |cmd| cmd.send_data(0xFF00_00FF))?;
///
/// let header = server.wait_for_command(CLEAR, Duration::from_millis(50), &CancelToken::new())?;
/// assert_eq!(server.pop_front()?, header);
/// assert_eq!(server.get_data()?, 0xFF00_00FF);
/// # Ok::<(), cmdbridge::BridgeError>(())
/// ```
pub struct Bridge<Id: BridgeId> {
    role: Role,
    writer: Mutex<WriterChannel>,
    reader: Mutex<ReaderChannel>,
    writer_name: String,
    reader_name: String,
    options: Arc<dyn BridgeOptions>,
    running: RunningFlag,
    cancel: CancelToken,
    poll_interval: Duration,
    sequence: AtomicU64,
    command_count: AtomicU64,
    /// Thread token of the current command holder, 0 when free.
    owner: AtomicU64,
    metrics: Metrics,
    _id: PhantomData<fn() -> Id>,
}

/// The command lock, tagged with the holding thread.
pub(crate) struct WriterLock<'a> {
    guard: MutexGuard<'a, WriterChannel>,
    owner: &'a AtomicU64,
}

impl Deref for WriterLock<'_> {
    type Target = WriterChannel;

    fn deref(&self) -> &WriterChannel {
        &self.guard
    }
}

impl DerefMut for WriterLock<'_> {
    fn deref_mut(&mut self) -> &mut WriterChannel {
        &mut self.guard
    }
}

impl Drop for WriterLock<'_> {
    fn drop(&mut self) {
        self.owner.store(0, Ordering::Release);
    }
}

impl<Id: BridgeId> Bridge<Id> {
    /// Attaches the writer and reader channels named after `base`, `Id` and `role`.
    ///
    /// The peer must call this with the opposite role and the
    /// [mirrored](BridgeConfig::mirrored) configuration.
    pub fn init(
        base: &str,
        role: Role,
        config: BridgeConfig,
        options: Arc<dyn BridgeOptions>,
        running: RunningFlag,
    ) -> Result<Self> {
        config.validate()?;
        let (writer_name, reader_name) = role.channel_names::<Id>(base);
        let writer = WriterChannel::attach(
            &config.segment_dir,
            &writer_name,
            &config.writer,
            config.attach_timeout,
        )?;
        let reader = ReaderChannel::attach(
            &config.segment_dir,
            &reader_name,
            &config.reader,
            config.attach_timeout,
        )?;

        info!(
            bridge = Id::NAME,
            ?role,
            writer = %writer_name,
            reader = %reader_name,
            "bridge initialized"
        );
        Ok(Self::from_channels(
            role,
            writer,
            reader,
            options,
            running,
            config.poll_interval,
        ))
    }

    /// A bridge whose writer channel feeds its own reader channel, in an
    /// anonymous mapping. Useful for tests and benchmarks.
    pub fn loopback(
        channel: &ChannelConfig,
        options: Arc<dyn BridgeOptions>,
        running: RunningFlag,
    ) -> Result<Self> {
        let (writer, reader) = Channel::anonymous_pair(channel)?;
        Ok(Self::from_channels(
            Role::Client,
            writer,
            reader,
            options,
            running,
            Duration::from_millis(1),
        ))
    }

    fn from_channels(
        role: Role,
        writer: WriterChannel,
        reader: ReaderChannel,
        options: Arc<dyn BridgeOptions>,
        running: RunningFlag,
        poll_interval: Duration,
    ) -> Self {
        Self {
            role,
            writer_name: writer.name().to_owned(),
            reader_name: reader.name().to_owned(),
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            options,
            running,
            cancel: CancelToken::new(),
            poll_interval,
            sequence: AtomicU64::new(0),
            command_count: AtomicU64::new(0),
            owner: AtomicU64::new(0),
            metrics: Metrics::new(),
            _id: PhantomData,
        }
    }

    // ---------------------------------------------------------------------
    // STATE
    // ---------------------------------------------------------------------

    /// This process's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Name of the channel this process writes.
    pub fn writer_name(&self) -> &str {
        &self.writer_name
    }

    /// Name of the channel this process reads.
    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    /// Returns `true` while the host's running flag is set.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    /// Token that interrupts this bridge's internal back-pressure waits.
    ///
    /// Waits that take an explicit token observe only that one.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Commands constructed since the last reset. Diagnostics only.
    pub fn command_count(&self) -> u64 {
        self.command_count.load(Ordering::Relaxed)
    }

    /// Resets [`command_count`](Self::command_count).
    pub fn reset_command_count(&self) {
        self.command_count.store(0, Ordering::Relaxed);
    }

    /// Snapshot of the bridge counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn record_sent(&self, words: usize) {
        self.metrics.add_words_sent(words as u64);
    }

    #[inline]
    fn ensure_running(&self) -> Result<()> {
        if self.running.is_running() {
            Ok(())
        } else {
            Err(BridgeError::NotRunning)
        }
    }

    /// Takes the command lock, refusing a second acquisition on the same thread.
    fn lock_writer(&self) -> Result<WriterLock<'_>> {
        let me = thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            error!(
                bridge = Id::NAME,
                channel = %self.writer_name,
                "multiple active commands on one thread"
            );
            return Err(BridgeError::ReentrantCommand);
        }
        let guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.owner.store(me, Ordering::Release);
        Ok(WriterLock {
            guard,
            owner: &self.owner,
        })
    }

    fn lock_reader(&self) -> MutexGuard<'_, ReaderChannel> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn note_wait_failure(&self, err: &BridgeError) {
        if matches!(err, BridgeError::Timeout { .. }) {
            self.metrics.add_timeouts(1);
        }
    }

    // ---------------------------------------------------------------------
    // WRITING
    // ---------------------------------------------------------------------

    /// Starts a command batch: headers pushed until
    /// [`end_batch`](Self::end_batch) become visible to the peer together.
    pub fn begin_batch(&self) -> Result<()> {
        self.ensure_running()?;
        let mut writer = self.lock_writer()?;
        writer.commands.begin_write_batch()?;
        Ok(())
    }

    /// Publishes the command batch. Returns the number of headers made visible.
    pub fn end_batch(&self) -> Result<usize> {
        self.ensure_running()?;
        let mut writer = self.lock_writer()?;
        let n = writer.commands.end_write_batch()?;
        self.metrics.add_batches_sent(1);
        Ok(n)
    }

    /// Starts a command, writing its header. The command lock is held until
    /// the returned [`Command`] is dropped.
    pub fn command(&self, id: CommandId, handle: u64, flags: Flags) -> Result<Command<'_, Id>> {
        self.ensure_running()?;
        let mut writer = self.lock_writer()?;

        if !writer.commands.has_room(1) {
            self.metrics.add_backpressure_waits(1);
            poll_until(
                "command queue space",
                self.options.ack_timeout(),
                self.poll_interval,
                &self.running,
                Some(&self.cancel),
                || writer.commands.has_room(1).then_some(()),
            )
            .map_err(|e| {
                self.note_wait_failure(&e);
                error!(
                    bridge = Id::NAME,
                    channel = %self.writer_name,
                    command = %id,
                    error = %e,
                    "failed to send command header"
                );
                e
            })?;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let header = CommandHeader::new(id, handle, flags, sequence);
        writer.commands.push(header)?;
        self.command_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.add_commands_sent(1);
        trace!(bridge = Id::NAME, command = %id, handle, sequence, "command header sent");

        Ok(Command::new(self, writer, header))
    }

    /// Runs `f` inside a command scope. The command is closed when `f` returns.
    pub fn issue<R>(
        &self,
        id: CommandId,
        handle: u64,
        flags: Flags,
        f: impl FnOnce(&mut Command<'_, Id>) -> Result<R>,
    ) -> Result<R> {
        let mut command = self.command(id, handle, flags)?;
        f(&mut command)
    }

    /// Waits until the writer's data ring can take `words` more words.
    ///
    /// With `reset_on_last_index` the words must be contiguous: a run that
    /// would straddle the end of the ring is moved to the next lap. Fails
    /// immediately with [`BridgeError::PayloadTooLarge`] if the ring can
    /// never hold them.
    pub fn sync_data_queue(&self, words: usize, reset_on_last_index: bool) -> Result<()> {
        self.ensure_running()?;
        let mut writer = self.lock_writer()?;
        self.reserve_data(&mut writer, words, reset_on_last_index)
    }

    pub(crate) fn reserve_data(
        &self,
        writer: &mut WriterChannel,
        words: usize,
        contiguous: bool,
    ) -> Result<()> {
        self.ensure_running()?;
        let capacity = writer.data.capacity();
        if words > capacity {
            error!(
                bridge = Id::NAME,
                channel = %self.writer_name,
                words,
                capacity,
                "payload exceeds the data queue; increase the channel's data_capacity"
            );
            return Err(BridgeError::PayloadTooLarge {
                words,
                capacity,
                channel: self.writer_name.clone(),
            });
        }

        let mut ready = || match writer.data.prepare(words, contiguous) {
            Ok(()) => Some(Ok(())),
            Err(QueueError::Full | QueueError::LapPending) => None,
            Err(e) => Some(Err(BridgeError::from(e))),
        };
        if let Some(result) = ready() {
            return result;
        }

        self.metrics.add_backpressure_waits(1);
        let timeout = self.options.ack_timeout();
        poll_until(
            "data queue space",
            timeout,
            self.poll_interval,
            &self.running,
            Some(&self.cancel),
            ready,
        )
        .map_err(|e| {
            self.note_wait_failure(&e);
            error!(
                bridge = Id::NAME,
                channel = %self.writer_name,
                words,
                timeout_ms = timeout.as_millis() as u64,
                error = %e,
                "data queue did not drain"
            );
            e
        })?
    }

    pub(crate) fn record_writer(&self, writer: &WriterChannel) {
        self.metrics.record_writer_laps(writer.data.laps());
    }

    // ---------------------------------------------------------------------
    // READING DATA
    // ---------------------------------------------------------------------

    fn read_data<R>(
        &self,
        what: &'static str,
        mut probe: impl FnMut(&mut ReaderChannel) -> Option<(usize, R)>,
    ) -> Result<R> {
        self.ensure_running()?;
        let mut reader = self.lock_reader();
        let timeout = self.options.ack_timeout();
        let result = poll_until(
            what,
            timeout,
            self.poll_interval,
            &self.running,
            Some(&self.cancel),
            || probe(&mut reader),
        );
        self.metrics.record_reader_laps(reader.data.laps());

        match result {
            Ok((words, value)) => {
                self.metrics.add_words_received(words as u64);
                Ok(value)
            }
            Err(e) => {
                self.note_wait_failure(&e);
                error!(
                    bridge = Id::NAME,
                    channel = %self.reader_name,
                    what,
                    error = %e,
                    "no data from peer"
                );
                Err(e)
            }
        }
    }

    /// Reads the next data word, waiting up to the ack timeout.
    pub fn get_data(&self) -> Result<DataWord> {
        self.read_data("data word", |ch| ch.data.pull().map(|w| (1, w)))
    }

    /// Reads the next blob into an owned buffer.
    pub fn get_blob(&self) -> Result<Vec<u8>> {
        self.read_data("data blob", |ch| {
            ch.data
                .pull_blob()
                .map(|bytes| (1 + words_for(bytes.len()), bytes))
        })
    }

    /// Reads the next blob in place.
    pub fn with_blob<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let mut f = Some(f);
        self.read_data("data blob", |ch| {
            ch.data
                .pull_blob_with(|bytes| f.take().map(|f| (1 + words_for(bytes.len()), f(bytes))))
                .flatten()
        })
    }

    /// Copies the next blob into `obj`. Returns the transmitted byte length.
    ///
    /// With `check_size`, a length other than `size_of::<T>()` is logged as
    /// a warning; it never fails the call and never desynchronizes later reads.
    pub fn copy_data<T: Pod>(&self, obj: &mut T, check_size: bool) -> Result<usize> {
        self.read_data("data object", |ch| {
            ch.data
                .pull_and_copy(&mut *obj, check_size)
                .map(|len| (1 + words_for(len), len))
        })
    }

    /// Mapped offset of the reader's data position.
    pub fn get_data_pos(&self) -> usize {
        self.lock_reader().data.get_pos()
    }

    /// Defers handing consumed data words back to the peer.
    pub fn begin_read_data(&self) -> Result<()> {
        self.ensure_running()?;
        self.lock_reader().data.begin_read_batch()?;
        Ok(())
    }

    /// Hands the words read since [`begin_read_data`](Self::begin_read_data)
    /// back to the peer. Returns their number.
    pub fn end_read_data(&self) -> Result<usize> {
        self.ensure_running()?;
        Ok(self.lock_reader().data.end_read_batch()?)
    }

    /// Discards everything currently readable from the peer.
    ///
    /// Returns the number of `(headers, words)` dropped.
    pub fn ensure_queue_empty(&self) -> Result<(usize, usize)> {
        self.ensure_running()?;
        let dropped = self.lock_reader().discard_all();
        if dropped != (0, 0) {
            info!(
                bridge = Id::NAME,
                channel = %self.reader_name,
                headers = dropped.0,
                words = dropped.1,
                "discarded stale queue contents"
            );
        }
        Ok(dropped)
    }

    // ---------------------------------------------------------------------
    // READING COMMANDS
    // ---------------------------------------------------------------------

    /// Consumes the header at the front of the reader channel.
    pub fn pop_front(&self) -> Result<CommandHeader> {
        self.ensure_running()?;
        let header = self
            .lock_reader()
            .commands
            .pop_front()
            .ok_or(BridgeError::Empty)?;
        self.metrics.add_commands_received(1);
        Ok(header)
    }

    /// The header at the front of the reader channel, if any, left in place.
    pub fn peek_command(&self) -> Result<Option<CommandHeader>> {
        self.ensure_running()?;
        Ok(self.lock_reader().commands.pull())
    }

    fn wait_inner(
        &self,
        filter: CommandFilter,
        timeout: Duration,
        cancel: Option<&CancelToken>,
        discard: bool,
    ) -> Result<CommandHeader> {
        self.ensure_running()?;
        let mut reader = self.lock_reader();
        let result = poll_until(
            "command",
            timeout,
            self.poll_interval,
            &self.running,
            cancel,
            || {
                reader.data.skip_padding();
                reader.commands.pull().filter(|h| filter.matches(h))
            },
        );
        match result {
            Ok(header) => {
                if discard {
                    reader.commands.pop_front();
                    self.metrics.add_commands_received(1);
                }
                Ok(header)
            }
            Err(e) => {
                self.note_wait_failure(&e);
                debug!(
                    bridge = Id::NAME,
                    channel = %self.reader_name,
                    command = %filter.command,
                    error = %e,
                    "wait for command failed"
                );
                Err(e)
            }
        }
    }

    /// Waits until a header matching `filter` is at the front of the queue.
    ///
    /// The header is not consumed: the caller must [`pop_front`](Self::pop_front)
    /// it, otherwise the queue stays blocked on it. A non-matching header at
    /// the front keeps the wait polling until the timeout.
    pub fn wait_for_command(
        &self,
        filter: impl Into<CommandFilter>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandHeader> {
        self.wait_inner(filter.into(), timeout, Some(cancel), false)
    }

    /// Like [`wait_for_command`](Self::wait_for_command), consuming the
    /// header on success.
    pub fn wait_for_command_and_discard(
        &self,
        filter: impl Into<CommandFilter>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandHeader> {
        self.wait_inner(filter.into(), timeout, Some(cancel), true)
    }

    /// Waits up to the ack timeout for a matching response and consumes it.
    ///
    /// Without an explicit token the wait observes the bridge's own
    /// [`cancel_token`](Self::cancel_token).
    pub fn wait_for_response(
        &self,
        filter: impl Into<CommandFilter>,
        cancel: Option<&CancelToken>,
    ) -> Result<CommandHeader> {
        let filter = filter.into();
        let cancel = cancel.unwrap_or(&self.cancel);
        self.wait_inner(filter, self.options.ack_timeout(), Some(cancel), true)
            .map_err(|e| {
                error!(
                    bridge = Id::NAME,
                    command = %filter.command,
                    error = %e,
                    "no response from peer"
                );
                e
            })
    }

    /// When the peer acknowledges every command, waits for its response and
    /// returns the response word. Otherwise returns `Ok(None)` immediately.
    pub fn optional_response(
        &self,
        filter: impl Into<CommandFilter>,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<DataWord>> {
        if !self.options.send_all_server_responses() {
            return Ok(None);
        }
        self.wait_for_response(filter, cancel)?;
        self.get_data().map(Some)
    }
}

impl<Id: BridgeId> std::fmt::Debug for Bridge<Id> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("id", &Id::NAME)
            .field("role", &self.role)
            .field("writer", &self.writer_name)
            .field("reader", &self.reader_name)
            .field("running", &self.running.is_running())
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::StaticOptions;
    use crate::role::Module;
    use std::time::Instant;

    fn loopback(capacity_words: usize) -> (Bridge<Module>, RunningFlag, Arc<StaticOptions>) {
        let running = RunningFlag::new(true);
        let options = Arc::new(StaticOptions::new(Duration::from_millis(100), false));
        let bridge = Bridge::loopback(
            &ChannelConfig::with_capacities(16, capacity_words),
            options.clone(),
            running.clone(),
        )
        .unwrap();
        (bridge, running, options)
    }

    #[test]
    fn test_command_round_trip() {
        let (bridge, _running, _) = loopback(64);
        let clear = CommandId::user(1);

        bridge
            .issue(clear, 7, Flags::NONE, |cmd| cmd.send_data(0xFF00_00FF))
            .unwrap();

        let header = bridge
            .wait_for_command(clear, Duration::from_millis(50), &CancelToken::new())
            .unwrap();
        assert_eq!(header.handle, 7);
        assert_eq!(bridge.pop_front().unwrap(), header);
        assert_eq!(bridge.get_data().unwrap(), 0xFF00_00FF);
        assert_eq!(bridge.command_count(), 1);
    }

    #[test]
    fn test_reentrant_command_is_refused() {
        let (bridge, _running, _) = loopback(64);
        let outer = bridge.command(CommandId::user(1), 0, Flags::NONE).unwrap();
        assert!(matches!(
            bridge.command(CommandId::user(2), 0, Flags::NONE),
            Err(BridgeError::ReentrantCommand)
        ));
        assert!(matches!(bridge.begin_batch(), Err(BridgeError::ReentrantCommand)));
        drop(outer);
        bridge.command(CommandId::user(2), 0, Flags::NONE).unwrap();
    }

    #[test]
    fn test_not_running_short_circuits() {
        let (bridge, running, _) = loopback(64);
        running.set(false);

        assert!(matches!(bridge.begin_batch(), Err(BridgeError::NotRunning)));
        assert!(matches!(bridge.end_batch(), Err(BridgeError::NotRunning)));
        assert!(matches!(
            bridge.command(CommandId::SYNC, 0, Flags::NONE),
            Err(BridgeError::NotRunning)
        ));
        assert!(matches!(bridge.get_data(), Err(BridgeError::NotRunning)));
        assert!(matches!(bridge.sync_data_queue(1, false), Err(BridgeError::NotRunning)));
        assert_eq!(bridge.metrics(), MetricsSnapshot::default());

        running.set(true);
        assert!(bridge.peek_command().unwrap().is_none());
    }

    #[test]
    fn test_payload_too_large_fails_fast() {
        let (bridge, _running, _) = loopback(16);
        let start = Instant::now();
        let err = bridge
            .issue(CommandId::user(3), 0, Flags::NONE, |cmd| cmd.send_blob(&[0u8; 64]))
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::PayloadTooLarge {
                words: 17,
                capacity: 16,
                ..
            }
        ));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_backpressure_times_out_when_reader_never_drains() {
        let (bridge, _running, options) = loopback(16);
        options.set_ack_timeout(Duration::from_millis(20));

        let err = bridge
            .issue(CommandId::user(4), 0, Flags::NONE, |cmd| {
                for i in 0..17 {
                    cmd.send_data(i)?;
                }
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { what: "data queue space", .. }));
        assert_eq!(bridge.metrics().timeouts, 1);
    }

    #[test]
    fn test_optional_response_respects_option() {
        let (bridge, _running, options) = loopback(64);
        assert_eq!(bridge.optional_response(CommandId::RESPONSE, None).unwrap(), None);

        options.set_send_all_server_responses(true);
        bridge
            .issue(CommandId::RESPONSE, 0, Flags::NONE, |cmd| cmd.send_data(0))
            .unwrap();
        assert_eq!(
            bridge.optional_response(CommandId::RESPONSE, None).unwrap(),
            Some(0)
        );
    }

    #[test]
    fn test_wait_for_response_observes_bridge_cancel_token() {
        let (bridge, _running, options) = loopback(64);
        options.set_ack_timeout(Duration::from_secs(5));
        bridge.cancel_token().cancel();

        let start = Instant::now();
        let err = bridge.wait_for_response(CommandId::RESPONSE, None).unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_ensure_queue_empty_drops_stale_items() {
        let (bridge, _running, _) = loopback(64);
        bridge
            .issue(CommandId::SYNC, 0, Flags::NONE, |cmd| cmd.send_many([1, 2, 3]))
            .unwrap();
        assert_eq!(bridge.ensure_queue_empty().unwrap(), (1, 3));
        assert!(bridge.peek_command().unwrap().is_none());
    }
}
