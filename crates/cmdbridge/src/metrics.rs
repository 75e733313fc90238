use std::sync::atomic::{AtomicU64, Ordering};

/// Bridge counters. Updated with relaxed atomics from any thread.
#[derive(Debug, Default)]
pub struct Metrics {
    commands_sent: AtomicU64,
    words_sent: AtomicU64,
    batches_sent: AtomicU64,
    commands_received: AtomicU64,
    words_received: AtomicU64,
    timeouts: AtomicU64,
    backpressure_waits: AtomicU64,
    writer_laps: AtomicU64,
    reader_laps: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Headers written.
    pub commands_sent: u64,
    /// Data words written, size prefixes included.
    pub words_sent: u64,
    /// Command batches published.
    pub batches_sent: u64,
    /// Headers popped.
    pub commands_received: u64,
    /// Data words read, size prefixes included.
    pub words_received: u64,
    /// Waits that ran out of time.
    pub timeouts: u64,
    /// Writes that had to wait for the reader to free space.
    pub backpressure_waits: u64,
    /// Laps completed by the writer's data ring, as of its last command.
    pub writer_laps: u64,
    /// Laps completed by the reader's data ring, as of its last read.
    pub reader_laps: u64,
}

impl Metrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add_commands_sent(&self, n: u64) {
        self.commands_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_words_sent(&self, n: u64) {
        self.words_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_batches_sent(&self, n: u64) {
        self.batches_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_commands_received(&self, n: u64) {
        self.commands_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_words_received(&self, n: u64) {
        self.words_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_timeouts(&self, n: u64) {
        self.timeouts.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_backpressure_waits(&self, n: u64) {
        self.backpressure_waits.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_writer_laps(&self, laps: u64) {
        self.writer_laps.store(laps, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reader_laps(&self, laps: u64) {
        self.reader_laps.store(laps, Ordering::Relaxed);
    }

    /// Copies the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            words_sent: self.words_sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            words_received: self.words_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            writer_laps: self.writer_laps.load(Ordering::Relaxed),
            reader_laps: self.reader_laps.load(Ordering::Relaxed),
        }
    }
}
