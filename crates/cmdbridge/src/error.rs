//! Error types for bridge operations.

use crate::config::ConfigError;
use crate::shm::SegmentError;
use std::time::Duration;
use thiserror::Error;

/// Non-blocking queue failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Not enough free slots; the caller must wait for the reader.
    #[error("ring buffer is full")]
    Full,
    /// The write would start a new lap before the reader followed the last one.
    #[error("reader has not acknowledged the previous lap")]
    LapPending,
    /// The item can never fit in this ring.
    #[error("item of {needed} slots exceeds ring capacity {capacity}")]
    TooLarge {
        /// Slots required.
        needed: usize,
        /// Ring capacity.
        capacity: usize,
    },
    /// `begin_batch` while a batch is already open.
    #[error("a batch is already active")]
    BatchActive,
    /// `end_batch` without a matching `begin_batch`.
    #[error("no batch is active")]
    NoBatch,
    /// A push while an in-place blob is still open.
    #[error("an in-place blob is still open")]
    BlobActive,
    /// `end_blob_push` without `begin_blob_push`.
    #[error("no in-place blob is open")]
    NoBlob,
}

/// Errors returned by [`Bridge`](crate::Bridge) and [`Command`](crate::Command).
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The running flag is cleared; shared memory was not touched.
    #[error("bridge is not running")]
    NotRunning,

    /// The peer did not produce (or drain) in time.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// Time spent waiting.
        waited: Duration,
        /// What was awaited.
        what: &'static str,
    },

    /// The wait's cancel token was set.
    #[error("wait cancelled")]
    Cancelled,

    /// Nothing to read.
    #[error("queue is empty")]
    Empty,

    /// A payload larger than the channel's whole data ring.
    #[error(
        "payload of {words} words exceeds the {capacity}-word data ring of {channel}; \
         increase the channel's data capacity"
    )]
    PayloadTooLarge {
        /// Words the payload needs (including its size prefix).
        words: usize,
        /// Data ring capacity in words.
        capacity: usize,
        /// Name of the writer channel.
        channel: String,
    },

    /// The calling thread already holds an active command on this bridge.
    #[error("multiple active commands on one thread")]
    ReentrantCommand,

    /// Queue-level failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Segment creation or attach failure.
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Returns `true` if retrying the operation later may succeed.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Cancelled | Self::Empty | Self::Queue(QueueError::Full)
        )
    }

    /// Returns `true` if the bridge is permanently unusable for this call path.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotRunning | Self::Segment(_) | Self::Config(_) | Self::PayloadTooLarge { .. }
        )
    }
}

/// Result alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
