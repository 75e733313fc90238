//! cmdbridge - Cross-Process Command/Data Bridge
//!
//! Two processes exchange commands over a pair of shared-memory channels, one
//! per direction. Each channel holds two SPSC rings in a single mapped
//! segment: a ring of fixed-size [`CommandHeader`]s and a ring of 32-bit data
//! words carrying each command's payload right behind its header.
//!
//! # Key Features
//!
//! - Strict framing: a [`Command`] holds the process-wide command lock from
//!   header to drop, so payloads of concurrent threads never interleave
//! - Blob payloads written and read in place (`begin_data_blob`, `with_blob`)
//! - Atomic command batches (single position store for N headers)
//! - Every wait is timeout bounded and cancellable; nothing blocks forever
//! - Lap tracking on both sides, with a shared flag so the writer never laps
//!   a reader that has not followed the previous wraparound
//! - Compile-time channel direction and bridge identity (sealed markers)
//!
//! # Example
//!
//! ```
//! use cmdbridge::{
//!     Bridge, CancelToken, ChannelConfig, CommandId, Flags, Module, RunningFlag, StaticOptions,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! // Writer channel looped back to the reader channel, in anonymous memory.
//! let bridge = Bridge::<Module>::loopback(
//!     &ChannelConfig::with_capacities(64, 1024),
//!     Arc::new(StaticOptions::default()),
//!     RunningFlag::new(true),
//! )?;
//!
//! const CLEAR: CommandId = CommandId::user(1);
//! bridge.issue(CLEAR, 7, Flags::NONE, |cmd| {
//!     cmd.send_data(0xFF00_00FF)?;
//!     cmd.send_blob(b"payload")
//! })?;
//!
//! let header = bridge.wait_for_command(CLEAR, Duration::from_millis(50), &CancelToken::new())?;
//! assert_eq!(header.handle, 7);
//! bridge.pop_front()?;
//! assert_eq!(bridge.get_data()?, 0xFF00_00FF);
//! assert_eq!(bridge.get_blob()?, b"payload");
//! # Ok::<(), cmdbridge::BridgeError>(())
//! ```

mod backoff;
mod bridge;
mod channel;
mod command;
mod command_queue;
mod config;
mod data_queue;
mod error;
mod invariants;
mod layout;
mod metrics;
mod options;
mod ring;
mod role;
mod shm;
mod signal;
mod transaction;

pub use backoff::Backoff;
pub use bridge::Bridge;
pub use channel::{Channel, ReaderChannel, WriterChannel};
pub use command::{
    words_for, CommandFilter, CommandHeader, CommandId, DataWord, Flags, WORD_SIZE,
};
pub use command_queue::CommandQueue;
pub use config::{
    BridgeConfig, ChannelConfig, ConfigError, DEVICE_CHANNEL_CONFIG, MODULE_CHANNEL_CONFIG,
};
pub use data_queue::{DataQueue, Readiness};
pub use error::{BridgeError, QueueError, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use options::{BridgeOptions, StaticOptions};
pub use ring::RingBuffer;
pub use role::{BridgeId, Device, Direction, Module, Reader, Role, Writer};
pub use shm::{SegmentError, SharedSegment};
pub use signal::{CancelToken, RunningFlag};
pub use transaction::Command;
