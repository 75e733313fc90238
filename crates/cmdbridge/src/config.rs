use crate::layout::ChannelLayout;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Rejected channel or bridge configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A ring capacity is zero.
    #[error("{ring} capacity must be non-zero")]
    ZeroCapacity {
        /// Which ring ("command" or "data").
        ring: &'static str,
    },
    /// A ring capacity is not a power of two.
    #[error("{ring} capacity {capacity} is not a power of two")]
    NotPowerOfTwo {
        /// Which ring ("command" or "data").
        ring: &'static str,
        /// The rejected capacity.
        capacity: usize,
    },
    /// The segment is too small for the requested rings.
    #[error("channel memory size {mem_size} is below the {required} bytes the rings need")]
    MemTooSmall {
        /// Configured segment size in bytes.
        mem_size: usize,
        /// Bytes required by header, command slots and data words.
        required: usize,
    },
}

/// Sizing of one channel (one direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Total size of the shared segment in bytes.
    pub mem_size: usize,
    /// Number of command header slots (power of 2).
    pub command_capacity: usize,
    /// Number of 32-bit data words (power of 2).
    pub data_capacity: usize,
}

impl ChannelConfig {
    /// Creates a channel configuration.
    pub const fn new(mem_size: usize, command_capacity: usize, data_capacity: usize) -> Self {
        Self {
            mem_size,
            command_capacity,
            data_capacity,
        }
    }

    /// Creates a configuration whose segment is exactly as large as the rings need.
    pub fn with_capacities(command_capacity: usize, data_capacity: usize) -> Self {
        let layout = ChannelLayout::new(command_capacity, data_capacity);
        Self::new(layout.total_size(), command_capacity, data_capacity)
    }

    /// Bytes needed for the header, command slots and data words.
    pub fn required_mem_size(&self) -> usize {
        ChannelLayout::new(self.command_capacity, self.data_capacity).total_size()
    }

    /// Checks capacities and segment size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_capacity("command", self.command_capacity)?;
        check_capacity("data", self.data_capacity)?;
        let required = self.required_mem_size();
        if self.mem_size < required {
            return Err(ConfigError::MemTooSmall {
                mem_size: self.mem_size,
                required,
            });
        }
        Ok(())
    }
}

fn check_capacity(ring: &'static str, capacity: usize) -> Result<(), ConfigError> {
    if capacity == 0 {
        return Err(ConfigError::ZeroCapacity { ring });
    }
    if !capacity.is_power_of_two() {
        return Err(ConfigError::NotPowerOfTwo { ring, capacity });
    }
    Ok(())
}

impl Default for ChannelConfig {
    fn default() -> Self {
        DEVICE_CHANNEL_CONFIG
    }
}

/// Module bridge channels: few commands, small payloads (1K headers, 256 KiB data).
pub const MODULE_CHANNEL_CONFIG: ChannelConfig = ChannelConfig::new(1 << 20, 1 << 10, 1 << 16);

/// Device bridge channels: the rendering stream (16K headers, 64 MiB data).
pub const DEVICE_CHANNEL_CONFIG: ChannelConfig = ChannelConfig::new(80 << 20, 1 << 14, 1 << 24);

/// Configuration of a [`Bridge`](crate::Bridge).
///
/// The client's `writer` must match the server's `reader` and vice versa,
/// otherwise attaching fails with a layout mismatch.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Channel this process writes to.
    pub writer: ChannelConfig,
    /// Channel this process reads from.
    pub reader: ChannelConfig,
    /// Directory holding the named segments.
    ///
    /// Default: `/dev/shm` when present, else the system temp directory.
    pub segment_dir: PathBuf,
    /// Upper bound on a single sleep while waiting on the peer.
    ///
    /// Default: 1ms
    pub poll_interval: Duration,
    /// How long to wait for the peer to finish initializing a segment header.
    ///
    /// Default: 5s
    pub attach_timeout: Duration,
}

impl BridgeConfig {
    /// Creates a configuration with distinct writer and reader channels.
    pub fn new(writer: ChannelConfig, reader: ChannelConfig) -> Self {
        Self {
            writer,
            reader,
            segment_dir: default_segment_dir(),
            poll_interval: Duration::from_millis(1),
            attach_timeout: Duration::from_secs(5),
        }
    }

    /// Same sizing in both directions.
    pub fn symmetric(channel: ChannelConfig) -> Self {
        Self::new(channel, channel)
    }

    /// Sets the segment directory.
    pub fn with_segment_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.segment_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the attach timeout.
    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    /// Returns the configuration the peer process must use.
    pub fn mirrored(&self) -> Self {
        Self {
            writer: self.reader,
            reader: self.writer,
            ..self.clone()
        }
    }

    /// Validates both channels.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.writer.validate()?;
        self.reader.validate()
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::symmetric(DEVICE_CHANNEL_CONFIG)
    }
}

fn default_segment_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}
