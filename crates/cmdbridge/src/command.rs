//! Wire types shared by both processes.
//!
//! Both sides must be built with identical layouts: headers and data words
//! cross the boundary as raw machine-native bytes with no version tag.

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// One slot of the data ring.
pub type DataWord = u32;

/// Width of a [`DataWord`] in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<DataWord>();

/// Number of words needed to hold `bytes` bytes.
#[inline]
pub const fn words_for(bytes: usize) -> usize {
    bytes.div_ceil(WORD_SIZE)
}

/// Identifies a transported command.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
pub struct CommandId(pub u32);

impl CommandId {
    /// Wildcard for waits. Never sent.
    pub const ANY: Self = Self(0);
    /// Reply to a command that expects a response.
    pub const RESPONSE: Self = Self(1);
    /// Bare acknowledgement without payload.
    pub const ACK: Self = Self(2);
    /// Flush marker used at bring-up and recovery.
    pub const SYNC: Self = Self(3);
    /// The peer is shutting down.
    pub const TERMINATE: Self = Self(4);
    /// First id available to the command layer.
    pub const USER_BASE: u32 = 0x100;

    /// Returns a command-layer id, offset past the reserved range.
    pub const fn user(id: u32) -> Self {
        Self(Self::USER_BASE + id)
    }

    /// Returns `true` for ids reserved by the bridge itself.
    pub const fn is_reserved(self) -> bool {
        self.0 < Self::USER_BASE
    }
}

impl fmt::Debug for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ANY => f.write_str("Any"),
            Self::RESPONSE => f.write_str("Response"),
            Self::ACK => f.write_str("Ack"),
            Self::SYNC => f.write_str("Sync"),
            Self::TERMINATE => f.write_str("Terminate"),
            Self(id) => write!(f, "CommandId({id:#x})"),
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-command flag bits.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct Flags(pub u32);

impl Flags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// The issuer will block on a [`CommandId::RESPONSE`] for this command.
    pub const EXPECTS_RESPONSE: Self = Self(1 << 0);

    /// Returns `true` if every bit of `other` is set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Fixed-size header carried by the command ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CommandHeader {
    /// What to do.
    pub command: CommandId,
    /// Modifiers for this command.
    pub flags: Flags,
    /// Object the command targets (0 when not applicable).
    pub handle: u64,
    /// Issuer-side sequence number, unique per bridge and process.
    pub sequence: u64,
}

impl CommandHeader {
    /// Creates a header.
    pub const fn new(command: CommandId, handle: u64, flags: Flags, sequence: u64) -> Self {
        Self {
            command,
            flags,
            handle,
            sequence,
        }
    }
}

/// Selects which header a wait is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFilter {
    /// Command to match, or [`CommandId::ANY`].
    pub command: CommandId,
    /// Handle the header must carry, if any.
    pub handle: Option<u64>,
}

impl CommandFilter {
    /// Matches every header.
    pub const ANY: Self = Self::command(CommandId::ANY);

    /// Matches headers with the given command id.
    pub const fn command(command: CommandId) -> Self {
        Self {
            command,
            handle: None,
        }
    }

    /// Additionally requires the header's handle.
    ///
    /// Responses carry the request's sequence number as their handle, so
    /// `CommandFilter::command(CommandId::RESPONSE).with_handle(seq)` waits
    /// for the reply to one specific request.
    pub const fn with_handle(mut self, handle: u64) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Returns `true` if `header` satisfies the filter.
    pub fn matches(&self, header: &CommandHeader) -> bool {
        (self.command == CommandId::ANY || self.command == header.command)
            && self.handle.map_or(true, |h| h == header.handle)
    }
}

impl From<CommandId> for CommandFilter {
    fn from(command: CommandId) -> Self {
        Self::command(command)
    }
}
