//! Scoped command transactions.

use crate::bridge::{Bridge, WriterLock};
use crate::command::{words_for, CommandHeader, CommandId, DataWord};
use crate::error::{BridgeError, QueueError, Result};
use crate::role::BridgeId;
use bytemuck::Pod;
use tracing::{debug, error, trace, warn};

/// One command on the wire: its header, already written, and the payload
/// sent through it.
///
/// Holds the bridge's command lock, so no other thread's header or payload
/// can interleave with this command's. Dropping it closes the command.
///
/// Created by [`Bridge::command`] or [`Bridge::issue`].
pub struct Command<'a, Id: BridgeId> {
    bridge: &'a Bridge<Id>,
    writer: WriterLock<'a>,
    header: CommandHeader,
}

impl<'a, Id: BridgeId> Command<'a, Id> {
    pub(crate) fn new(bridge: &'a Bridge<Id>, writer: WriterLock<'a>, header: CommandHeader) -> Self {
        Self {
            bridge,
            writer,
            header,
        }
    }

    /// The header this command wrote.
    pub fn header(&self) -> &CommandHeader {
        &self.header
    }

    /// Command id.
    pub fn id(&self) -> CommandId {
        self.header.command
    }

    /// Sequence number assigned to this command. Responses carry it as their handle.
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    fn reserve(&mut self, words: usize, contiguous: bool) -> Result<()> {
        self.bridge.reserve_data(&mut self.writer, words, contiguous)
    }

    fn sent(&self, what: &'static str, words: usize, result: Result<(), QueueError>) -> Result<()> {
        match result {
            Ok(()) => {
                self.bridge.record_sent(words);
                Ok(())
            }
            Err(e) => {
                error!(
                    bridge = Id::NAME,
                    command = %self.header.command,
                    what,
                    error = %e,
                    "failed to send data"
                );
                Err(BridgeError::from(e))
            }
        }
    }

    /// Appends one word to the payload.
    pub fn send_data(&mut self, word: DataWord) -> Result<()> {
        self.reserve(1, false)?;
        let result = self.writer.data.push(word);
        self.sent("word", 1, result)
    }

    /// Appends a fixed-arity group of words.
    pub fn send_many<const N: usize>(&mut self, words: [DataWord; N]) -> Result<()> {
        self.reserve(N, false)?;
        let result = self.writer.data.push_many(words);
        self.sent("words", N, result)
    }

    /// Appends a size-prefixed blob.
    pub fn send_blob(&mut self, bytes: &[u8]) -> Result<()> {
        let words = 1 + words_for(bytes.len());
        self.reserve(words, true)?;
        let result = self.writer.data.push_blob(bytes);
        self.sent("blob", words, result)
    }

    /// Appends the bytes of a plain-old-data value as a blob.
    pub fn send_value<T: Pod>(&mut self, value: &T) -> Result<()> {
        self.send_blob(bytemuck::bytes_of(value))
    }

    /// Reserves a blob of `len` bytes and returns it for in-place writing.
    ///
    /// The peer sees nothing until [`end_data_blob`](Self::end_data_blob),
    /// or until the command is dropped.
    pub fn begin_data_blob(&mut self, len: usize) -> Result<&mut [u8]> {
        self.reserve(1 + words_for(len), true)?;
        match self.writer.data.begin_blob_push(len) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                error!(
                    bridge = Id::NAME,
                    command = %self.header.command,
                    len,
                    error = %e,
                    "failed to begin sending a data blob"
                );
                Err(e.into())
            }
        }
    }

    /// Publishes the blob opened by [`begin_data_blob`](Self::begin_data_blob).
    pub fn end_data_blob(&mut self) -> Result<()> {
        if !self.bridge.is_running() {
            return Err(BridgeError::NotRunning);
        }
        let before = self.writer.data.logical_pos();
        self.writer.data.end_blob_push()?;
        let words = self.writer.data.logical_pos() - before;
        self.bridge.record_sent(words as usize);
        Ok(())
    }
}

impl<Id: BridgeId> Drop for Command<'_, Id> {
    fn drop(&mut self) {
        if self.writer.data.has_open_blob() {
            if self.bridge.is_running() {
                warn!(
                    bridge = Id::NAME,
                    command = %self.header.command,
                    "command dropped with an open data blob; publishing it"
                );
                if let Err(e) = self.end_data_blob() {
                    error!(bridge = Id::NAME, error = %e, "failed to close data blob");
                }
            } else {
                self.writer.data.abandon_blob();
                debug!(
                    bridge = Id::NAME,
                    command = %self.header.command,
                    "bridge stopped; open data blob abandoned"
                );
            }
        }
        self.bridge.record_writer(&self.writer);
        trace!(
            bridge = Id::NAME,
            command = %self.header.command,
            sequence = self.header.sequence,
            "command closed"
        );
    }
}

impl<Id: BridgeId> std::fmt::Debug for Command<'_, Id> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("bridge", &Id::NAME)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}
