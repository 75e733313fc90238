//! Compile-time markers for channel direction and bridge identity, plus the
//! runtime process role.

mod sealed {
    pub trait Sealed {}
}

/// Which end of a ring this process holds.
///
/// Sealed: only [`Writer`] and [`Reader`] exist. Queue operations are
/// implemented on `Queue<Writer>` or `Queue<Reader>` only, so a reader
/// channel cannot push and a writer channel cannot pop.
pub trait Direction: sealed::Sealed + Send + Sync + 'static {
    /// `true` for [`Writer`].
    const IS_WRITER: bool;
    /// Name used in logs.
    const NAME: &'static str;
}

/// Producer end of a channel.
#[derive(Debug)]
pub enum Writer {}

/// Consumer end of a channel.
#[derive(Debug)]
pub enum Reader {}

impl sealed::Sealed for Writer {}
impl sealed::Sealed for Reader {}

impl Direction for Writer {
    const IS_WRITER: bool = true;
    const NAME: &'static str = "writer";
}

impl Direction for Reader {
    const IS_WRITER: bool = false;
    const NAME: &'static str = "reader";
}

/// Identity of a bridge instance, part of every segment name.
///
/// Sealed: a process runs at most one [`Module`] bridge (factory-level
/// calls) and one [`Device`] bridge (per-device rendering stream).
pub trait BridgeId: sealed::Sealed + Send + Sync + 'static {
    /// Segment name prefix.
    const NAME: &'static str;
}

/// Factory-level command stream.
#[derive(Debug)]
pub enum Module {}

/// Per-device rendering command stream.
#[derive(Debug)]
pub enum Device {}

impl sealed::Sealed for Module {}
impl sealed::Sealed for Device {}

impl BridgeId for Module {
    const NAME: &'static str = "Module";
}

impl BridgeId for Device {
    const NAME: &'static str = "Device";
}

/// Which side of the bridge this process is, decided at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The application process whose API calls are forwarded.
    Client,
    /// The process executing the graphics work.
    Server,
}

impl Role {
    /// The other side.
    pub const fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }

    /// Direction tag of the channel this role writes to.
    const fn outgoing(self) -> &'static str {
        match self {
            Self::Client => "Client2Server",
            Self::Server => "Server2Client",
        }
    }

    /// Segment names `(writer, reader)` for this role.
    ///
    /// The client's writer name is the server's reader name and vice versa,
    /// so both processes connect without negotiating.
    pub fn channel_names<Id: BridgeId>(self, base: &str) -> (String, String) {
        (
            format!("{base}{}{}", Id::NAME, self.outgoing()),
            format!("{base}{}{}", Id::NAME, self.peer().outgoing()),
        )
    }
}
