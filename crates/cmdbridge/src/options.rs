//! Runtime options consumed by the bridge.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Options the host provides. Read on every call, never cached.
pub trait BridgeOptions: Send + Sync {
    /// Upper bound for waits on a response or on data from the peer.
    fn ack_timeout(&self) -> Duration;

    /// Whether the server acknowledges every command with a response.
    fn send_all_server_responses(&self) -> bool;
}

/// [`BridgeOptions`] backed by atomics, adjustable while the bridge runs.
#[derive(Debug)]
pub struct StaticOptions {
    ack_timeout_us: AtomicU64,
    send_all_server_responses: AtomicBool,
}

impl StaticOptions {
    /// Creates options with the given values.
    pub fn new(ack_timeout: Duration, send_all_server_responses: bool) -> Self {
        Self {
            ack_timeout_us: AtomicU64::new(duration_to_us(ack_timeout)),
            send_all_server_responses: AtomicBool::new(send_all_server_responses),
        }
    }

    /// Changes the ack timeout.
    pub fn set_ack_timeout(&self, timeout: Duration) {
        self.ack_timeout_us
            .store(duration_to_us(timeout), Ordering::Relaxed);
    }

    /// Enables or disables per-command server responses.
    pub fn set_send_all_server_responses(&self, enabled: bool) {
        self.send_all_server_responses
            .store(enabled, Ordering::Relaxed);
    }
}

fn duration_to_us(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

impl Default for StaticOptions {
    /// 10s ack timeout, no per-command responses.
    fn default() -> Self {
        Self::new(Duration::from_secs(10), false)
    }
}

impl BridgeOptions for StaticOptions {
    fn ack_timeout(&self) -> Duration {
        Duration::from_micros(self.ack_timeout_us.load(Ordering::Relaxed))
    }

    fn send_all_server_responses(&self) -> bool {
        self.send_all_server_responses.load(Ordering::Relaxed)
    }
}
