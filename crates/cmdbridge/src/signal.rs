//! Externally owned flags that gate and interrupt bridge operations.

use crate::backoff::Backoff;
use crate::error::BridgeError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-wide "bridge is up" flag.
///
/// The host sets it once the peer is connected and clears it to begin
/// shutdown. The bridge only reads it: once it is `false`, every mutating
/// operation returns [`BridgeError::NotRunning`] without touching shared memory.
#[derive(Debug, Clone, Default)]
pub struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    /// Creates a flag with the given initial state.
    pub fn new(running: bool) -> Self {
        Self(Arc::new(AtomicBool::new(running)))
    }

    /// Marks the bridge as running (or not).
    #[inline]
    pub fn set(&self, running: bool) {
        self.0.store(running, Ordering::Release);
    }

    /// Returns `true` while the bridge may touch shared memory.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A cloneable early-out signal for blocked waiters.
///
/// Setting it makes every wait observing it return
/// [`BridgeError::Cancelled`] on its next poll, without waiting out the
/// timeout. Cancellation is sticky until [`reset`](Self::reset).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers cancellation.
    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Re-arms the token.
    #[inline]
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Polls `probe` until it yields a value, the timeout elapses, the token is
/// cancelled or the bridge stops running.
///
/// Sleeps never exceed `max_sleep` nor the remaining time, so a timeout
/// fires within one poll interval of its deadline.
pub(crate) fn poll_until<T>(
    what: &'static str,
    timeout: Duration,
    max_sleep: Duration,
    running: &RunningFlag,
    cancel: Option<&CancelToken>,
    mut probe: impl FnMut() -> Option<T>,
) -> Result<T, BridgeError> {
    let start = Instant::now();
    let mut backoff = Backoff::new();
    loop {
        if !running.is_running() {
            return Err(BridgeError::NotRunning);
        }
        if let Some(value) = probe() {
            return Ok(value);
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(BridgeError::Cancelled);
        }
        let waited = start.elapsed();
        if waited >= timeout {
            return Err(BridgeError::Timeout { waited, what });
        }
        backoff.wait(max_sleep.min(timeout - waited));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_poll_returns_value() {
        let running = RunningFlag::new(true);
        let mut calls = 0;
        let value = poll_until(
            "value",
            Duration::from_secs(1),
            Duration::from_millis(1),
            &running,
            None,
            || {
                calls += 1;
                (calls == 3).then_some(42)
            },
        )
        .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_poll_times_out() {
        let running = RunningFlag::new(true);
        let start = Instant::now();
        let err = poll_until::<()>(
            "nothing",
            Duration::from_millis(30),
            Duration::from_millis(1),
            &running,
            None,
            || None,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { what: "nothing", .. }));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_poll_observes_cancel() {
        let running = RunningFlag::new(true);
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let start = Instant::now();
        let err = poll_until::<()>(
            "cancel",
            Duration::from_secs(10),
            Duration::from_millis(1),
            &running,
            Some(&token),
            || None,
        )
        .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, BridgeError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_poll_stops_when_not_running() {
        let running = RunningFlag::new(false);
        let err = poll_until(
            "stopped",
            Duration::from_secs(10),
            Duration::from_millis(1),
            &running,
            None,
            || Some(1),
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::NotRunning));
    }
}
