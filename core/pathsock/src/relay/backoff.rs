//! Reconnect backoff for relay clients
//!
//! Delays start at 10ms and double on every failed read up to 5s. A
//! successful read resets the sequence.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub const BACKOFF_INITIAL: Duration = Duration::from_millis(10);
pub const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Exponential delay between relay reconnect attempts
#[derive(Debug)]
pub struct RelayBackoff {
    delay: Duration,
}

impl Default for RelayBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayBackoff {
    pub fn new() -> Self {
        Self {
            delay: BACKOFF_INITIAL,
        }
    }

    /// Delay for the next failure; doubles up to `BACKOFF_MAX`.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay = self.delay.saturating_mul(2).min(BACKOFF_MAX);
        current
    }

    pub fn reset(&mut self) {
        self.delay = BACKOFF_INITIAL;
    }

    /// Sleep for the next delay. Returns false if cancelled first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
