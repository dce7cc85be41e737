//! Reconnect backoff state.
//!
//! Delays are whole seconds: start at 1, grow by 1 per consecutive failure,
//! cap at 15. After any successful handshake the delay resets to 5 rather
//! than 1 - deliberate asymmetry so a flaky success does not turn into a
//! hammering loop.

use std::time::Duration;

/// Maximum reconnect delay in seconds.
pub const MAX_DELAY_SECS: u64 = 15;

/// Delay used for the first failure after a successful handshake.
pub const POST_SUCCESS_DELAY_SECS: u64 = 5;

/// Capped linear backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay_secs: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Self { delay_secs: 1 }
    }

    /// Delay to wait for the failure just observed; advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay_secs;
        if self.delay_secs < MAX_DELAY_SECS {
            self.delay_secs += 1;
        }
        Duration::from_secs(current)
    }

    /// Record a successful handshake.
    pub fn note_success(&mut self) {
        self.delay_secs = POST_SUCCESS_DELAY_SECS;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
