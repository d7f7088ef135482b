//! Reconnect backoff
//!
//! `delay = min(max_delay, base_delay * 2^attempt) + jitter`, where the jitter
//! is uniform in `[0, max_jitter)`. The attempt counter only resets once a new
//! session has been authenticated, so a broker that accepts sockets but keeps
//! refusing them still backs off.

use std::time::Duration;

use tokio_retry::strategy::jitter;

/// Largest exponent applied to the base delay; far beyond any useful cap
const MAX_EXPONENT: u32 = 16;

/// Reconnection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random delay added to every wait
    pub max_jitter: Duration,
    /// Longest silence tolerated on an open socket, including the wait for
    /// `authenticated`; about twice the broker's keepalive interval
    pub read_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Delay before jitter for a given attempt
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_EXPONENT);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Attempt counter driving the reconnect delays
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Failed cycles since the last authenticated session
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the current attempt, then count the attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.capped_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.policy.max_jitter.is_zero() {
            delay
        } else {
            delay + jitter(self.policy.max_jitter)
        }
    }

    /// Back to the base delay; call only after an authenticated session
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
