//! Exponential reconnect delay for relay sockets
//!
//! Pure doubling with no jitter. The delay is only capped when a maximum is
//! configured.

use std::time::Duration;

/// Default base delay before the first reconnect attempt
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(3333);

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
    current: Duration,
    failures: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new(base: Duration, max: Option<Duration>) -> Self {
        Self {
            base,
            max,
            current: base,
            failures: 0,
        }
    }

    /// Delay to wait before the next attempt. Doubles the stored delay afterwards.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let doubled = self.current.saturating_mul(2);
        self.current = match self.max {
            Some(max) => doubled.min(max),
            None => doubled,
        };
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Back to the base delay after a successful open
    pub fn reset(&mut self) {
        self.current = self.base;
        self.failures = 0;
    }

    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }

    #[must_use]
    pub const fn base(&self) -> Duration {
        self.base
    }

    /// Consecutive failures since the last reset
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BASE, None)
    }
}
