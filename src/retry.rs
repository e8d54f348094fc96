//! Bounded retry with escalation.
//!
//! One policy per retried exchange (block requests, upgrade-end requests).
//! With `max_retries = 10` the exchange is retried ten times and the
//! eleventh failure escalates.  The counter never passes `max_retries`, so
//! every budget up to `u8::MAX` ends.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Try again.
    Retry { attempt: u8 },
    /// Budget spent; escalate.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u8,
    failures: u8,
}

impl RetryPolicy {
    pub const fn new(max_retries: u8) -> Self {
        Self {
            max_retries,
            failures: 0,
        }
    }

    /// Count one failure and decide what to do about it.
    pub fn record_failure(&mut self) -> RetryVerdict {
        if self.failures >= self.max_retries {
            return RetryVerdict::Exhausted;
        }
        self.failures += 1;
        RetryVerdict::Retry {
            attempt: self.failures,
        }
    }

    /// Forget past failures after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub const fn failures(&self) -> u8 {
        self.failures
    }

    pub const fn max_retries(&self) -> u8 {
        self.max_retries
    }
}
