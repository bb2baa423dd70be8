use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, doubling at most four times.
    Exponential(Duration),
}

/// Bounded retry schedule. Attempts are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential(base),
        }
    }

    /// Delay to sleep after a failed `attempt`; `None` when no attempt follows.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        Some(match self.backoff {
            Backoff::Fixed(d) => d,
            Backoff::Exponential(base) => base * (1u32 << (attempt - 1).min(4)),
        })
    }

    pub fn attempts(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}
