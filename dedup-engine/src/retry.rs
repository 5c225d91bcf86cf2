use std::time;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// The retry policy used for batch existence queries.
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    max_attempts: u32,
    /// Delay multiplied by the number of the attempt that just failed.
    base_delay: time::Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: time::Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Linear backoff: the wait after attempt `attempt` fails.
    pub fn delay_after(&self, attempt: u32) -> time::Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: time::Duration::from_secs(1),
        }
    }
}
