use std::fmt::Debug;
use std::time::Duration;

/// Decides how long to wait before the next connection attempt after
/// `failures` consecutive failures. `None` means stop retrying and leave the
/// next attempt to an external trigger (network up, lifecycle resume).
pub trait ReconnectPolicy: Send + Sync + Debug {
    fn next_delay(&self, failures: u32) -> Option<Duration>;
}

/// Never retries on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl ReconnectPolicy for NoRetry {
    fn next_delay(&self, _failures: u32) -> Option<Duration> {
        None
    }
}

/// Doubles the delay per consecutive failure, capped at `max`, and gives up
/// after `max_attempts` failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures > self.max_attempts {
            return None;
        }
        let shift = (failures - 1).min(16);
        let delay = self.initial.saturating_mul(1u32 << shift);
        Some(delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = ExponentialBackoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(3),
            max_attempts: 6,
        };
        let delays: Vec<Option<Duration>> = (1..=7).map(|n| policy.next_delay(n)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(500)),
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(3)),
                Some(Duration::from_secs(3)),
                Some(Duration::from_secs(3)),
                None,
            ]
        );
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        let policy = ExponentialBackoff {
            max_attempts: u32::MAX,
            ..ExponentialBackoff::default()
        };
        assert_eq!(policy.next_delay(1_000), Some(policy.max));
    }

    #[test]
    fn no_retry_never_waits() {
        assert_eq!(NoRetry.next_delay(1), None);
    }
}
