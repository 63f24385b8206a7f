//! Bounded fixed-interval polling.

use std::time::Duration;

/// How many times to probe and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    /// Fresh VM boot: cloud-init can take several minutes (15 min ceiling).
    pub const SSH_BOOT: Self = Self {
        attempts: 180,
        interval: Duration::from_secs(5),
    };

    /// Already-provisioned VM that should answer within a minute.
    pub const SSH_QUICK: Self = Self {
        attempts: 12,
        interval: Duration::from_secs(5),
    };

    /// Upper bound on time spent waiting (excluding probe time).
    pub fn max_wait(&self) -> Duration {
        self.interval * self.attempts.saturating_sub(1)
    }
}

/// Call `probe(attempt)` (1-based) until it returns `Some`, at most
/// `policy.attempts` times, calling `sleep(policy.interval)` between
/// attempts. Returns `None` once attempts are exhausted.
pub fn poll_until<T>(
    policy: PollPolicy,
    mut sleep: impl FnMut(Duration),
    mut probe: impl FnMut(u32) -> Option<T>,
) -> Option<T> {
    for attempt in 1..=policy.attempts {
        if let Some(found) = probe(attempt) {
            return Some(found);
        }
        if attempt < policy.attempts {
            sleep(policy.interval);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_first_success() {
        let mut sleeps = 0;
        let found = poll_until(
            PollPolicy {
                attempts: 10,
                interval: Duration::from_secs(5),
            },
            |_| sleeps += 1,
            |attempt| (attempt == 3).then_some("10.0.0.7"),
        );
        assert_eq!(found, Some("10.0.0.7"));
        assert_eq!(sleeps, 2);
    }

    #[test]
    fn test_exhaustion_does_not_sleep_after_last_attempt() {
        let mut slept = Duration::ZERO;
        let mut probes = 0;
        let found: Option<()> = poll_until(
            PollPolicy {
                attempts: 4,
                interval: Duration::from_secs(5),
            },
            |d| slept += d,
            |_| {
                probes += 1;
                None
            },
        );
        assert!(found.is_none());
        assert_eq!(probes, 4);
        assert_eq!(slept, Duration::from_secs(15));
    }

    #[test]
    fn test_zero_attempts_never_probes() {
        let found = poll_until(
            PollPolicy {
                attempts: 0,
                interval: Duration::from_secs(1),
            },
            |_| panic!("should not sleep"),
            |_| -> Option<()> { panic!("should not probe") },
        );
        assert!(found.is_none());
    }

    #[test]
    fn test_ssh_boot_budget() {
        assert_eq!(PollPolicy::SSH_BOOT.attempts, 180);
        assert_eq!(PollPolicy::SSH_BOOT.interval, Duration::from_secs(5));
        assert_eq!(PollPolicy::SSH_BOOT.max_wait(), Duration::from_secs(895));
    }
}
