//! Bounded retry with randomized backoff.

use std::time::Duration;

use crate::clock::Clock;

/// Cap on exponential growth, so delays stay finite.
const MAX_DOUBLINGS: u32 = 10;

/// Bounds shared by lock acquisition and the CAS loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wall-clock budget for all attempts
    pub timeout: Duration,
    /// Maximum number of attempts, the first included
    pub max_attempts: u32,
    /// Scale of each delay
    pub base: Duration,
}

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^attempt`, jittered
    Exponential,
    /// `base * sqrt(attempt / e)`, jittered
    SquareRoot,
}

impl Backoff {
    /// Delay after `attempt` failed attempts, scaled by `jitter` in `[0, 1)`.
    pub fn delay(&self, attempt: u32, base: Duration, jitter: f64) -> Duration {
        let factor = match self {
            Backoff::Exponential => f64::from(1u32 << attempt.min(MAX_DOUBLINGS)),
            Backoff::SquareRoot => (f64::from(attempt) / std::f64::consts::E).sqrt(),
        };
        base.mul_f64(jitter.clamp(0.0, 1.0) * factor)
    }
}

/// One bounded retry loop in progress.
pub struct Retry<'a> {
    policy: RetryPolicy,
    clock: &'a dyn Clock,
    deadline: Duration,
    attempts: u32,
}

impl<'a> Retry<'a> {
    /// Start counting; the caller is about to make its first attempt.
    pub fn start(policy: RetryPolicy, clock: &'a dyn Clock) -> Self {
        Self {
            policy,
            deadline: clock.now() + policy.timeout,
            clock,
            attempts: 1,
        }
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sleep before the next attempt.
    ///
    /// Returns `false`, without sleeping, once either bound is exhausted. The
    /// delay is cut short at the deadline so one last attempt lands on it.
    pub async fn backoff(&mut self, backoff: Backoff) -> bool {
        if self.attempts >= self.policy.max_attempts {
            return false;
        }
        let now = self.clock.now();
        if now >= self.deadline {
            return false;
        }

        let delay = backoff
            .delay(self.attempts, self.policy.base, rand::random::<f64>())
            .min(self.deadline - now);
        self.clock.sleep(delay).await;
        self.attempts += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const BASE: Duration = Duration::from_millis(10);

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.as_secs_f64() - expected.as_secs_f64();
        assert!(diff.abs() < 1e-6, "{:?} != {:?}", actual, expected);
    }

    #[test]
    fn test_exponential_delay() {
        assert_close(Backoff::Exponential.delay(1, BASE, 1.0), Duration::from_millis(20));
        assert_close(Backoff::Exponential.delay(3, BASE, 0.5), Duration::from_millis(40));
        assert_close(
            Backoff::Exponential.delay(50, BASE, 1.0),
            Duration::from_millis(10 * 1024),
        );
        assert_eq!(Backoff::Exponential.delay(4, BASE, 0.0), Duration::ZERO);
    }

    #[test]
    fn test_square_root_delay() {
        let e = std::f64::consts::E;
        let delay = Backoff::SquareRoot.delay(1, BASE, 1.0);
        let expected = BASE.as_secs_f64() * (1.0 / e).sqrt();
        assert!((delay.as_secs_f64() - expected).abs() < 1e-8);

        // Grows sub-linearly
        let d4 = Backoff::SquareRoot.delay(4, BASE, 1.0);
        let d16 = Backoff::SquareRoot.delay(16, BASE, 1.0);
        assert!((d16.as_secs_f64() / d4.as_secs_f64() - 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_stops_at_max_attempts() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let policy = RetryPolicy {
            timeout: Duration::from_secs(3_600),
            max_attempts: 4,
            base: BASE,
        };

        let mut retry = Retry::start(policy, &clock);
        let mut retries = 0;
        while retry.backoff(Backoff::Exponential).await {
            retries += 1;
        }

        assert_eq!(retries, 3);
        assert_eq!(retry.attempts(), 4);
    }

    #[tokio::test]
    async fn test_stops_at_deadline() {
        let start = Duration::from_secs(1_000);
        let clock = ManualClock::new(start);
        let policy = RetryPolicy {
            timeout: Duration::from_millis(100),
            max_attempts: u32::MAX,
            base: Duration::from_secs(1),
        };

        let mut retry = Retry::start(policy, &clock);
        while retry.backoff(Backoff::SquareRoot).await {}

        assert!(clock.now() - start <= Duration::from_millis(100));
        assert!(retry.attempts() >= 2);
    }
}
