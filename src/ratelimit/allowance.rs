//! The sliding-window allowance model.
//!
//! A pure function from the stored bucket and the current time to the next
//! bucket, or to the wait needed before the request could fit. Everything is
//! in fixed-point units (see [`fixed_point`](super::fixed_point)).

/// Quota in fixed-point units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Encoded `max_requests`
    pub max: i64,
    /// Encoded period, in milliseconds
    pub period: i64,
}

/// Per-key rate-limit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub allowance: i64,
    pub timestamp: i64,
}

/// Result of applying a request to a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request fits; `bucket` is the state to persist.
    Accept { bucket: Bucket },
    /// The request does not fit yet. `bucket` is the replenished state at
    /// `now` with nothing consumed; `wait` is the encoded time until it would fit.
    Reject { bucket: Bucket, wait: i64 },
}

impl Quota {
    /// Apply `to_consume` at `now` to the stored state.
    ///
    /// Missing records mean a fresh bucket: a full allowance stamped `now`.
    /// A stored timestamp ahead of `now` counts as zero elapsed time and is
    /// kept, so timestamps never move backwards.
    pub fn apply(
        &self,
        allowance: Option<i64>,
        timestamp: Option<i64>,
        now: i64,
        to_consume: i64,
    ) -> Decision {
        let previous = allowance.unwrap_or(self.max).clamp(0, self.max);
        let previous_ts = timestamp.unwrap_or(now);

        let elapsed = (now - previous_ts).max(0);
        let projected = (previous as i128 + self.replenished(elapsed)).min(self.max as i128) as i64;

        let bucket = Bucket {
            allowance: projected,
            timestamp: previous_ts.max(now),
        };

        if to_consume > projected {
            Decision::Reject {
                bucket,
                wait: self.time_to_replenish(to_consume - projected),
            }
        } else {
            Decision::Accept {
                bucket: Bucket {
                    allowance: projected - to_consume,
                    ..bucket
                },
            }
        }
    }

    /// Allowance regained over `elapsed`, rounded down.
    fn replenished(&self, elapsed: i64) -> i128 {
        elapsed as i128 * self.max as i128 / self.period as i128
    }

    /// Time needed to regain `deficit`, rounded up so that sleeping it is
    /// always enough.
    fn time_to_replenish(&self, deficit: i64) -> i64 {
        let numerator = deficit as i128 * self.period as i128;
        let max = self.max as i128;
        ((numerator + max - 1) / max) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 5 requests per 8 seconds
    const QUOTA: Quota = Quota {
        max: 5_000,
        period: 8_000,
    };
    const NOW: i64 = 1_000_000;

    fn accepted(decision: Decision) -> Bucket {
        match decision {
            Decision::Accept { bucket } => bucket,
            other => panic!("expected accept, got {:?}", other),
        }
    }

    fn rejected(decision: Decision) -> (Bucket, i64) {
        match decision {
            Decision::Reject { bucket, wait } => (bucket, wait),
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[test]
    fn test_fresh_bucket_is_full() {
        let bucket = accepted(QUOTA.apply(None, None, NOW, 1_000));
        assert_eq!(bucket, Bucket { allowance: 4_000, timestamp: NOW });

        let bucket = accepted(QUOTA.apply(None, None, NOW, 5_000));
        assert_eq!(bucket.allowance, 0);
    }

    #[test]
    fn test_replenishes_linearly() {
        // 1.6s regains exactly one request
        let bucket = accepted(QUOTA.apply(Some(0), Some(NOW), NOW + 1_600, 1_000));
        assert_eq!(bucket.allowance, 0);
        assert_eq!(bucket.timestamp, NOW + 1_600);

        // Half of that regains half a request
        let bucket = accepted(QUOTA.apply(Some(0), Some(NOW), NOW + 800, 500));
        assert_eq!(bucket.allowance, 0);
    }

    #[test]
    fn test_replenishment_is_capped() {
        let bucket = accepted(QUOTA.apply(Some(4_000), Some(NOW), NOW + 60_000, 1_000));
        assert_eq!(bucket.allowance, 4_000);
    }

    #[test]
    fn test_reject_reports_wait() {
        let (bucket, wait) = rejected(QUOTA.apply(Some(0), Some(NOW), NOW, 1_000));
        assert_eq!(wait, 1_600);
        assert_eq!(bucket, Bucket { allowance: 0, timestamp: NOW });

        // Partial replenishment shortens the wait
        let (bucket, wait) = rejected(QUOTA.apply(Some(0), Some(NOW), NOW + 400, 1_000));
        assert_eq!(bucket.allowance, 250);
        assert_eq!(wait, 1_200);
    }

    #[test]
    fn test_wait_rounds_up() {
        // 3 requests per 10 seconds: one request takes 3333.33ms
        let quota = Quota {
            max: 3_000,
            period: 10_000,
        };
        let (_, wait) = rejected(quota.apply(Some(0), Some(NOW), NOW, 1_000));
        assert_eq!(wait, 3_334);

        // Sleeping the wait is always enough
        let bucket = accepted(quota.apply(Some(0), Some(NOW), NOW + wait, 1_000));
        assert_eq!(bucket.allowance, 0);
    }

    #[test]
    fn test_clock_skew_counts_as_no_time() {
        let (bucket, wait) = rejected(QUOTA.apply(Some(0), Some(NOW), NOW - 5_000, 1_000));
        assert_eq!(wait, 1_600);
        assert_eq!(bucket.timestamp, NOW);

        let bucket = accepted(QUOTA.apply(Some(2_000), Some(NOW), NOW - 5_000, 1_000));
        assert_eq!(bucket, Bucket { allowance: 1_000, timestamp: NOW });
    }

    #[test]
    fn test_out_of_range_allowance_is_clamped() {
        let bucket = accepted(QUOTA.apply(Some(9_000), Some(NOW), NOW, 1_000));
        assert_eq!(bucket.allowance, 4_000);

        let (_, wait) = rejected(QUOTA.apply(Some(-3_000), Some(NOW), NOW, 1_000));
        assert_eq!(wait, 1_600);
    }

    #[test]
    fn test_large_elapsed_does_not_overflow() {
        let bucket = accepted(QUOTA.apply(Some(0), Some(0), i64::MAX / 2, 1_000));
        assert_eq!(bucket.allowance, 4_000);
    }
}
