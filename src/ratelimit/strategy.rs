//! The update protocol shared by both contention strategies.
//!
//! A check first tries the fast path: creating the allowance record with
//! `add`, which only the first observer of a fresh bucket can do. Everyone
//! else goes through an [`UpdateStrategy`], which reads the bucket, applies
//! the allowance model and writes the result back under either an advisory
//! lock or a compare-and-swap.

use async_trait::async_trait;
use tracing::debug;

use super::allowance::{Bucket, Decision, Quota};
use super::backoff::RetryPolicy;
use super::fixed_point::{encode_duration, SCALE};
use super::keys::BucketKeys;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::KeyValueStore;

/// Outcome of a contended update. Failing to complete the update within its
/// bounds is an error, not an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Accepted,
    /// Encoded wait before the request would fit
    Rejected { wait: i64 },
}

/// Everything a strategy needs for one update.
pub struct UpdateContext<'a> {
    pub store: &'a dyn KeyValueStore,
    pub clock: &'a dyn Clock,
    pub quota: Quota,
    /// TTL of bucket records after an accepted request, in seconds
    pub period_ttl: u64,
    pub retry: RetryPolicy,
}

impl UpdateContext<'_> {
    /// Current encoded time.
    pub fn now(&self) -> i64 {
        encode_duration(self.clock.now())
    }

    /// TTL for records written with this outcome.
    ///
    /// A rejection extends the records past the period by the outstanding
    /// wait, so the bucket cannot expire back to full mid-penalty.
    pub fn ttl_for(&self, outcome: UpdateOutcome) -> u64 {
        match outcome {
            UpdateOutcome::Accepted => self.period_ttl,
            UpdateOutcome::Rejected { wait } => {
                let penalty = (wait.max(0) as u64).div_ceil(SCALE as u64);
                self.period_ttl.saturating_add(penalty)
            }
        }
    }
}

/// Split a model decision into the state to persist and the outcome to report.
pub fn settle(decision: Decision) -> (Bucket, UpdateOutcome) {
    match decision {
        Decision::Accept { bucket } => (bucket, UpdateOutcome::Accepted),
        Decision::Reject { bucket, wait } => (bucket, UpdateOutcome::Rejected { wait }),
    }
}

/// Claim a fresh bucket. Returns whether this caller created it, in which
/// case the request is admitted.
pub async fn fast_path(ctx: &UpdateContext<'_>, keys: &BucketKeys, to_consume: i64) -> Result<bool> {
    let created = ctx
        .store
        .add(&keys.allowance, ctx.quota.max - to_consume, ctx.period_ttl)
        .await?;
    if !created {
        return Ok(false);
    }

    ctx.store
        .set(&keys.timestamp, ctx.now(), ctx.period_ttl)
        .await?;
    debug!(key = %keys, "Created fresh bucket");
    Ok(true)
}

/// A way of performing the contended read-modify-write of a bucket.
#[async_trait]
pub trait UpdateStrategy: Send + Sync {
    /// Apply `to_consume` to the bucket at `keys`.
    async fn attempt_update(
        &self,
        ctx: &UpdateContext<'_>,
        keys: &BucketKeys,
        to_consume: i64,
    ) -> Result<UpdateOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn context<'a>(store: &'a MemoryStore, clock: &'a ManualClock) -> UpdateContext<'a> {
        UpdateContext {
            store,
            clock,
            quota: Quota {
                max: 5_000,
                period: 8_000,
            },
            period_ttl: 8,
            retry: RetryPolicy {
                timeout: Duration::from_millis(500),
                max_attempts: 8,
                base: Duration::from_millis(10),
            },
        }
    }

    #[test]
    fn test_penalty_ttl_rounds_wait_up() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let store = MemoryStore::new();
        let ctx = context(&store, &clock);

        assert_eq!(ctx.ttl_for(UpdateOutcome::Accepted), 8);
        assert_eq!(ctx.ttl_for(UpdateOutcome::Rejected { wait: 1_600 }), 10);
        assert_eq!(ctx.ttl_for(UpdateOutcome::Rejected { wait: 3_000 }), 11);
        assert_eq!(ctx.ttl_for(UpdateOutcome::Rejected { wait: 1 }), 9);
    }

    #[test]
    fn test_penalty_ttl_saturates() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let store = MemoryStore::new();
        let mut ctx = context(&store, &clock);
        ctx.period_ttl = u64::MAX;

        assert_eq!(ctx.ttl_for(UpdateOutcome::Accepted), u64::MAX);
        assert_eq!(ctx.ttl_for(UpdateOutcome::Rejected { wait: i64::MAX }), u64::MAX);
    }

    #[tokio::test]
    async fn test_fast_path_only_once() {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_000)));
        let store = MemoryStore::with_clock(clock.clone());
        let ctx = context(&store, &clock);
        let keys = BucketKeys::new("test", "k").unwrap();

        assert!(fast_path(&ctx, &keys, 2_000).await.unwrap());
        assert!(!fast_path(&ctx, &keys, 2_000).await.unwrap());

        let records = store.get_multi(&keys.record_keys()).await.unwrap();
        assert_eq!(records.get(&keys.allowance), Some(&3_000));
        assert_eq!(records.get(&keys.timestamp), Some(&1_000_000));
        assert_eq!(store.ttl(&keys.timestamp), Some(Duration::from_secs(8)));
    }
}
