//! Lock-free contended updates through compare-and-swap.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::backoff::{Backoff, Retry};
use super::keys::BucketKeys;
use super::strategy::{settle, UpdateContext, UpdateOutcome, UpdateStrategy};
use crate::error::{LimiterError, Result};

/// Read-modify-write claimed by swapping the timestamp record.
///
/// Each attempt reads the timestamp with its version, reads the allowance,
/// applies the model and swaps in the new timestamp. Losing the swap means
/// another writer moved the bucket, so the attempt is retried after a
/// jittered backoff. The winner then moves the allowance by the computed
/// delta with `incr`/`decr`.
///
/// The allowance read is not versioned. A reader that lands between another
/// writer's timestamp swap and its allowance delta decides on the old
/// allowance, so under heavy contention a key can admit slightly more than
/// its quota, bounded by the number of writers in that window. Use
/// [`LockingUpdate`](super::locking::LockingUpdate) when that matters.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimisticUpdate;

#[async_trait]
impl UpdateStrategy for OptimisticUpdate {
    async fn attempt_update(
        &self,
        ctx: &UpdateContext<'_>,
        keys: &BucketKeys,
        to_consume: i64,
    ) -> Result<UpdateOutcome> {
        let mut retry = Retry::start(ctx.retry, ctx.clock);

        loop {
            if let Some(outcome) = try_update(ctx, keys, to_consume).await? {
                return Ok(outcome);
            }

            debug!(key = %keys, attempt = retry.attempts(), "Bucket changed during update, retrying");
            if !retry.backoff(Backoff::SquareRoot).await {
                warn!(key = %keys, attempts = retry.attempts(), "Gave up on contended update");
                return Err(LimiterError::Contention {
                    key: keys.base.clone(),
                    attempts: retry.attempts(),
                });
            }
        }
    }
}

/// One attempt. `None` means the swap was lost.
async fn try_update(
    ctx: &UpdateContext<'_>,
    keys: &BucketKeys,
    to_consume: i64,
) -> Result<Option<UpdateOutcome>> {
    let timestamp = ctx.store.gets(&keys.timestamp).await?;
    let allowance = ctx
        .store
        .get_multi(std::slice::from_ref(&keys.allowance))
        .await?
        .get(&keys.allowance)
        .copied();

    let decision = ctx.quota.apply(
        allowance,
        timestamp.map(|t| t.value),
        ctx.now(),
        to_consume,
    );
    let (bucket, outcome) = settle(decision);
    let ttl = ctx.ttl_for(outcome);

    let claimed = match timestamp {
        Some(current) => {
            ctx.store
                .cas(&keys.timestamp, bucket.timestamp, ttl, current.cas)
                .await?
        }
        None => ctx.store.add(&keys.timestamp, bucket.timestamp, ttl).await?,
    };
    if !claimed {
        return Ok(None);
    }

    write_allowance(ctx, keys, allowance, bucket.allowance, ttl).await?;
    Ok(Some(outcome))
}

/// Move the stored allowance from `read` to `target` as a delta, so
/// concurrent deltas accumulate instead of overwriting each other.
async fn write_allowance(
    ctx: &UpdateContext<'_>,
    keys: &BucketKeys,
    read: Option<i64>,
    target: i64,
    ttl: u64,
) -> Result<()> {
    let updated = match read {
        Some(read) if target >= read => ctx.store.incr(&keys.allowance, (target - read) as u64).await?,
        Some(read) => ctx.store.decr(&keys.allowance, (read - target) as u64).await?,
        None => None,
    };

    match updated {
        // Expired between read and write
        None => ctx.store.set(&keys.allowance, target, ttl).await?,
        Some(value) if value > ctx.quota.max => {
            ctx.store.set(&keys.allowance, ctx.quota.max, ttl).await?
        }
        Some(_) => {
            ctx.store.touch(&keys.allowance, ttl).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::allowance::Quota;
    use crate::ratelimit::backoff::RetryPolicy;
    use crate::store::{KeyValueStore, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<ManualClock>, MemoryStore, BucketKeys) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_000)));
        let store = MemoryStore::with_clock(clock.clone());
        let keys = BucketKeys::new("test", "k").unwrap();
        (clock, store, keys)
    }

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
                max_attempts: 16,
                base: Duration::from_millis(10),
            },
        }
    }

    #[tokio::test]
    async fn test_accept_moves_allowance_and_timestamp() {
        let (clock, store, keys) = setup();
        let ctx = context(&store, &clock);
        store.set(&keys.allowance, 1_000, 8).await.unwrap();
        store.set(&keys.timestamp, 1_000_000, 8).await.unwrap();
        clock.advance(Duration::from_millis(1_600));

        let outcome = OptimisticUpdate.attempt_update(&ctx, &keys, 1_000).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Accepted);

        let records = store.get_multi(&keys.record_keys()).await.unwrap();
        assert_eq!(records.get(&keys.allowance), Some(&1_000));
        assert_eq!(records.get(&keys.timestamp), Some(&1_001_600));
        assert_eq!(store.ttl(&keys.allowance), Some(Duration::from_secs(8)));
    }

    #[tokio::test]
    async fn test_rejection_replenishes_and_extends_ttl() {
        let (clock, store, keys) = setup();
        let ctx = context(&store, &clock);
        store.set(&keys.allowance, 0, 8).await.unwrap();
        store.set(&keys.timestamp, 1_000_000, 8).await.unwrap();
        clock.advance(Duration::from_millis(800));

        let outcome = OptimisticUpdate.attempt_update(&ctx, &keys, 1_000).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Rejected { wait: 800 });

        let records = store.get_multi(&keys.record_keys()).await.unwrap();
        assert_eq!(records.get(&keys.allowance), Some(&500));
        assert_eq!(records.get(&keys.timestamp), Some(&1_000_800));
        assert_eq!(store.ttl(&keys.allowance), Some(Duration::from_secs(9)));
        assert_eq!(store.ttl(&keys.timestamp), Some(Duration::from_secs(9)));
    }

    #[tokio::test]
    async fn test_missing_timestamp_is_claimed_with_add() {
        let (clock, store, keys) = setup();
        let ctx = context(&store, &clock);
        store.set(&keys.allowance, 4_000, 8).await.unwrap();

        let outcome = OptimisticUpdate.attempt_update(&ctx, &keys, 1_000).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Accepted);

        let records = store.get_multi(&keys.record_keys()).await.unwrap();
        assert_eq!(records.get(&keys.allowance), Some(&3_000));
        assert_eq!(records.get(&keys.timestamp), Some(&1_000_000));
    }

    #[tokio::test]
    async fn test_overfull_allowance_is_capped() {
        let (clock, store, keys) = setup();
        let ctx = context(&store, &clock);
        store.set(&keys.allowance, 9_000, 8).await.unwrap();
        store.set(&keys.timestamp, 1_000_000, 8).await.unwrap();

        let outcome = OptimisticUpdate.attempt_update(&ctx, &keys, 1_000).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Accepted);

        let records = store.get_multi(&keys.record_keys()).await.unwrap();
        assert_eq!(records.get(&keys.allowance), Some(&4_000));
    }
}
