//! Contended updates serialized by an advisory lock record.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::backoff::{Backoff, Retry};
use super::keys::BucketKeys;
use super::strategy::{settle, UpdateContext, UpdateOutcome, UpdateStrategy};
use crate::error::{LimiterError, Result};

/// Read-modify-write while holding `{key}:lock`.
///
/// The lock is created with `add` and carries its own TTL, so a holder that
/// dies only blocks the key until the lock expires. Updates to one key are
/// serialized, which keeps the allowance exact under contention.
///
/// Release is an unconditional `delete`. A holder whose update outlives the
/// lock TTL deletes the lock of whoever acquired it next, letting a third
/// caller in alongside it; keep `lock_timeout_ms` well above the store
/// round-trip time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockingUpdate;

#[async_trait]
impl UpdateStrategy for LockingUpdate {
    async fn attempt_update(
        &self,
        ctx: &UpdateContext<'_>,
        keys: &BucketKeys,
        to_consume: i64,
    ) -> Result<UpdateOutcome> {
        acquire(ctx, keys).await?;
        let result = update_locked(ctx, keys, to_consume).await;
        release(ctx, keys).await;
        result
    }
}

async fn acquire(ctx: &UpdateContext<'_>, keys: &BucketKeys) -> Result<()> {
    let lock_ttl = (ctx.retry.timeout.as_secs_f64().ceil() as u64).max(1);
    let mut retry = Retry::start(ctx.retry, ctx.clock);

    loop {
        if ctx.store.add(&keys.lock, 1, lock_ttl).await? {
            if retry.attempts() > 1 {
                debug!(key = %keys, attempts = retry.attempts(), "Acquired contended lock");
            }
            return Ok(());
        }

        if !retry.backoff(Backoff::Exponential).await {
            warn!(key = %keys, attempts = retry.attempts(), "Gave up acquiring lock");
            return Err(LimiterError::LockTimeout {
                key: keys.base.clone(),
                attempts: retry.attempts(),
            });
        }
    }
}

async fn update_locked(
    ctx: &UpdateContext<'_>,
    keys: &BucketKeys,
    to_consume: i64,
) -> Result<UpdateOutcome> {
    let records = ctx.store.get_multi(&keys.record_keys()).await?;
    let decision = ctx.quota.apply(
        records.get(&keys.allowance).copied(),
        records.get(&keys.timestamp).copied(),
        ctx.now(),
        to_consume,
    );

    let (bucket, outcome) = settle(decision);
    let ttl = ctx.ttl_for(outcome);
    ctx.store.set(&keys.allowance, bucket.allowance, ttl).await?;
    ctx.store.set(&keys.timestamp, bucket.timestamp, ttl).await?;
    Ok(outcome)
}

/// Best effort: the lock expires on its own if this fails. Whoever holds
/// the lock record at this point loses it, even if it is no longer us.
async fn release(ctx: &UpdateContext<'_>, keys: &BucketKeys) {
    if let Err(e) = ctx.store.delete(&keys.lock).await {
        warn!(key = %keys, error = %e, "Failed to release lock");
    }
}
