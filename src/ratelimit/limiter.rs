//! The public rate limiter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::allowance::{Decision, Quota};
use super::backoff::RetryPolicy;
use super::fixed_point::{decode, decode_duration, encode};
use super::keys::BucketKeys;
use super::locking::LockingUpdate;
use super::optimistic::OptimisticUpdate;
use super::strategy::{fast_path, UpdateContext, UpdateOutcome, UpdateStrategy};
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::{LimiterError, Result};
use crate::store::KeyValueStore;

/// Result of a single rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The request was admitted and its allowance consumed
    Admitted,
    /// The request was rejected; retrying after this long would succeed if
    /// nobody else consumes in the meantime
    Wait(Duration),
    /// The request is larger than the whole quota and can never be admitted
    Unsatisfiable,
}

impl Outcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Outcome::Admitted)
    }

    /// The wait, if the request was rejected with one.
    pub fn wait(&self) -> Option<Duration> {
        match self {
            Outcome::Wait(wait) => Some(*wait),
            _ => None,
        }
    }
}

/// A sliding-window rate limiter whose state lives entirely in a shared store.
///
/// The limiter itself is immutable, so one instance can be shared across
/// tasks behind an `Arc`, and independent instances in other processes
/// cooperate as long as they use the same store and configuration.
pub struct Limiter {
    config: LimiterConfig,
    quota: Quota,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    strategy: Box<dyn UpdateStrategy>,
}

impl Limiter {
    /// Create a limiter on the system clock.
    pub fn new(store: Arc<dyn KeyValueStore>, config: LimiterConfig) -> Result<Self> {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    /// Create a limiter on the given clock.
    pub fn with_clock(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: LimiterConfig,
    ) -> Result<Self> {
        config.validate()?;

        let quota = Quota {
            max: encode(config.max_requests),
            period: encode(config.period_secs),
        };
        if quota.max <= 0 || quota.period <= 0 {
            return Err(LimiterError::Config(
                "max_requests and period_secs must be at least 0.001".to_string(),
            ));
        }

        let strategy: Box<dyn UpdateStrategy> = if config.locking {
            Box::new(LockingUpdate)
        } else {
            Box::new(OptimisticUpdate)
        };

        debug!(
            key_prefix = %config.key_prefix,
            max_requests = config.max_requests,
            period_secs = config.period_secs,
            locking = config.locking,
            "Limiter initialized"
        );

        Ok(Self {
            config,
            quota,
            store,
            clock,
            strategy,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Try to consume `to_consume` from the bucket of `unique_key`.
    ///
    /// Non-positive amounts are admitted and amounts above `max_requests` are
    /// unsatisfiable, both without touching the store. Fails with
    /// [`LimiterError::LockTimeout`] or [`LimiterError::Contention`] when the
    /// contended update cannot complete within its bounds.
    pub async fn exceeded(&self, unique_key: &str, to_consume: f64) -> Result<Outcome> {
        if !to_consume.is_finite() {
            return Err(LimiterError::InvalidAmount(to_consume));
        }
        let consume = encode(to_consume);
        if consume <= 0 {
            return Ok(Outcome::Admitted);
        }
        if consume > self.quota.max {
            debug!(
                key = %unique_key,
                to_consume = to_consume,
                max_requests = self.config.max_requests,
                "Request can never fit the quota"
            );
            return Ok(Outcome::Unsatisfiable);
        }

        let keys = BucketKeys::new(&self.config.key_prefix, unique_key)?;
        trace!(key = %keys, to_consume = to_consume, "Checking rate limit");

        let ctx = self.context();
        if fast_path(&ctx, &keys, consume).await? {
            return Ok(Outcome::Admitted);
        }

        match self.strategy.attempt_update(&ctx, &keys, consume).await? {
            UpdateOutcome::Accepted => Ok(Outcome::Admitted),
            UpdateOutcome::Rejected { wait } => {
                let wait = decode_duration(wait);
                debug!(key = %keys, wait = ?wait, "Rate limit exceeded");
                Ok(Outcome::Wait(wait))
            }
        }
    }

    /// Wait until `to_consume` can be taken from `unique_key`, then run `f`.
    ///
    /// Sleeps out each returned wait and checks again. Gives up with
    /// [`LimiterError::WaitTimeout`] as soon as the next wait would overrun
    /// `wait_timeout`, and with [`LimiterError::Unsatisfiable`] immediately.
    /// `f` only runs once the request is admitted.
    pub async fn without_exceeding<F, Fut, T>(
        &self,
        unique_key: &str,
        to_consume: f64,
        wait_timeout: Option<Duration>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let started = self.clock.now();

        loop {
            match self.exceeded(unique_key, to_consume).await? {
                Outcome::Admitted => return Ok(f().await),
                Outcome::Unsatisfiable => {
                    return Err(LimiterError::Unsatisfiable {
                        key: unique_key.to_string(),
                        requested: to_consume,
                        max_requests: self.config.max_requests,
                    });
                }
                Outcome::Wait(wait) => {
                    let waited = self.clock.now().saturating_sub(started);
                    if let Some(timeout) = wait_timeout {
                        if waited + wait > timeout {
                            debug!(key = %unique_key, waited = ?waited, "Giving up waiting for rate limit");
                            return Err(LimiterError::WaitTimeout {
                                key: unique_key.to_string(),
                                waited,
                            });
                        }
                    }
                    trace!(key = %unique_key, wait = ?wait, "Waiting for rate limit");
                    self.clock.sleep(wait).await;
                }
            }
        }
    }

    /// The allowance `unique_key` would have right now, without consuming it.
    pub async fn remaining(&self, unique_key: &str) -> Result<f64> {
        let keys = BucketKeys::new(&self.config.key_prefix, unique_key)?;
        let ctx = self.context();
        let records = self.store.get_multi(&keys.record_keys()).await?;

        let allowance = match self.quota.apply(
            records.get(&keys.allowance).copied(),
            records.get(&keys.timestamp).copied(),
            ctx.now(),
            0,
        ) {
            Decision::Accept { bucket } | Decision::Reject { bucket, .. } => bucket.allowance,
        };
        Ok(decode(allowance))
    }

    fn context(&self) -> UpdateContext<'_> {
        UpdateContext {
            store: self.store.as_ref(),
            clock: self.clock.as_ref(),
            quota: self.quota,
            period_ttl: self.config.period_ttl(),
            retry: RetryPolicy {
                timeout: self.config.lock_timeout(),
                max_attempts: self.config.max_attempts,
                base: self.config.backoff_base(),
            },
        }
    }
}
