//! Sliding-window rate limiting over a shared store.

mod allowance;
mod backoff;
mod fixed_point;
mod keys;
mod limiter;
mod locking;
mod optimistic;
mod strategy;

pub use allowance::{Bucket, Decision, Quota};
pub use backoff::{Backoff, RetryPolicy};
pub use fixed_point::{decode, encode, SCALE};
pub use keys::BucketKeys;
pub use limiter::{Limiter, Outcome};
pub use locking::LockingUpdate;
pub use optimistic::OptimisticUpdate;
pub use strategy::{UpdateContext, UpdateOutcome, UpdateStrategy};
