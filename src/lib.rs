//! Hivemind Limiter - Distributed Sliding-Window Rate Limiting
//!
//! This crate decides whether work tagged with a key may proceed under a
//! quota of `max_requests` per `period`, and if not, how long to wait. All
//! coordination state lives in a shared key-value store with memcached-style
//! atomic primitives, so any number of independent processes can enforce one
//! quota without a central coordinator.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LimiterConfig;
pub use error::{LimiterError, Result};
pub use ratelimit::{Limiter, Outcome};
pub use store::{KeyValueStore, MemoryStore, StoreError, Versioned};
