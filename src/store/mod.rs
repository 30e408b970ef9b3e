//! Interface to the shared key-value store that holds all bucket state.
//!
//! Every operation is individually atomic; nothing is atomic across keys.
//! Values are integers and TTLs are whole seconds, with `0` meaning the
//! record never expires.

mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

/// Errors reported by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key is not valid in the store's key grammar
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    /// The store could not be reached or refused the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A value together with the version token needed to conditionally replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Versioned {
    pub value: i64,
    pub cas: u64,
}

/// Memcached-style primitives the limiter builds on.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store `value` only if `key` is absent. Returns whether it was stored.
    async fn add(&self, key: &str, value: i64, ttl: u64) -> Result<bool, StoreError>;

    /// Fetch several keys at once. Missing keys are absent from the map.
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, i64>, StoreError>;

    /// Fetch a value with its version token.
    async fn gets(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Replace `key` only if its version is still `cas`. Returns whether it was stored.
    async fn cas(&self, key: &str, value: i64, ttl: u64, cas: u64) -> Result<bool, StoreError>;

    /// Add `delta`, returning the new value, or `None` if the key is absent.
    /// Does not change the TTL.
    async fn incr(&self, key: &str, delta: u64) -> Result<Option<i64>, StoreError>;

    /// Subtract `delta` without going below zero, returning the new value,
    /// or `None` if the key is absent. Does not change the TTL.
    async fn decr(&self, key: &str, delta: u64) -> Result<Option<i64>, StoreError>;

    /// Store `value` unconditionally.
    async fn set(&self, key: &str, value: i64, ttl: u64) -> Result<(), StoreError>;

    /// Reset the TTL of an existing key. Returns whether the key existed.
    async fn touch(&self, key: &str, ttl: u64) -> Result<bool, StoreError>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}
