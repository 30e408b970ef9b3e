//! In-process store with memcached semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{KeyValueStore, StoreError, Versioned};
use crate::clock::{Clock, SystemClock};

/// Longest key memcached accepts.
const MAX_KEY_LENGTH: usize = 250;

#[derive(Debug, Clone, Copy)]
struct Record {
    value: i64,
    cas: u64,
    /// Absolute expiry since the epoch, `None` for no expiry
    expires_at: Option<Duration>,
}

impl Record {
    fn is_live(&self, now: Duration) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// A store kept in a concurrent map.
///
/// Expiry is evaluated lazily against the injected clock, so a
/// [`ManualClock`](crate::clock::ManualClock) can expire records without
/// waiting. Each operation holds the shard lock of its key for its whole
/// duration, which makes it atomic.
pub struct MemoryStore {
    records: DashMap<String, Record>,
    next_cas: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            next_cas: AtomicU64::new(1),
            clock,
        }
    }

    /// Remaining time to live of a key, `None` if absent or without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let record = self.records.get(key)?;
        if !record.is_live(now) {
            return None;
        }
        record.expires_at.map(|at| at - now)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.records.iter().filter(|r| r.is_live(now)).count()
    }

    /// Whether the store holds no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, value: i64, ttl: u64, now: Duration) -> Record {
        Record {
            value,
            cas: self.next_cas.fetch_add(1, Ordering::Relaxed),
            expires_at: expiry(ttl, now),
        }
    }

    /// Apply `f` to a live record, treating expired records as absent.
    fn update_live<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Record) -> T,
    ) -> Result<Option<T>, StoreError> {
        validate_key(key)?;
        let now = self.clock.now();
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    Ok(Some(f(entry.get_mut())))
                } else {
                    entry.remove();
                    Ok(None)
                }
            }
            Entry::Vacant(_) => Ok(None),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expiry(ttl: u64, now: Duration) -> Option<Duration> {
    if ttl == 0 {
        return None;
    }
    // Past the representable range means never
    now.checked_add(Duration::from_secs(ttl))
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key.len() > MAX_KEY_LENGTH
        || key.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn add(&self, key: &str, value: i64, ttl: u64) -> Result<bool, StoreError> {
        validate_key(key)?;
        let now = self.clock.now();
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    return Ok(false);
                }
                entry.insert(self.record(value, ttl, now));
            }
            Entry::Vacant(entry) => {
                entry.insert(self.record(value, ttl, now));
            }
        }
        Ok(true)
    }

    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, i64>, StoreError> {
        let now = self.clock.now();
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            validate_key(key)?;
            if let Some(record) = self.records.get(key) {
                if record.is_live(now) {
                    found.insert(key.clone(), record.value);
                }
            }
        }
        Ok(found)
    }

    async fn gets(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.update_live(key, |record| Versioned {
            value: record.value,
            cas: record.cas,
        })
    }

    async fn cas(&self, key: &str, value: i64, ttl: u64, cas: u64) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let fresh = self.record(value, ttl, now);
        let stored = self.update_live(key, |record| {
            if record.cas != cas {
                return false;
            }
            *record = fresh;
            true
        })?;
        Ok(stored.unwrap_or(false))
    }

    async fn incr(&self, key: &str, delta: u64) -> Result<Option<i64>, StoreError> {
        let cas = self.next_cas.fetch_add(1, Ordering::Relaxed);
        self.update_live(key, |record| {
            record.value = record.value.saturating_add(delta.min(i64::MAX as u64) as i64);
            record.cas = cas;
            record.value
        })
    }

    async fn decr(&self, key: &str, delta: u64) -> Result<Option<i64>, StoreError> {
        let cas = self.next_cas.fetch_add(1, Ordering::Relaxed);
        self.update_live(key, |record| {
            let delta = delta.min(i64::MAX as u64) as i64;
            record.value = record.value.saturating_sub(delta).max(0);
            record.cas = cas;
            record.value
        })
    }

    async fn set(&self, key: &str, value: i64, ttl: u64) -> Result<(), StoreError> {
        validate_key(key)?;
        let now = self.clock.now();
        self.records
            .insert(key.to_string(), self.record(value, ttl, now));
        Ok(())
    }

    async fn touch(&self, key: &str, ttl: u64) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let touched = self.update_live(key, |record| {
            record.expires_at = expiry(ttl, now);
        })?;
        Ok(touched.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let now = self.clock.now();
        Ok(self
            .records
            .remove(key)
            .map_or(false, |(_, record)| record.is_live(now)))
    }
}
