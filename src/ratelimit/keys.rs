//! Store key generation for a bucket.

use crate::error::{LimiterError, Result};

/// The store keys that together hold one bucket.
///
/// Keys are formatted as `{prefix}:{unique_key}:{suffix}`, with characters the
/// memcached key grammar forbids stripped from the unique key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKeys {
    /// The sanitized `{prefix}:{unique_key}` base
    pub base: String,
    pub allowance: String,
    pub timestamp: String,
    pub lock: String,
}

impl BucketKeys {
    /// Build the keys for `unique_key` under `prefix`.
    ///
    /// Fails when both parts are blank, since the store would reject the result.
    pub fn new(prefix: &str, unique_key: &str) -> Result<Self> {
        let unique = sanitize(unique_key);
        if prefix.is_empty() && unique.is_empty() {
            return Err(LimiterError::InvalidKey);
        }

        let base = format!("{}:{}", prefix, unique);
        Ok(Self {
            allowance: format!("{}:allowance", base),
            timestamp: format!("{}:timestamp", base),
            lock: format!("{}:lock", base),
            base,
        })
    }

    /// The allowance and timestamp keys, in that order.
    pub fn record_keys(&self) -> [String; 2] {
        [self.allowance.clone(), self.timestamp.clone()]
    }
}

impl std::fmt::Display for BucketKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base)
    }
}

fn sanitize(unique_key: &str) -> String {
    unique_key
        .chars()
        .filter(|c| !(c.is_control() || c.is_whitespace()))
        .collect()
}
