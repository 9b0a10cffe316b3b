use std::{collections::HashMap, fmt::Debug, time::Duration};

use async_trait::async_trait;

use crate::error::Error;

/// Shared key-value store holding cache entries, locks and sync state.
///
/// Every method is a single-key atomic operation; callers never rely on
/// multi-key transactions.
#[async_trait]
pub trait CacheStore: Debug + Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), Error>;

    async fn del(&self, key: &str) -> Result<(), Error>;

    /// Stores `value` only if `key` is absent. Returns whether it was set.
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Error>;

    /// Deletes `key` only while it still holds `value`.
    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, Error>;

    /// Restarts the TTL of `key` only while it still holds `value`.
    async fn expire_if_eq(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Error>;

    /// Applies every `(field, delta)` increment to the hash at `key` and
    /// moves its `cursor` field from `expected` to `next`, as one atomic
    /// write. When the cursor no longer reads `expected` (`None`: field
    /// absent) nothing is written and `false` comes back.
    async fn hincr_advance(
        &self,
        key: &str,
        increments: &[(String, u64)],
        cursor: &str,
        expected: Option<u64>,
        next: u64,
    ) -> Result<bool, Error>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<u64>, Error>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, u64>, Error>;
}
