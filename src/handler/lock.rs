use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{error::Error, provider::CacheStore};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

/// Ownership of one acquired lock. The token tells this holder apart from
/// whoever takes the key after it expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    key: String,
    token: String,
}

impl HeldLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

fn new_token() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
    )
}

/// Store-backed mutual exclusion with a TTL safety net.
///
/// At most one live lock exists per key because acquisition is a single
/// `SET NX` on the store. Not reentrant: a holder acquiring its own key
/// again gets `None`. Holders always release explicitly; the TTL only
/// covers holders that died. Release and extension only touch the key
/// while it still carries the holder's token.
#[derive(Debug, Clone)]
pub struct LockManager {
    store: Arc<dyn CacheStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        LockManager { store }
    }

    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<HeldLock>, Error> {
        let token = new_token();
        let acquired = self.store.set_nx_ex(key, &token, ttl).await?;
        debug!(key, acquired, "lock acquire");

        Ok(acquired.then(|| HeldLock {
            key: key.to_owned(),
            token,
        }))
    }

    pub async fn is_held(&self, key: &str) -> Result<bool, Error> {
        Ok(self.store.get(key).await?.is_some())
    }

    /// Restarts the TTL of a lock still owned by `lock`. `false` means it
    /// expired and may belong to someone else now.
    pub async fn extend(
        &self,
        lock: &HeldLock,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let extended =
            self.store.expire_if_eq(&lock.key, &lock.token, ttl).await?;
        if !extended {
            warn!(key = %lock.key, "lock lost before extension");
        }
        Ok(extended)
    }

    /// Idempotent; a lock that expired or changed hands is left alone.
    pub async fn release(&self, lock: &HeldLock) -> Result<(), Error> {
        let released = self.store.del_if_eq(&lock.key, &lock.token).await?;
        debug!(key = %lock.key, released, "lock release");
        Ok(())
    }
}
