//! Serve-from-cache / refresh-under-lock cycle in front of the analytics
//! provider.
//!
//! A request is answered from the shared store while the entry is inside
//! the fresh window. Past it, exactly one request cluster-wide (the lock
//! holder) runs an upstream execution; concurrent requests wait a bounded
//! time for its result and otherwise get stale data or a busy signal. Any
//! failure of the refresh falls back to the previous entry when one exists.

use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::{
    cache_keys,
    clock::Clock,
    configuration::RefreshPolicy,
    error::Error,
    handler::{HeldLock, LockManager},
    model::{CacheEntry, CachedData, DataSource},
    provider::{dune::poll_execution, AnalyticsApi, CacheStore},
};

/// A cached query result: where it lives in the store and which upstream
/// query produces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTarget {
    pub key: String,
    pub query_id: u64,
}

#[derive(Debug, Clone)]
pub struct CacheOrchestrator {
    store: Arc<dyn CacheStore>,
    api: Arc<dyn AnalyticsApi>,
    clock: Arc<dyn Clock>,
    locks: LockManager,
}

impl CacheOrchestrator {
    pub fn new(
        store: Arc<dyn CacheStore>,
        api: Arc<dyn AnalyticsApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = LockManager::new(store.clone());
        CacheOrchestrator {
            store,
            api,
            clock,
            locks,
        }
    }

    pub async fn get_data(
        &self,
        target: &CacheTarget,
        policy: &RefreshPolicy,
        force: bool,
    ) -> Result<CachedData, Error> {
        let now = self.clock.now();
        let cached = match self.read_entry(&target.key).await? {
            Some(entry) if !force && entry.is_fresh(now, policy.fresh_window) => {
                debug!(key = %target.key, "cache hit");
                return Ok(CachedData::from_entry(
                    entry,
                    now,
                    policy,
                    DataSource::Cache,
                ));
            },
            cached => cached,
        };

        let lock_key = cache_keys::refresh_lock(&target.key);
        let Some(lock) = self.locks.acquire(&lock_key, policy.lock_ttl).await?
        else {
            info!(key = %target.key, "refresh in progress elsewhere, waiting");
            return self.wait_for_refresh(target, cached, policy).await;
        };

        info!(key = %target.key, force, stale = cached.is_some(), "refreshing");
        self.refresh_under_lock(target, lock, cached, policy, force).await
    }

    async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, Error> {
        let Some(value) = self.store.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<CacheEntry>(&value) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(key, "unreadable cache entry, treating as miss: {}", e);
                Ok(None)
            },
        }
    }

    /// Single fixed-delay re-read. Enough for a handful of concurrent
    /// clients; high fan-out would want a notification instead.
    async fn wait_for_refresh(
        &self,
        target: &CacheTarget,
        previous: Option<CacheEntry>,
        policy: &RefreshPolicy,
    ) -> Result<CachedData, Error> {
        tokio::time::sleep(policy.lock_wait).await;

        let now = self.clock.now();
        let previous_at = previous.map(|entry| entry.cached_at);

        match self.read_entry(&target.key).await? {
            Some(entry)
                if entry.is_fresh(now, policy.fresh_window)
                    || previous_at.map_or(true, |at| entry.cached_at > at) =>
            {
                Ok(CachedData::from_entry(
                    entry,
                    now,
                    policy,
                    DataSource::CacheAfterLockWait,
                ))
            },
            Some(entry) => {
                warn!(key = %target.key, "refresh still running, serving stale data");
                Ok(CachedData::from_entry(
                    entry,
                    now,
                    policy,
                    DataSource::StaleDuringRefresh,
                )
                .with_warning(String::from(
                    "Refresh in progress, serving stale data",
                )))
            },
            None => Err(Error::LockBusyError {
                key: target.key.to_owned(),
                retry_after: policy.lock_wait.as_secs().max(1),
            }),
        }
    }

    async fn refresh_under_lock(
        &self,
        target: &CacheTarget,
        lock: HeldLock,
        cached: Option<CacheEntry>,
        policy: &RefreshPolicy,
        force: bool,
    ) -> Result<CachedData, Error> {
        let this = self.clone();
        let task_target = target.clone();
        let task_policy = policy.clone();

        // Detached: a client disconnect must neither abort the upstream
        // execution nor skip the release.
        let handle = tokio::spawn(async move {
            let outcome =
                AssertUnwindSafe(this.refresh(&task_target, &task_policy, force))
                    .catch_unwind()
                    .await;

            if let Err(e) = this.locks.release(&lock).await {
                warn!(key = lock.key(), "lock release failed, left to ttl: {}", e);
            }

            match outcome {
                Ok(result) => result,
                Err(_) => {
                    Err(Error::TaskError(String::from("refresh task panicked")))
                },
            }
        });

        let outcome = match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::from(e)),
        };
        let now = self.clock.now();

        match outcome {
            Ok(entry) => Ok(CachedData::from_entry(
                entry,
                now,
                policy,
                DataSource::DuneFreshExecution,
            )),
            Err(err) => fallback(target, cached, err, now, policy),
        }
    }

    async fn refresh(
        &self,
        target: &CacheTarget,
        policy: &RefreshPolicy,
        force: bool,
    ) -> Result<CacheEntry, Error> {
        let execution_key = cache_keys::pending_execution(&target.key);

        // a forced refresh always pays for a new execution
        let pending = if force {
            None
        } else {
            self.store.get(&execution_key).await?
        };

        let execution_id = match pending {
            Some(execution_id) => {
                info!(key = %target.key, %execution_id, "joining execution in flight");
                execution_id
            },
            None => {
                let execution_id = self.api.execute(target.query_id).await?;
                if let Err(e) = self
                    .store
                    .set(&execution_key, &execution_id, Some(policy.lock_ttl))
                    .await
                {
                    warn!(%execution_id, "unable to share execution id: {}", e);
                }
                execution_id
            },
        };

        let completed =
            match poll_execution(self.api.as_ref(), &execution_id, policy).await {
                // still running upstream; the next refresher picks it up
                Err(err @ Error::UpstreamTimeoutError { .. }) => return Err(err),
                result => {
                    if let Err(e) = self.store.del(&execution_key).await {
                        warn!(%execution_id, "unable to clear execution id: {}", e);
                    }
                    result?
                },
            };

        let entry = CacheEntry {
            rows: completed.rows,
            cached_at: completed.ended_at.unwrap_or_else(|| self.clock.now()),
            source_execution_ended_at: completed.ended_at,
        };

        let value = serde_json::to_string(&entry)?;
        if let Err(e) = self.store.set(&target.key, &value, None).await {
            error!(key = %target.key, "fresh rows not cached: {}", e);
        }

        Ok(entry)
    }
}

fn fallback(
    target: &CacheTarget,
    cached: Option<CacheEntry>,
    err: Error,
    now: chrono::DateTime<chrono::Utc>,
    policy: &RefreshPolicy,
) -> Result<CachedData, Error> {
    let source = match &err {
        Error::UpstreamTimeoutError { .. } => DataSource::StaleOnTimeout,
        Error::UpstreamExecuteError(_) | Error::UpstreamStateError { .. } => {
            DataSource::StaleOnFail
        },
        _ => DataSource::StaleOnCrash,
    };

    match cached {
        Some(entry) => {
            warn!(key = %target.key, ?source, "refresh failed, serving stale data: {}", err);
            Ok(CachedData::from_entry(entry, now, policy, source)
                .with_warning(format!("Serving stale data: {}", err)))
        },
        None => {
            error!(key = %target.key, "refresh failed with nothing cached: {}", err);
            Err(err)
        },
    }
}
