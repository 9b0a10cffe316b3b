use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{configuration::RefreshPolicy, types::Row};

/// Result set as persisted in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub rows: Vec<Row>,
    /// Age reference for freshness: when the upstream execution finished,
    /// not when it was fetched.
    pub cached_at: DateTime<Utc>,
    pub source_execution_ended_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Whole seconds since `cached_at`, never negative.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.cached_at).num_seconds().max(0)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, fresh_window: Duration) -> bool {
        let window = i64::try_from(fresh_window.as_secs()).unwrap_or(i64::MAX);
        self.age_seconds(now) < window
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Cache,
    CacheAfterLockWait,
    DuneFreshExecution,
    /// Another instance is refreshing; its result was not ready in time
    StaleDuringRefresh,
    StaleOnFail,
    StaleOnTimeout,
    StaleOnCrash,
}

impl DataSource {
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            DataSource::StaleDuringRefresh
                | DataSource::StaleOnFail
                | DataSource::StaleOnTimeout
                | DataSource::StaleOnCrash
        )
    }
}

/// What `get_data` hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedData {
    pub rows: Vec<Row>,
    pub cached_at: DateTime<Utc>,
    pub age_seconds: i64,
    pub next_refresh_seconds: i64,
    pub source: DataSource,
    pub warning: Option<String>,
}

impl CachedData {
    pub fn from_entry(
        entry: CacheEntry,
        now: DateTime<Utc>,
        policy: &RefreshPolicy,
        source: DataSource,
    ) -> CachedData {
        let age_seconds = entry.age_seconds(now);
        let next_refresh_seconds = if source.is_stale() {
            i64::try_from(policy.stale_retry.as_secs()).unwrap_or(i64::MAX)
        } else {
            let window =
                i64::try_from(policy.fresh_window.as_secs()).unwrap_or(i64::MAX);
            (window - age_seconds).max(0)
        };

        CachedData {
            rows: entry.rows,
            cached_at: entry.cached_at,
            age_seconds,
            next_refresh_seconds,
            source,
            warning: None,
        }
    }

    pub fn with_warning(mut self, warning: String) -> CachedData {
        self.warning = Some(warning);
        self
    }
}
