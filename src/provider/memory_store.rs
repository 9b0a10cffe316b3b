use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{error::Error, provider::CacheStore};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, u64>),
}

/// A store entry with optional expiration time
#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// In-process store with per-key TTL.
///
/// Only coordinates tasks inside one process; multi-instance deployments
/// need `RedisStore`. Expiry follows the tokio clock so paused-time tests
/// can drive it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Remove all expired entries from the store
    pub async fn cleanup_expired(&self) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
    }
}

fn wrong_type(key: &str) -> Error {
    Error::StoreError(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

fn live_str<'a>(
    entries: &'a HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a str> {
    match entries.get(key) {
        Some(entry) if entry.is_live(now) => match &entry.value {
            Value::Str(value) => Some(value.as_str()),
            Value::Hash(_) => None,
        },
        _ => None,
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.value {
                Value::Str(value) => Ok(Some(value.to_owned())),
                Value::Hash(_) => Err(wrong_type(key)),
            },
            _ => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        if let Some(entry) = entries.get(key) {
            if entry.is_live(now) {
                return Ok(false);
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, Error> {
        let mut entries = self.entries.write().await;

        if live_str(&entries, key, Instant::now()) != Some(value) {
            return Ok(false);
        }

        entries.remove(key);
        Ok(true)
    }

    async fn expire_if_eq(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        if live_str(&entries, key, now) != Some(value) {
            return Ok(false);
        }

        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(true)
    }

    async fn hincr_advance(
        &self,
        key: &str,
        increments: &[(String, u64)],
        cursor: &str,
        expected: Option<u64>,
        next: u64,
    ) -> Result<bool, Error> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });

        match &mut entry.value {
            Value::Hash(hash) => {
                if hash.get(cursor).copied() != expected {
                    return Ok(false);
                }

                for (field, delta) in increments {
                    *hash.entry(field.to_owned()).or_insert(0) += delta;
                }
                hash.insert(cursor.to_owned(), next);
                Ok(true)
            },
            Value::Str(_) => Err(wrong_type(key)),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<u64>, Error> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.value {
                Value::Hash(hash) => Ok(hash.get(field).copied()),
                Value::Str(_) => Err(wrong_type(key)),
            },
            _ => Ok(None),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, u64>, Error> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.value {
                Value::Hash(hash) => Ok(hash.clone()),
                Value::Str(_) => Err(wrong_type(key)),
            },
            _ => Ok(HashMap::new()),
        }
    }
}
