use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};

use crate::{error::Error, provider::CacheStore};

const DEL_IF_EQ: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

const PEXPIRE_IF_EQ: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

// ARGV: cursor field, expected cursor ('' = absent), next cursor,
// then field/delta pairs
const HINCR_ADVANCE: &str = r"
local current = redis.call('HGET', KEYS[1], ARGV[1]) or ''
if current ~= ARGV[2] then
    return 0
end
for i = 4, #ARGV, 2 do
    redis.call('HINCRBY', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
return 1
";

/// Redis-backed store shared by every instance of the service.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    compare_del: Script,
    compare_expire: Script,
    advance: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("redis", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<RedisStore, Error> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;

        Ok(RedisStore {
            redis,
            compare_del: Script::new(DEL_IF_EQ),
            compare_expire: Script::new(PEXPIRE_IF_EQ),
            advance: Script::new(HINCR_ADVANCE),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let value: Option<String> = self.redis.clone().get(key).await?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);

        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }

        let _: () = cmd.query_async(&mut self.redis.clone()).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        let _: () = self.redis.clone().del(key).await?;
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut self.redis.clone())
            .await?;

        Ok(reply.is_some())
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, Error> {
        let deleted: i64 = self
            .compare_del
            .key(key)
            .arg(value)
            .invoke_async(&mut self.redis.clone())
            .await?;

        Ok(deleted == 1)
    }

    async fn expire_if_eq(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let updated: i64 = self
            .compare_expire
            .key(key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut self.redis.clone())
            .await?;

        Ok(updated == 1)
    }

    async fn hincr_advance(
        &self,
        key: &str,
        increments: &[(String, u64)],
        cursor: &str,
        expected: Option<u64>,
        next: u64,
    ) -> Result<bool, Error> {
        let expected = expected.map(|block| block.to_string()).unwrap_or_default();

        let mut invocation = self.advance.key(key);
        invocation.arg(cursor).arg(expected).arg(next);
        for (field, delta) in increments {
            invocation.arg(field).arg(*delta);
        }

        let applied: i64 =
            invocation.invoke_async(&mut self.redis.clone()).await?;
        Ok(applied == 1)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<u64>, Error> {
        let value: Option<u64> = self.redis.clone().hget(key, field).await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, u64>, Error> {
        let values: HashMap<String, u64> =
            self.redis.clone().hgetall(key).await?;
        Ok(values)
    }
}
