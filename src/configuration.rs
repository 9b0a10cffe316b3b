use std::{env, fs, ops::Deref, path::Path, sync::Arc, time::Duration};

use anyhow::Context as _;
use tracing::{info, warn};

use crate::{
    cache_keys,
    clock::{Clock, SystemClock},
    error::Error,
    handler::{CacheOrchestrator, CacheTarget, EventSyncer},
    provider::{
        AnalyticsApi, CacheStore, ChainRpc, DuneClient, MemoryStore,
        RedisStore, RpcClient,
    },
};

const DEFAULT_DUNE_API_URL: &str = "https://api.dune.com/api/v1/";
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct AppState<T>(Arc<T>);

impl<T> AppState<T> {
    pub fn new(state: T) -> AppState<T> {
        AppState(Arc::new(state))
    }
}

impl<T> Clone for AppState<T> {
    fn clone(&self) -> AppState<T> {
        AppState(Arc::clone(&self.0))
    }
}

impl<T> Deref for AppState<T> {
    type Target = Arc<T>;

    fn deref(&self) -> &Arc<T> {
        &self.0
    }
}

#[derive(Debug)]
pub struct State {
    pub config: Config,
    pub store: Arc<dyn CacheStore>,
    pub orchestrator: CacheOrchestrator,
    pub syncer: Option<EventSyncer>,
}

impl State {
    pub async fn new(config: Config) -> Result<State, Error> {
        let store: Arc<dyn CacheStore> = match &config.redis_url {
            Some(url) => {
                let store = RedisStore::connect(url)
                    .await
                    .context("unable to connect to redis")?;
                Arc::new(store)
            },
            None => {
                warn!("REDIS_URL not set, using in-process store");
                let store = Arc::new(MemoryStore::new());
                let sweeper = store.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                    loop {
                        interval.tick().await;
                        sweeper.cleanup_expired().await;
                    }
                });
                store
            },
        };

        if config.dune_api_key.is_none() {
            warn!("DUNE_API_KEY missing, /cache will answer with 500");
        }

        let api: Arc<dyn AnalyticsApi> = Arc::new(DuneClient::new(&config)?);
        let rpc: Option<Arc<dyn ChainRpc>> = match &config.sync {
            Some(sync) => Some(Arc::new(RpcClient::new(
                &sync.rpc_url,
                config.timeout,
            )?)),
            None => {
                info!("RPC_URL not set, cancellation sync disabled");
                None
            },
        };

        Ok(Self::with_parts(config, store, api, rpc, Arc::new(SystemClock)))
    }

    pub fn with_parts(
        config: Config,
        store: Arc<dyn CacheStore>,
        api: Arc<dyn AnalyticsApi>,
        rpc: Option<Arc<dyn ChainRpc>>,
        clock: Arc<dyn Clock>,
    ) -> State {
        let orchestrator = CacheOrchestrator::new(store.clone(), api, clock);
        let syncer = match (rpc, &config.sync) {
            (Some(rpc), Some(sync)) => {
                Some(EventSyncer::new(store.clone(), rpc, sync.clone()))
            },
            _ => None,
        };

        State {
            config,
            store,
            orchestrator,
            syncer,
        }
    }
}

/// Knobs of the serve-from-cache / refresh-under-lock cycle.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    /// Entries younger than this are served without touching the upstream
    pub fresh_window: Duration,
    /// Safety net for a refresher that never releases its lock
    pub lock_ttl: Duration,
    /// How long a request waits on another instance's refresh
    pub lock_wait: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    /// `next_refresh_seconds` handed out with stale data
    pub stale_retry: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            fresh_window: Duration::from_secs(1800),
            lock_ttl: Duration::from_secs(60),
            lock_wait: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 15,
            stale_retry: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub rpc_url: String,
    pub contract: String,
    /// topic0 of the tracked event
    pub topic: String,
    /// Position of the indexed bidder address inside `topics`
    pub bidder_topic_index: usize,
    pub start_block: u64,
    pub max_block_span: u64,
    pub chunk_delay: Duration,
    pub lock_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub timeout: u64,
    pub redis_url: Option<String>,
    pub dune_api_key: Option<String>,
    pub dune_api_url: String,
    pub dune_query_id: u64,
    pub cache_key: String,
    pub refresh_policy: RefreshPolicy,
    pub sync: Option<SyncConfig>,
}

impl Config {
    /// Builds the configuration from any key lookup; `get_configuration`
    /// feeds it the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.is_empty());
        let required = |key: &str| {
            var(key).ok_or_else(|| {
                Error::ConfigurationError(format!("{} is not set", key))
            })
        };

        let server_host =
            var("SERVER_HOST").unwrap_or_else(|| String::from("127.0.0.1"));
        let port = parse_or(&var, "PORT", 3000)?;
        let allowed_origins = var("ALLOWED_ORIGINS")
            .unwrap_or_else(|| String::from("*"))
            .split(',')
            .map(|item| item.trim().to_owned())
            .collect::<Vec<String>>();
        let timeout = parse_or(&var, "TIMEOUT", 30)?;

        let dune_api_url = var("DUNE_API_URL")
            .unwrap_or_else(|| String::from(DEFAULT_DUNE_API_URL));
        let dune_query_id = parse_required(&required, "DUNE_QUERY_ID")?;
        let cache_key = var("CACHE_KEY")
            .unwrap_or_else(|| String::from(cache_keys::BIDDERS));

        let defaults = RefreshPolicy::default();
        let refresh_policy = RefreshPolicy {
            fresh_window: Duration::from_secs(parse_or(
                &var,
                "FRESH_WINDOW_SECONDS",
                defaults.fresh_window.as_secs(),
            )?),
            lock_ttl: Duration::from_secs(parse_or(
                &var,
                "LOCK_TTL_SECONDS",
                defaults.lock_ttl.as_secs(),
            )?),
            lock_wait: Duration::from_millis(parse_or(
                &var,
                "LOCK_WAIT_MS",
                2000,
            )?),
            poll_interval: Duration::from_millis(parse_or(
                &var,
                "POLL_INTERVAL_MS",
                2000,
            )?),
            max_poll_attempts: parse_or(
                &var,
                "MAX_POLL_ATTEMPTS",
                defaults.max_poll_attempts,
            )?,
            stale_retry: Duration::from_secs(parse_or(
                &var,
                "STALE_RETRY_SECONDS",
                defaults.stale_retry.as_secs(),
            )?),
        };

        let poll_budget = refresh_policy
            .poll_interval
            .saturating_mul(refresh_policy.max_poll_attempts);
        if refresh_policy.lock_ttl <= poll_budget {
            warn!(
                lock_ttl = ?refresh_policy.lock_ttl,
                poll_budget = ?poll_budget,
                "lock ttl does not cover the polling budget"
            );
        }

        let sync = match var("RPC_URL") {
            Some(rpc_url) => Some(SyncConfig {
                rpc_url,
                contract: required("AUCTION_CONTRACT")?.to_lowercase(),
                topic: required("BID_CANCELED_TOPIC")?.to_lowercase(),
                bidder_topic_index: parse_or(&var, "BIDDER_TOPIC_INDEX", 2)?,
                start_block: parse_or(&var, "SYNC_START_BLOCK", 0)?,
                max_block_span: parse_or(
                    &var,
                    "SYNC_MAX_BLOCK_SPAN",
                    2_000_000,
                )?,
                chunk_delay: Duration::from_millis(parse_or(
                    &var,
                    "SYNC_CHUNK_DELAY_MS",
                    200,
                )?),
                lock_ttl: Duration::from_secs(parse_or(
                    &var,
                    "SYNC_LOCK_TTL_SECONDS",
                    60,
                )?),
            }),
            None => None,
        };

        if let Some(sync) = &sync {
            if sync.max_block_span == 0 {
                return Err(Error::ConfigurationError(String::from(
                    "SYNC_MAX_BLOCK_SPAN must be positive",
                )));
            }
            // the lock is extended once per chunk
            if sync.chunk_delay >= sync.lock_ttl {
                return Err(Error::ConfigurationError(String::from(
                    "SYNC_CHUNK_DELAY_MS must stay below SYNC_LOCK_TTL_SECONDS",
                )));
            }
        }

        Ok(Config {
            server_host,
            port,
            allowed_origins,
            timeout,
            redis_url: var("REDIS_URL"),
            dune_api_key: var("DUNE_API_KEY"),
            dune_api_url,
            dune_query_id,
            cache_key,
            refresh_policy,
            sync,
        })
    }

    pub fn cache_target(&self) -> CacheTarget {
        CacheTarget {
            key: self.cache_key.to_owned(),
            query_id: self.dune_query_id,
        }
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| {
            Error::ConfigurationError(format!("{}: {}", key, e))
        }),
        None => Ok(default),
    }
}

fn parse_required<T, F>(required: &F, key: &str) -> Result<T, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Result<String, Error>,
{
    required(key)?.trim().parse().map_err(|e: T::Err| {
        Error::ConfigurationError(format!("{}: {}", key, e))
    })
}

pub fn get_configuration() -> Result<Config, Error> {
    Config::from_lookup(|key| env::var(key).ok())
}

/// Exports `.env` and `auction-cache.conf` from the crate directory into the
/// process environment. Values already present in the environment win.
pub fn set_configuration() -> Result<(), Error> {
    let directory = env!("CARGO_MANIFEST_DIR");

    for file in [".env", "auction-cache.conf"] {
        let path = Path::new(directory).join(file);
        if !path.exists() {
            continue;
        }

        let config_string = fs::read_to_string(path)?;
        for (key, value) in parse_config_string(&config_string) {
            if env::var_os(&key).is_none() {
                env::set_var(key, value);
            }
        }
    }

    Ok(())
}

fn parse_config_string(config: &str) -> Vec<(String, String)> {
    config
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_owned(), value.trim().to_owned()))
        })
        .collect()
}
