//! Fakes shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::{
    cache_keys,
    clock::Clock,
    configuration::{Config, RefreshPolicy, SyncConfig},
    error::Error,
    provider::{
        rpc::to_quantity, AnalyticsApi, CacheStore, ChainRpc, MemoryStore,
    },
    types::{ExecutionResults, Log, ResultSet, Row},
};

pub const CONTRACT: &str = "0x04a5b8c32f9c38092b008a4939f1f91d550c4345";
pub const CANCEL_TOPIC: &str =
    "0x7f2c9b0e3b1a2f1c4e7d1f04b7e2c1c64c3bd1a8f2f2b0a6a1d2c9ee05b4a6f1";

pub fn bidder_row(address: &str, bid_count: u64) -> Row {
    match json!({ "bidder_address": address, "bid_count": bid_count }) {
        serde_json::Value::Object(row) => row,
        _ => unreachable!(),
    }
}

pub fn test_config() -> Config {
    Config {
        server_host: String::from("127.0.0.1"),
        port: 3000,
        allowed_origins: vec![String::from("*")],
        timeout: 5,
        redis_url: None,
        dune_api_key: Some(String::from("test-key")),
        dune_api_url: String::from("http://127.0.0.1:9/"),
        dune_query_id: 5123,
        cache_key: String::from(cache_keys::BIDDERS),
        refresh_policy: RefreshPolicy::default(),
        sync: None,
    }
}

pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        rpc_url: String::from("http://127.0.0.1:8545"),
        contract: String::from(CONTRACT),
        topic: String::from(CANCEL_TOPIC),
        bidder_topic_index: 2,
        start_block: 0,
        max_block_span: 1_000,
        chunk_delay: Duration::from_millis(200),
        lock_ttl: Duration::from_secs(60),
    }
}

/// A `BidCanceled(orderId, bidder)` log at `block` for `bidder`.
pub fn cancel_log(block: u64, bidder: &str) -> Log {
    let bidder = bidder.trim_start_matches("0x");

    Log {
        address: String::from(CONTRACT),
        topics: vec![
            String::from(CANCEL_TOPIC),
            format!("0x{:064x}", block),
            format!("0x{:0>64}", bidder),
        ],
        data: String::from("0x"),
        block_number: Some(to_quantity(block)),
        transaction_hash: Some(format!("0x{:064x}", block)),
        log_index: Some(String::from("0x0")),
        removed: false,
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FakeBehavior {
    /// Completes once `n` polls have been made in total
    CompleteOnPoll(usize),
    EndInState(&'static str),
    NeverFinish,
    FailOnExecute,
    Panic,
}

/// Analytics provider returning execution `42` with one bidder row.
#[derive(Debug)]
pub struct FakeAnalytics {
    pub execute_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
    behavior: Mutex<FakeBehavior>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
}

impl FakeAnalytics {
    pub fn new(behavior: FakeBehavior) -> Self {
        FakeAnalytics {
            execute_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            behavior: Mutex::new(behavior),
            ended_at: Mutex::new(None),
        }
    }

    pub fn set_behavior(&self, behavior: FakeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn set_ended_at(&self, ended_at: DateTime<Utc>) {
        *self.ended_at.lock().unwrap() = Some(ended_at);
    }

    fn behavior(&self) -> FakeBehavior {
        *self.behavior.lock().unwrap()
    }
}

#[async_trait]
impl AnalyticsApi for FakeAnalytics {
    async fn execute(&self, _query_id: u64) -> Result<String, Error> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);

        match self.behavior() {
            FakeBehavior::FailOnExecute => Err(Error::UpstreamExecuteError(
                String::from("status 402 Payment Required"),
            )),
            FakeBehavior::Panic => panic!("analytics client blew up"),
            _ => Ok(String::from("42")),
        }
    }

    async fn get_results(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionResults, Error> {
        let polls = self.poll_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let state = match self.behavior() {
            FakeBehavior::CompleteOnPoll(n) if polls >= n => {
                "QUERY_STATE_COMPLETED"
            },
            FakeBehavior::EndInState(state) => state,
            _ => "QUERY_STATE_EXECUTING",
        };

        let completed = state == "QUERY_STATE_COMPLETED";
        Ok(ExecutionResults {
            execution_id: Some(execution_id.to_owned()),
            state: state.to_owned(),
            execution_ended_at: if completed {
                *self.ended_at.lock().unwrap()
            } else {
                None
            },
            result: completed.then(|| ResultSet {
                rows: vec![bidder_row("0xAA", 3)],
            }),
        })
    }
}

#[derive(Debug)]
pub struct FakeChain {
    head: Mutex<u64>,
    logs: Mutex<Vec<Log>>,
    ranges: Mutex<Vec<(u64, u64)>>,
    fail_from: Mutex<Option<u64>>,
}

impl FakeChain {
    pub fn new(head: u64, logs: Vec<Log>) -> Self {
        FakeChain {
            head: Mutex::new(head),
            logs: Mutex::new(logs),
            ranges: Mutex::new(vec![]),
            fail_from: Mutex::new(None),
        }
    }

    pub fn set_head(&self, head: u64) {
        *self.head.lock().unwrap() = head;
    }

    pub fn push_log(&self, log: Log) {
        self.logs.lock().unwrap().push(log);
    }

    /// `get_logs` fails for any range reaching `block`
    pub fn fail_from(&self, block: u64) {
        *self.fail_from.lock().unwrap() = Some(block);
    }

    pub fn heal(&self) {
        *self.fail_from.lock().unwrap() = None;
    }

    /// Successfully served `[from, to]` ranges, in call order
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainRpc for FakeChain {
    async fn block_number(&self) -> Result<u64, Error> {
        Ok(*self.head.lock().unwrap())
    }

    async fn get_logs(
        &self,
        _address: &str,
        _topics: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, Error> {
        if let Some(block) = *self.fail_from.lock().unwrap() {
            if to_block >= block {
                return Err(Error::SyncError(String::from(
                    "eth_getLogs failed with -32000: header not found",
                )));
            }
        }

        self.ranges.lock().unwrap().push((from_block, to_block));

        let logs = self.logs.lock().unwrap();
        Ok(logs
            .iter()
            .filter(|log| {
                let block = log
                    .block_number
                    .as_deref()
                    .and_then(|n| u64::from_str_radix(&n[2..], 16).ok())
                    .unwrap_or(0);
                (from_block..=to_block).contains(&block)
            })
            .cloned()
            .collect())
    }
}

/// In-process store whose hash commits can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    reject_commits: AtomicBool,
    drop_commit_replies: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        FlakyStore::default()
    }

    /// `hincr_advance` fails before anything is written
    pub fn reject_commits(&self) {
        self.reject_commits.store(true, Ordering::SeqCst);
    }

    /// `hincr_advance` writes, then the reply is lost on the way back
    pub fn drop_commit_replies(&self) {
        self.drop_commit_replies.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.reject_commits.store(false, Ordering::SeqCst);
        self.drop_commit_replies.store(false, Ordering::SeqCst);
    }
}

fn injected(op: &str) -> Error {
    Error::StoreError(format!("{}: connection reset by peer", op))
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        self.inner.set(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        self.inner.del(key).await
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        self.inner.set_nx_ex(key, value, ttl).await
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, Error> {
        self.inner.del_if_eq(key, value).await
    }

    async fn expire_if_eq(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        self.inner.expire_if_eq(key, value, ttl).await
    }

    async fn hincr_advance(
        &self,
        key: &str,
        increments: &[(String, u64)],
        cursor: &str,
        expected: Option<u64>,
        next: u64,
    ) -> Result<bool, Error> {
        if self.reject_commits.load(Ordering::SeqCst) {
            return Err(injected("EVALSHA"));
        }

        let applied = self
            .inner
            .hincr_advance(key, increments, cursor, expected, next)
            .await?;

        if self.drop_commit_replies.load(Ordering::SeqCst) {
            return Err(injected("EVALSHA"));
        }
        Ok(applied)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<u64>, Error> {
        self.inner.hget(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, u64>, Error> {
        self.inner.hgetall(key).await
    }
}
