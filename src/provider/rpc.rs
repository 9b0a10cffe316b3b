use std::{
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::{
    error::Error,
    types::{Log, RpcBody},
};

#[async_trait]
pub trait ChainRpc: Debug + Send + Sync {
    async fn block_number(&self) -> Result<u64, Error>;

    /// Logs emitted by `address` matching `topics` in `[from_block, to_block]`.
    async fn get_logs(
        &self,
        address: &str,
        topics: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, Error>;
}

/// Minimal JSON-RPC 2.0 client for an Ethereum node.
#[derive(Debug)]
pub struct RpcClient {
    url: String,
    http: Client,
    id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: &str, timeout: u64) -> Result<RpcClient, Error> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        Ok(RpcClient {
            url: url.to_owned(),
            http,
            id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, Error> {
        let id = self.id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let body = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<RpcBody<T>>()
            .await?;

        if let Some(error) = body.error {
            return Err(Error::SyncError(format!(
                "{} failed with {}: {}",
                method, error.code, error.message
            )));
        }

        body.result.ok_or_else(|| {
            Error::SyncError(format!("{} returned no result", method))
        })
    }
}

#[async_trait]
impl ChainRpc for RpcClient {
    async fn block_number(&self) -> Result<u64, Error> {
        let quantity: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&quantity)
    }

    async fn get_logs(
        &self,
        address: &str,
        topics: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, Error> {
        let filter = json!({
            "address": address,
            "topics": topics,
            "fromBlock": to_quantity(from_block),
            "toBlock": to_quantity(to_block),
        });

        self.call("eth_getLogs", json!([filter])).await
    }
}

pub fn to_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

pub fn parse_quantity(value: &str) -> Result<u64, Error> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| {
            Error::SyncError(format!("invalid hex quantity {}", value))
        })?;

    Ok(u64::from_str_radix(digits, 16)?)
}

/// Decodes an address stored right-aligned in a 32-byte topic, lowercased.
pub fn topic_to_address(topic: &str) -> Option<String> {
    let digits = topic.strip_prefix("0x").unwrap_or(topic);
    if digits.len() != 64 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    Some(format!("0x{}", digits[24..].to_lowercase()))
}
