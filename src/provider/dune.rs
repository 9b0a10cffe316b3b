//! Client for the analytics provider's execute -> poll -> results protocol.
//!
//! An execution moves `Idle -> Pending -> {Done | Failed | TimedOut}`.
//! Starting it is [`AnalyticsApi::execute`]; [`poll_execution`] drives the
//! `Pending` state on a fixed interval until a terminal state or the
//! attempt budget runs out. Timing out only abandons the wait, the
//! execution keeps running upstream.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    configuration::{Config, RefreshPolicy},
    error::Error,
    types::{ExecuteResponse, ExecutionResults, ExecutionState, Row},
};

const API_KEY_HEADER: &str = "X-Dune-Api-Key";

#[async_trait]
pub trait AnalyticsApi: Debug + Send + Sync {
    /// Starts a new execution of `query_id` and returns its execution id.
    async fn execute(&self, query_id: u64) -> Result<String, Error>;

    /// Fetches the current state (and rows once completed) of an execution.
    async fn get_results(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionResults, Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedExecution {
    pub execution_id: String,
    pub rows: Vec<Row>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct DuneClient {
    base_url: Url,
    api_key: Option<String>,
    http: Client,
}

impl DuneClient {
    pub fn new(config: &Config) -> Result<DuneClient, Error> {
        let mut base = config.dune_api_url.to_owned();
        if !base.ends_with('/') {
            base.push('/');
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .user_agent("auction-cache")
            .build()?;

        Ok(DuneClient {
            base_url: Url::parse(&base)?,
            api_key: config.dune_api_key.to_owned(),
            http,
        })
    }

    fn api_key(&self) -> Result<&str, Error> {
        self.api_key.as_deref().ok_or_else(|| {
            Error::ConfigurationError(String::from(
                "Server misconfiguration: DUNE_API_KEY missing",
            ))
        })
    }
}

#[async_trait]
impl AnalyticsApi for DuneClient {
    async fn execute(&self, query_id: u64) -> Result<String, Error> {
        let api_key = self.api_key()?;
        let url = self.base_url.join(&format!("query/{}/execute", query_id))?;

        let response = self
            .http
            .post(url)
            .header(API_KEY_HEADER, api_key)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| Error::UpstreamExecuteError(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamExecuteError(format!(
                "status {}: {}",
                status, body
            )));
        }

        let body = response
            .json::<ExecuteResponse>()
            .await
            .map_err(|e| Error::UpstreamExecuteError(e.to_string()))?;

        info!(query_id, execution_id = %body.execution_id, "execution started");
        Ok(body.execution_id)
    }

    async fn get_results(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionResults, Error> {
        let api_key = self.api_key()?;
        let url = self
            .base_url
            .join(&format!("execution/{}/results", execution_id))?;

        let response =
            self.http.get(url).header(API_KEY_HEADER, api_key).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::UpstreamResponseError(format!(
                "execution {} results returned status {}",
                execution_id, status
            )));
        }

        Ok(response.json::<ExecutionResults>().await?)
    }
}

/// Polls `execution_id` until it completes, fails, or `max_poll_attempts`
/// polls spaced by `poll_interval` have been spent.
///
/// Non-200 answers and transport errors count as "still running" and
/// consume an attempt.
pub async fn poll_execution(
    api: &dyn AnalyticsApi,
    execution_id: &str,
    policy: &RefreshPolicy,
) -> Result<CompletedExecution, Error> {
    for attempt in 1..=policy.max_poll_attempts {
        tokio::time::sleep(policy.poll_interval).await;

        let results = match api.get_results(execution_id).await {
            Ok(results) => results,
            Err(e) => {
                warn!(execution_id, attempt, "poll failed: {}", e);
                continue;
            },
        };

        match results.execution_state() {
            ExecutionState::Completed => {
                let rows = results.result.map(|r| r.rows).unwrap_or_default();
                info!(
                    execution_id,
                    attempt,
                    rows = rows.len(),
                    "execution completed"
                );

                return Ok(CompletedExecution {
                    execution_id: execution_id.to_owned(),
                    rows,
                    ended_at: results.execution_ended_at,
                });
            },
            ExecutionState::Failed | ExecutionState::Cancelled => {
                return Err(Error::UpstreamStateError {
                    execution_id: execution_id.to_owned(),
                    state: results.state,
                });
            },
            ExecutionState::Running(state) => {
                debug!(execution_id, attempt, %state, "execution pending");
            },
        }
    }

    Err(Error::UpstreamTimeoutError {
        execution_id: execution_id.to_owned(),
        attempts: policy.max_poll_attempts,
    })
}
