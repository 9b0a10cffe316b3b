//! `/cache`: the cached auction bidder list plus cancellation counts.

use std::collections::HashMap;

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    configuration::{AppState, State},
    error::Error,
    model::DataSource,
    types::Row,
};

#[derive(Debug, Deserialize)]
pub struct CacheQuery {
    force: Option<String>,
}

pub async fn index(
    state: web::Data<AppState<State>>,
    query: web::Query<CacheQuery>,
) -> Result<impl Responder, Error> {
    let force = parse_force(query.force.as_deref())?;

    if state.config.dune_api_key.is_none() {
        return Err(Error::ConfigurationError(String::from(
            "Server misconfiguration: DUNE_API_KEY missing",
        )));
    }

    if let Some(syncer) = state.syncer.clone() {
        if force {
            if let Err(e) = syncer.reset().await {
                warn!("cancellation reset failed: {}", e);
            }
        }

        tokio::spawn(async move { syncer.sync().await });
    }

    let data = state
        .orchestrator
        .get_data(
            &state.config.cache_target(),
            &state.config.refresh_policy,
            force,
        )
        .await?;

    let cancellations = match &state.syncer {
        Some(syncer) => match syncer.counters().await {
            Ok(counters) => Some(counters),
            Err(e) => {
                warn!("cancellation counters unavailable: {}", e);
                None
            },
        },
        None => None,
    };

    Ok(web::Json(Response {
        rows: data.rows,
        cancellations,
        cached_at: data.cached_at.timestamp_millis(),
        cache_age_seconds: data.age_seconds,
        next_refresh_seconds: data.next_refresh_seconds,
        source: data.source,
        warning: data.warning,
    }))
}

pub async fn method_not_allowed(
    request: HttpRequest,
) -> Result<HttpResponse, Error> {
    Err(Error::MethodNotAllowed(request.method().to_string()))
}

fn parse_force(value: Option<&str>) -> Result<bool, Error> {
    let value = value.map(|v| v.trim().to_lowercase());

    match value.as_deref() {
        None | Some("") | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(_) => Err(Error::InvalidOption {
            option: String::from("force"),
        }),
    }
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellations: Option<HashMap<String, u64>>,
    /// Unix epoch milliseconds
    pub cached_at: i64,
    pub cache_age_seconds: i64,
    pub next_refresh_seconds: i64,
    pub source: DataSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}
