use actix_web::{
    http::{header, StatusCode},
    HttpResponse, ResponseError,
};
use anyhow::Error as ANYHOW_ERROR;
use redis::RedisError as REDIS_ERROR;
use reqwest::Error as REQWEST_ERROR;
use serde_json::Error as JSON_ERROR;
use std::{io::Error as IO_ERROR, num::ParseIntError};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::subscriber::SetGlobalDefaultError as TRACING_GLOBAL_DEFAULT_ERROR;
use url::ParseError as URL_ERROR;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] IO_ERROR),

    #[error("{0}")]
    URL(#[from] URL_ERROR),

    #[error("{0}")]
    INT(#[from] ParseIntError),

    #[error("{0}")]
    JsonError(#[from] JSON_ERROR),

    #[error("{0}")]
    TokioJoinError(#[from] JoinError),

    #[error("{0}")]
    ReqwestError(#[from] REQWEST_ERROR),

    #[error("Cache store error: {0}")]
    RedisError(#[from] REDIS_ERROR),

    #[error("Cache store error: {0}")]
    StoreError(String),

    #[error("{0}")]
    AnyHowError(#[from] ANYHOW_ERROR),

    #[error("Tracing error: {0}")]
    SetGlobalDefaultError(#[from] TRACING_GLOBAL_DEFAULT_ERROR),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to start upstream execution: {0}")]
    UpstreamExecuteError(String),

    #[error(
        "Upstream execution {execution_id} not finished after {attempts} polls"
    )]
    UpstreamTimeoutError { execution_id: String, attempts: u32 },

    #[error("Upstream execution {execution_id} ended in state {state}")]
    UpstreamStateError { execution_id: String, state: String },

    #[error("Upstream response error: {0}")]
    UpstreamResponseError(String),

    #[error("Refresh already in progress for {key}")]
    LockBusyError { key: String, retry_after: u64 },

    #[error("Sync error: {0}")]
    SyncError(String),

    #[error("Invalid option {option}")]
    InvalidOption { option: String },

    #[error("Method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("Task message error: {0}")]
    TaskError(String),
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request - client sent invalid input
            Error::InvalidOption { .. } => StatusCode::BAD_REQUEST,

            Error::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,

            // 429 - another instance is refreshing and nothing stale exists
            Error::LockBusyError { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 502 Bad Gateway - upstream answered with garbage or not at all
            Error::ReqwestError(_) | Error::UpstreamResponseError(_) => {
                StatusCode::BAD_GATEWAY
            },

            // 504 Gateway Timeout - polling budget exhausted
            Error::UpstreamTimeoutError { .. } => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error - everything else
            Error::ConfigurationError(_)
            | Error::UpstreamExecuteError(_)
            | Error::UpstreamStateError { .. }
            | Error::Io(_)
            | Error::URL(_)
            | Error::INT(_)
            | Error::JsonError(_)
            | Error::TokioJoinError(_)
            | Error::RedisError(_)
            | Error::StoreError(_)
            | Error::AnyHowError(_)
            | Error::SetGlobalDefaultError(_)
            | Error::SyncError(_)
            | Error::TaskError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": status.canonical_reason().unwrap_or("Unknown"),
            "details": self.to_string(),
            "status": status.as_u16(),
        });
        let mut response = HttpResponse::build(status);

        if let Error::LockBusyError { retry_after, .. } = self {
            response.insert_header((header::RETRY_AFTER, retry_after.to_string()));
        }

        response.json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_status_codes() {
        let timeout = Error::UpstreamTimeoutError {
            execution_id: String::from("42"),
            attempts: 15,
        };
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);

        let config = Error::ConfigurationError(String::from("DUNE_API_KEY"));
        assert_eq!(config.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let state = Error::UpstreamStateError {
            execution_id: String::from("42"),
            state: String::from("QUERY_STATE_FAILED"),
        };
        assert_eq!(state.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        // only raised by config and store parsing, never by request input
        let int = Error::from("x".parse::<u64>().unwrap_err());
        assert_eq!(int.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let option = Error::InvalidOption {
            option: String::from("force=maybe"),
        };
        assert_eq!(option.status_code(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_lock_busy_response() {
        let err = Error::LockBusyError {
            key: String::from("bidders"),
            retry_after: 2,
        };
        let response = err.error_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "2"
        );

        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], 429);
        assert_eq!(json["details"], "Refresh already in progress for bidders");
    }
}
