use std::time::{Duration, SystemTime};

use reqwest::{StatusCode, header::HeaderMap};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("authentication expired or rejected")]
    AuthExpired,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        owner: Option<String>,
    },
    #[error("server busy ({status})")]
    ServerBusy {
        status: StatusCode,
        retry_after: Option<Duration>,
    },
    #[error("unsupported by server: {0}")]
    Unsupported(String),
    #[error("malformed server response: {0}")]
    Protocol(String),
    #[error("content digest mismatch: expected {expected}, got {actual}")]
    Corrupt { expected: String, actual: String },
    #[error("change token is no longer valid")]
    TokenInvalid,
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("request could not be built: {0}")]
    Request(reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    owner: Option<String>,
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
            RemoteError::Transient(err.to_string())
        } else if err.is_decode() {
            RemoteError::Protocol(err.to_string())
        } else if let Some(status) = err.status() {
            RemoteError::from_status(status, &HeaderMap::new(), err.to_string())
        } else {
            RemoteError::Request(err)
        }
    }
}

impl RemoteError {
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Self::from_status(status, &headers, body)
    }

    pub(crate) fn from_status(status: StatusCode, headers: &HeaderMap, body: String) -> Self {
        let parsed: Option<ErrorBody> = serde_json::from_str(&body).ok();
        let message = parsed
            .as_ref()
            .and_then(|b| b.message.clone())
            .unwrap_or_else(|| body.clone());
        match status {
            StatusCode::UNAUTHORIZED => RemoteError::AuthExpired,
            StatusCode::FORBIDDEN => RemoteError::Forbidden(message),
            StatusCode::NOT_FOUND => RemoteError::NotFound(message),
            StatusCode::GONE => RemoteError::TokenInvalid,
            StatusCode::CONFLICT => RemoteError::Conflict {
                message,
                owner: parsed.and_then(|b| b.owner),
            },
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
                RemoteError::Unsupported(message)
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                RemoteError::ServerBusy {
                    status,
                    retry_after: parse_retry_after(headers),
                }
            }
            s if s.is_server_error() => RemoteError::ServerBusy {
                status,
                retry_after: parse_retry_after(headers),
            },
            _ => RemoteError::Protocol(format!("unexpected status {status}: {message}")),
        }
    }

    pub fn classification(&self) -> ApiErrorClass {
        match self {
            RemoteError::AuthExpired => ApiErrorClass::Auth,
            RemoteError::ServerBusy { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS => {
                ApiErrorClass::RateLimit
            }
            RemoteError::ServerBusy { .. } | RemoteError::Transient(_) => ApiErrorClass::Transient,
            _ => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::ServerBusy { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after().map(|d| d.as_secs())
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(value.trim()).ok()?;
    Some(
        when.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}
