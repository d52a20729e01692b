//! Units exchanged with the dispatcher.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

/// A request bound for the upstream API. `path` is already upstream-relative
/// and may carry a query string.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            path: path.into(),
            headers,
            body,
        }
    }
}

/// Why an exchange produced no usable response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForwardFailure {
    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("failed to read upstream response body: {0}")]
    BodyRead(String),

    #[error("dispatcher is closed")]
    Closed,
}

/// Outcome of one exchange.
///
/// `status` is `None` when no response head was received. A body-read failure
/// keeps the status and headers that had already arrived.
#[derive(Debug, Clone, Default)]
pub struct ForwardResponse {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub failure: Option<ForwardFailure>,
}

impl ForwardResponse {
    pub fn completed(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status: Some(status),
            headers,
            body,
            failure: None,
        }
    }

    pub fn failed(failure: ForwardFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.status.is_some()
    }
}
