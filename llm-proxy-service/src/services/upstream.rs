//! HTTP exchange with the upstream LLM API.

use crate::config::UpstreamConfig;
use crate::models::{ForwardFailure, ForwardRequest, ForwardResponse};
use async_trait::async_trait;
use http::header::{
    HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING,
};
use http::HeaderMap;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use std::time::Instant;
use tracing::{error, info};

/// Headers tied to the inbound connection; the client recomputes them.
const NON_FORWARDED: [HeaderName; 4] = [HOST, CONTENT_LENGTH, CONNECTION, TRANSFER_ENCODING];

/// Something that can carry a [`ForwardRequest`] to the upstream and report
/// the outcome. Implemented by [`UpstreamClient`]; tests substitute fakes.
#[async_trait]
pub trait Exchange: Send + Sync + 'static {
    async fn exchange(&self, request: ForwardRequest) -> ForwardResponse;
}

#[async_trait]
impl Exchange for UpstreamClient {
    async fn exchange(&self, request: ForwardRequest) -> ForwardResponse {
        self.forward(request).await
    }
}

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    authorization: HeaderValue,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, AppError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
        })?;

        let mut authorization =
            HeaderValue::from_str(&format!("Bearer {}", config.api_key.expose_secret())).map_err(
                |_| AppError::ConfigError(anyhow::anyhow!("Upstream API key is not a valid header value")),
            )?;
        authorization.set_sensitive(true);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            authorization,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Copy of the caller's headers with connection-level headers removed and
    /// the upstream credential applied.
    fn outbound_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut headers = inbound.clone();
        for name in &NON_FORWARDED {
            headers.remove(name);
        }
        headers.insert(AUTHORIZATION, self.authorization.clone());
        headers
    }

    /// Perform one exchange. Never retries; failures come back inside the
    /// response.
    pub async fn forward(&self, request: ForwardRequest) -> ForwardResponse {
        let target_url = format!("{}{}", self.base_url, request.path);
        let headers = self.outbound_headers(&request.headers);
        let start = Instant::now();

        info!(
            method = %request.method,
            url = %target_url,
            body_bytes = request.body.len(),
            "Forwarding request upstream"
        );

        let response = match self
            .client
            .request(request.method, &target_url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let message = format!("{:#}", anyhow::Error::new(e));
                error!(url = %target_url, error = %message, "Upstream request failed");
                record_outcome("transport_error", start);
                return ForwardResponse::failed(ForwardFailure::Transport(message));
            }
        };

        let status = response.status();
        let response_headers = response.headers().clone();

        match response.bytes().await {
            Ok(body) => {
                info!(
                    url = %target_url,
                    status = status.as_u16(),
                    body_bytes = body.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Upstream response received"
                );
                record_outcome("completed", start);
                ForwardResponse::completed(status, response_headers, body)
            }
            Err(e) => {
                let message = format!("{:#}", anyhow::Error::new(e));
                error!(
                    url = %target_url,
                    status = status.as_u16(),
                    error = %message,
                    "Failed to read upstream response body"
                );
                record_outcome("body_read_error", start);
                ForwardResponse {
                    status: Some(status),
                    headers: response_headers,
                    body: Default::default(),
                    failure: Some(ForwardFailure::BodyRead(message)),
                }
            }
        }
    }
}

fn record_outcome(outcome: &'static str, start: Instant) {
    metrics::counter!("proxy_upstream_exchanges_total", "outcome" => outcome).increment(1);
    metrics::histogram!("proxy_upstream_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}
