//! Session lifecycle policy on top of a [`SessionStore`].

use crate::models::{Session, Usage};
use crate::services::store::{SessionStore, StoreError};
use crate::services::usage;
use http::HeaderMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The upstream body was not valid JSON of the expected shape.
#[derive(Debug, Error)]
#[error("Failed to parse usage from response body: {0}")]
pub struct UsageParseError(#[from] serde_json::Error);

#[derive(Deserialize)]
struct UsageEnvelope {
    #[serde(default)]
    usage: Option<Usage>,
}

/// Extract the `usage` object from an upstream JSON body.
///
/// Returns `Ok(None)` when there is no usage object or its total is zero.
pub fn parse_usage(body: &[u8]) -> Result<Option<Usage>, UsageParseError> {
    let envelope: UsageEnvelope = serde_json::from_slice(body)?;
    Ok(envelope.usage.filter(|usage| usage.total_tokens != 0))
}

#[derive(Clone)]
pub struct SessionAccountant {
    store: Arc<dyn SessionStore>,
}

impl SessionAccountant {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Get-or-create; never counts as a request.
    pub async fn ensure(&self, session_id: &str) -> Result<Session, StoreError> {
        let session = self.store.create_if_absent(session_id).await?;
        debug!(
            session_id = %session_id,
            request_count = session.request_count,
            "Session ensured"
        );
        Ok(session)
    }

    pub fn decode_usage(&self, body: &[u8]) -> Result<Option<Usage>, UsageParseError> {
        parse_usage(body)
    }

    pub async fn record(&self, session_id: &str, usage: Usage) -> Result<Session, StoreError> {
        let session = self.store.accumulate(session_id, usage).await?;

        metrics::counter!("proxy_session_tokens_total", "kind" => "prompt")
            .increment(u64::from(usage.prompt_tokens));
        metrics::counter!("proxy_session_tokens_total", "kind" => "completion")
            .increment(u64::from(usage.completion_tokens));

        info!(
            session_id = %session_id,
            prompt_tokens = session.total_prompt_tokens,
            completion_tokens = session.total_completion_tokens,
            total_tokens = session.total_tokens,
            request_count = session.request_count,
            "Updated session token usage"
        );
        Ok(session)
    }

    /// Decode (inflating gzip if declared) and record the usage carried by an
    /// upstream response.
    ///
    /// Parse failures and absent usage are absorbed and yield `Ok(None)`; only
    /// storage failures are returned.
    pub async fn settle(
        &self,
        session_id: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<Session>, StoreError> {
        let decoded = usage::decode_body(headers, body);
        match self.decode_usage(&decoded) {
            Ok(Some(usage)) => self.record(session_id, usage).await.map(Some),
            Ok(None) => {
                debug!(session_id = %session_id, "Upstream response carried no usage");
                Ok(None)
            }
            Err(e) => {
                metrics::counter!("proxy_usage_parse_failures_total").increment(1);
                warn!(session_id = %session_id, error = %e, "Skipping usage accounting");
                Ok(None)
            }
        }
    }

    pub async fn get(&self, session_id: &str) -> Result<Session, StoreError> {
        self.store.get(session_id).await
    }

    pub async fn list(&self) -> Result<BTreeMap<String, Session>, StoreError> {
        self.store.list().await
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::MemoryStore;
    use http::{header::CONTENT_ENCODING, HeaderValue};

    fn accountant() -> SessionAccountant {
        SessionAccountant::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn parses_usage_object() {
        let body = br#"{"usage":{"prompt_tokens":10,"completion_tokens":20,"total_tokens":30}}"#;
        assert_eq!(parse_usage(body).unwrap(), Some(Usage::new(10, 20, 30)));
    }

    #[test]
    fn missing_usage_is_not_an_error() {
        assert_eq!(parse_usage(br#"{"model":"x"}"#).unwrap(), None);
        assert_eq!(parse_usage(br#"{"usage":null}"#).unwrap(), None);
    }

    #[test]
    fn zero_total_means_no_usage() {
        let body = br#"{"usage":{"prompt_tokens":4,"completion_tokens":0,"total_tokens":0}}"#;
        assert_eq!(parse_usage(body).unwrap(), None);
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let body = br#"{"usage":{"total_tokens":7}}"#;
        assert_eq!(parse_usage(body).unwrap(), Some(Usage::new(0, 0, 7)));
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        assert!(parse_usage(b"{invalid").is_err());
        assert!(parse_usage(b"").is_err());
    }

    #[tokio::test]
    async fn ensure_does_not_count_requests() {
        let accountant = accountant();
        accountant.ensure("abc").await.unwrap();
        let session = accountant.ensure("abc").await.unwrap();
        assert_eq!(session.request_count, 0);
    }

    #[tokio::test]
    async fn settle_records_usage() {
        let accountant = accountant();
        let body = br#"{"usage":{"prompt_tokens":10,"completion_tokens":20,"total_tokens":30}}"#;

        let session = accountant
            .settle("abc", &HeaderMap::new(), body)
            .await
            .unwrap()
            .expect("usage should be recorded");
        assert_eq!(session.total_tokens, 30);
        assert_eq!(session.request_count, 1);
    }

    #[tokio::test]
    async fn settle_absorbs_parse_failures() {
        let accountant = accountant();
        accountant.ensure("abc").await.unwrap();

        let outcome = accountant
            .settle("abc", &HeaderMap::new(), b"<html>oops</html>")
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(accountant.get("abc").await.unwrap().request_count, 0);
    }

    #[tokio::test]
    async fn settle_inflates_gzip_bodies() {
        use flate2::{write::GzEncoder, Compression};
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(br#"{"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#)
            .unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        let accountant = accountant();
        let session = accountant
            .settle("abc", &headers, &compressed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.total_tokens, 2);
    }
}
