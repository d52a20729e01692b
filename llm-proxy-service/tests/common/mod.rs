#![allow(dead_code)]

use axum::{
    body::Bytes,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use flate2::{write::GzEncoder, Compression};
use llm_proxy_service::config::ProxyConfig;
use llm_proxy_service::services::metrics::init_metrics;
use llm_proxy_service::startup::Application;
use service_core::config::Config as CoreConfig;
use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const TEST_API_KEY: &str = "sk-proxy-test";

pub const CHAT_USAGE: &str =
    r#"{"id":"chatcmpl-1","usage":{"prompt_tokens":10,"completion_tokens":20,"total_tokens":30}}"#;
pub const GZIP_USAGE: &str =
    r#"{"id":"chatcmpl-2","usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#;

static TRACING: Once = Once::new();

fn init_test_observability() {
    TRACING.call_once(|| {
        let _ = service_core::observability::init_tracing("llm-proxy-test", "warn", None);
    });
    init_metrics();
}

/// One request as seen by the mock upstream.
#[derive(Debug, Clone)]
pub struct Captured {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub received_at: Instant,
}

/// Stand-in for the LLM API.
///
/// - `/v1/chat/completions`: JSON with usage
/// - `/v1/gzip`: gzip-compressed JSON with usage
/// - `/v1/models`: JSON without usage
/// - `/v1/slow`: JSON with usage after `slow_delay`
/// - `/v1/broken`: 500 with an error body
/// - anything else: 404
pub struct MockUpstream {
    pub base_url: String,
    pub captured: Arc<Mutex<Vec<Captured>>>,
}

impl MockUpstream {
    pub async fn spawn(slow_delay: Duration) -> Self {
        let captured: Arc<Mutex<Vec<Captured>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();

        let app = Router::new().fallback(
            move |method: Method, uri: Uri, headers: HeaderMap, body: Bytes| {
                let sink = sink.clone();
                async move {
                    let path = uri.path().to_string();
                    sink.lock().unwrap().push(Captured {
                        method,
                        uri: uri.to_string(),
                        headers,
                        body,
                        received_at: Instant::now(),
                    });
                    respond(&path, slow_delay).await
                }
            },
        );

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock upstream");
        let addr = listener.local_addr().expect("Mock upstream has no address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self {
            base_url: format!("http://{}", addr),
            captured,
        }
    }

    pub fn requests(&self) -> Vec<Captured> {
        self.captured.lock().unwrap().clone()
    }
}

async fn respond(path: &str, slow_delay: Duration) -> Response {
    match path {
        "/v1/chat/completions" => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::HeaderName::from_static("x-upstream"), "mock"),
            ],
            CHAT_USAGE,
        )
            .into_response(),
        "/v1/gzip" => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::CONTENT_ENCODING, "gzip"),
            ],
            gzip(GZIP_USAGE.as_bytes()),
        )
            .into_response(),
        "/v1/models" => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"object":"list","data":[]}"#,
        )
            .into_response(),
        "/v1/slow" => {
            tokio::time::sleep(slow_delay).await;
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                CHAT_USAGE,
            )
                .into_response()
        }
        "/v1/broken" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"error":{"message":"upstream exploded"}}"#,
        )
            .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn test_config(base_url: &str, overrides: &[(&str, &str)]) -> ProxyConfig {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("OPENAI_API_KEY".to_string(), TEST_API_KEY.to_string()),
        ("OPENAI_BASE_URL".to_string(), base_url.to_string()),
        ("RATE_LIMIT_PER_MIN".to_string(), "60000".to_string()),
        ("ENVIRONMENT".to_string(), "test".to_string()),
    ]);
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }

    let common = CoreConfig {
        port: 0,
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
    };
    ProxyConfig::from_lookup(common, |key| vars.get(key).cloned())
        .expect("Failed to build test configuration")
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: reqwest::Client,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<std::io::Result<()>>>,
}

impl TestApp {
    pub async fn spawn(config: ProxyConfig) -> Self {
        init_test_observability();

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");
        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(app.run_until(async move {
            shutdown_rx.await.ok();
        }));

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            client,
            shutdown: Some(shutdown_tx),
            server: Some(server),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub async fn post_json(&self, path: &str, body: &str) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("content-type", "application/json")
            .header("authorization", "Bearer client-supplied-key")
            .body(body.to_string())
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn session_status(&self, session_id: &str) -> serde_json::Value {
        let response = self.get(&format!("/v1/session/{}/status", session_id)).await;
        assert_eq!(response.status(), 200, "session {} should exist", session_id);
        response.json().await.expect("Invalid session JSON")
    }

    /// Trigger graceful shutdown and wait for the drain to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            server
                .await
                .expect("Server task panicked")
                .expect("Server returned an error");
        }
    }
}

/// An address with nothing listening on it.
pub async fn unreachable_base_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}
