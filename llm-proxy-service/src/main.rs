use llm_proxy_service::config::{ProxyConfig, SERVICE_NAME};
use llm_proxy_service::services::metrics::init_metrics;
use llm_proxy_service::startup::Application;
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = ProxyConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(SERVICE_NAME, &config.log_level, config.otlp_endpoint.as_deref())
        .map_err(|e| std::io::Error::other(format!("Tracing initialization error: {}", e)))?;

    init_metrics();

    let application = Application::build(config).await.map_err(|e| {
        tracing::error!("Failed to build application: {}", e);
        std::io::Error::other(format!("Startup error: {}", e))
    })?;

    application.run_until_stopped().await
}
