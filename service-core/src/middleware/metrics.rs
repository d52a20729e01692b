use axum::{extract::Request, middleware::Next, response::Response};
use metrics::{counter, histogram};
use std::time::Instant;

const SESSION_PREFIX: &str = "/v1/session/";

pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = route_label(req.uri().path());

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status().as_u16().to_string();

    let labels = [("method", method), ("path", path), ("status", status)];

    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(duration.as_secs_f64());

    response
}

/// Collapses the client-chosen session id so every session shares one label set.
fn route_label(path: &str) -> String {
    match path.strip_prefix(SESSION_PREFIX) {
        Some(rest) => match rest.split_once('/') {
            Some((_, tail)) => format!("{SESSION_PREFIX}:id/{tail}"),
            None => format!("{SESSION_PREFIX}:id"),
        },
        None => path.to_string(),
    }
}
