use crate::handlers::path::session_route;
use crate::models::{ForwardFailure, ForwardRequest, ForwardResponse};
use crate::startup::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{
        header::{CONNECTION, TRANSFER_ENCODING},
        HeaderMap, Method, Uri,
    },
    response::Response,
};
use bytes::Bytes;
use service_core::error::AppError;
use std::borrow::Cow;
use tracing::Instrument;

/// Forward any request not claimed by another route.
///
/// Session paths are rewritten, their session ensured before dispatch, and
/// any usage in the upstream response folded into the session afterwards.
#[tracing::instrument(skip(state, headers, body), fields(session_id = tracing::field::Empty))]
pub async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let route = session_route(uri.path()).map_err(|e| {
        tracing::warn!(path = %uri.path(), "Rejected malformed session path");
        AppError::BadRequest(anyhow::Error::new(e))
    })?;

    let session_id = route.session_id.map(Cow::into_owned);
    if let Some(session_id) = session_id.as_deref() {
        tracing::Span::current().record("session_id", session_id);
        state.accountant.ensure(session_id).await.map_err(|e| {
            tracing::error!(session_id = %session_id, error = %e, "Failed to initialize session");
            AppError::from(e)
        })?;
    }

    let upstream_path = match uri.query() {
        Some(query) => format!("{}?{}", route.upstream_path, query),
        None => route.upstream_path,
    };
    let request = ForwardRequest::new(method, upstream_path, headers, body);

    // Detached so usage is still recorded if the client goes away mid-exchange.
    let forwarded = state
        .settlements
        .spawn(forward_and_settle(state.clone(), session_id, request).in_current_span());
    let ForwardResponse {
        status,
        headers,
        body,
        failure,
    } = forwarded.await.map_err(|e| {
        tracing::error!(error = %e, "Forwarding task failed");
        AppError::BadGateway(e.to_string())
    })?;

    let status = match (status, failure) {
        (_, Some(failure)) => return Err(bad_gateway(failure)),
        (Some(status), None) => status,
        (None, None) => return Err(AppError::BadGateway("no response from upstream".to_string())),
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let response_headers = response.headers_mut();
    for (name, value) in headers.iter() {
        if *name == CONNECTION || *name == TRANSFER_ENCODING {
            continue;
        }
        response_headers.append(name.clone(), value.clone());
    }

    Ok(response)
}

/// Submit the exchange and, for session requests that completed, record usage.
async fn forward_and_settle(
    state: AppState,
    session_id: Option<String>,
    request: ForwardRequest,
) -> ForwardResponse {
    let response = state.dispatcher.submit(request).await;

    if let (Some(session_id), Some(_), None) =
        (session_id.as_deref(), response.status, &response.failure)
    {
        // A failed write is logged and the upstream response still returned.
        if let Err(e) = state
            .accountant
            .settle(session_id, &response.headers, &response.body)
            .await
        {
            tracing::error!(
                session_id = %session_id,
                error = %e,
                "Failed to record session token usage"
            );
        }
    }

    response
}

fn bad_gateway(failure: ForwardFailure) -> AppError {
    tracing::error!(error = %failure, "Upstream exchange failed");
    AppError::BadGateway(failure.to_string())
}
