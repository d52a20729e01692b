use crate::models::Session;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use std::collections::BTreeMap;

/// Every known session keyed by id.
pub async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, Session>>, AppError> {
    let sessions = state.accountant.list().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to list sessions");
        AppError::from(e)
    })?;
    Ok(Json(sessions))
}

/// One session. Unknown ids are 404 and are never created here.
#[tracing::instrument(skip(state))]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, AppError> {
    let session = state.accountant.get(&session_id).await.map_err(|e| {
        tracing::debug!(error = %e, "Session lookup failed");
        AppError::from(e)
    })?;
    Ok(Json(session))
}
