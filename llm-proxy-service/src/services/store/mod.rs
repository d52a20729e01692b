//! Session storage abstraction.
//!
//! Both backends honour the same contract: `create_if_absent` is idempotent,
//! `accumulate` upserts and is atomic per session id, and every returned
//! `Session` is a copy detached from the store's state.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::models::{Session, Usage};
use async_trait::async_trait;
use service_core::error::AppError;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Storage initialization failed: {0}")]
    Init(String),

    #[error("Storage operation '{operation}' failed: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl StoreError {
    pub(crate) fn backend(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        StoreError::Backend {
            operation,
            source: source.into(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => {
                AppError::NotFound(anyhow::anyhow!("Session not found: {}", id))
            }
            other => AppError::DatabaseError(anyhow::Error::new(other)),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Prepare the backing resource.
    async fn init(&self) -> Result<(), StoreError>;

    /// Release resources. Safe to call repeatedly.
    async fn close(&self) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str) -> Result<Session, StoreError>;

    /// Return the existing session unchanged, or create a zero-valued one.
    async fn create_if_absent(&self, session_id: &str) -> Result<Session, StoreError>;

    /// Add `usage` to the session (creating it first if needed) and bump its
    /// request count by one. Returns the post-update session.
    async fn accumulate(&self, session_id: &str, usage: Usage) -> Result<Session, StoreError>;

    /// Snapshot of every session keyed by id.
    async fn list(&self) -> Result<BTreeMap<String, Session>, StoreError>;

    /// Cheap liveness probe for health endpoints.
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
