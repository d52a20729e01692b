//! Durable session store on SQLite.
//!
//! Multi-step operations run in one transaction, and `accumulate` performs the
//! addition inside the upsert so concurrent writers to the same id serialize
//! on the row instead of racing a client-side read-modify-write.

use super::{SessionStore, StoreError};
use crate::models::{Session, Usage};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

const SELECT_SESSION: &str = r#"
    SELECT session_id, total_prompt_tokens, total_completion_tokens, total_tokens, request_count
    FROM sessions
    WHERE session_id = ?
"#;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a pool for `dsn`: a file path, a `sqlite://` URL, or `sqlite::memory:`.
    /// The database file is created when missing.
    #[instrument(fields(service = "llm-proxy-service"))]
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self, StoreError> {
        info!(max_connections = max_connections, "Connecting to SQLite");

        let options = SqliteConnectOptions::from_str(dsn)
            .map_err(|e| StoreError::Init(format!("Invalid SQLite DSN '{}': {}", dsn, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30));

        // An in-memory database lives only as long as a connection to it.
        if dsn.contains(":memory:") || dsn.contains("mode=memory") {
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Init(format!("Failed to open SQLite database: {}", e)))?;

        info!("SQLite connection pool established");

        Ok(Self { pool })
    }

    /// Single-connection in-memory store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    #[instrument(skip(self))]
    async fn init(&self) -> Result<(), StoreError> {
        info!("Running session store migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Init(format!("Migration failed: {}", e)))?;
        info!("SQLite sessions table initialized");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("SQLite connection pool closed");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, session_id: &str) -> Result<Session, StoreError> {
        sqlx::query_as::<_, Session>(SELECT_SESSION)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::backend("get", e))?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    #[instrument(skip(self))]
    async fn create_if_absent(&self, session_id: &str) -> Result<Session, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::backend("create_if_absent", e))?;

        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, total_prompt_tokens, total_completion_tokens, total_tokens, request_count)
            VALUES (?, 0, 0, 0, 0)
            ON CONFLICT(session_id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::backend("create_if_absent", e))?;

        let session = sqlx::query_as::<_, Session>(SELECT_SESSION)
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::backend("create_if_absent", e))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::backend("create_if_absent", e))?;

        Ok(session)
    }

    #[instrument(skip(self))]
    async fn accumulate(&self, session_id: &str, usage: Usage) -> Result<Session, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::backend("accumulate", e))?;

        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, total_prompt_tokens, total_completion_tokens, total_tokens, request_count)
            VALUES (?, ?, ?, ?, 1)
            ON CONFLICT(session_id) DO UPDATE SET
                total_prompt_tokens = sessions.total_prompt_tokens + excluded.total_prompt_tokens,
                total_completion_tokens = sessions.total_completion_tokens + excluded.total_completion_tokens,
                total_tokens = sessions.total_tokens + excluded.total_tokens,
                request_count = sessions.request_count + 1
            "#,
        )
        .bind(session_id)
        .bind(i64::from(usage.prompt_tokens))
        .bind(i64::from(usage.completion_tokens))
        .bind(i64::from(usage.total_tokens))
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::backend("accumulate", e))?;

        let session = sqlx::query_as::<_, Session>(SELECT_SESSION)
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::backend("accumulate", e))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::backend("accumulate", e))?;

        Ok(session)
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<BTreeMap<String, Session>, StoreError> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT session_id, total_prompt_tokens, total_completion_tokens, total_tokens, request_count
            FROM sessions
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::backend("list", e))?;

        Ok(sessions
            .into_iter()
            .map(|session| (session.session_id.clone(), session))
            .collect())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("health_check", e))?;
        Ok(())
    }
}
