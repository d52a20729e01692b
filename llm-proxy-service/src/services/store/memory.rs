use super::{SessionStore, StoreError};
use crate::models::{Session, Usage};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Process-local store. Lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Session, StoreError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn create_if_absent(&self, session_id: &str) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        Ok(session.clone())
    }

    async fn accumulate(&self, session_id: &str, usage: Usage) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        session.add_usage(usage);
        Ok(session.clone())
    }

    async fn list(&self) -> Result<BTreeMap<String, Session>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .iter()
            .map(|(id, session)| (id.clone(), session.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn get_unknown_session_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn create_if_absent_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.create_if_absent("abc").await.unwrap();
        let second = store.create_if_absent("abc").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second, Session::new("abc"));
    }

    #[tokio::test]
    async fn create_if_absent_keeps_existing_counters() {
        let store = MemoryStore::new();
        store.accumulate("abc", Usage::new(1, 2, 3)).await.unwrap();

        let session = store.create_if_absent("abc").await.unwrap();
        assert_eq!(session.total_tokens, 3);
        assert_eq!(session.request_count, 1);
    }

    #[tokio::test]
    async fn accumulate_creates_and_sums() {
        let store = MemoryStore::new();
        store.accumulate("abc", Usage::new(10, 20, 30)).await.unwrap();
        let session = store.accumulate("abc", Usage::new(5, 5, 10)).await.unwrap();

        assert_eq!(session.total_prompt_tokens, 15);
        assert_eq!(session.total_completion_tokens, 25);
        assert_eq!(session.total_tokens, 40);
        assert_eq!(session.request_count, 2);
        assert_eq!(store.get("abc").await.unwrap(), session);
    }

    #[tokio::test]
    async fn returned_values_are_copies() {
        let store = MemoryStore::new();
        let mut session = store.create_if_absent("abc").await.unwrap();
        session.total_tokens = 999;

        assert_eq!(store.get("abc").await.unwrap().total_tokens, 0);
    }

    #[tokio::test]
    async fn list_is_a_snapshot() {
        let store = MemoryStore::new();
        store.accumulate("a", Usage::new(1, 1, 2)).await.unwrap();
        store.create_if_absent("b").await.unwrap();

        let snapshot = store.list().await.unwrap();
        store.accumulate("a", Usage::new(1, 1, 2)).await.unwrap();
        store.create_if_absent("c").await.unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["a"].total_tokens, 2);
        assert_eq!(snapshot["b"].request_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accumulate_loses_no_update() {
        let store = Arc::new(MemoryStore::new());

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.accumulate("s", Usage::new(10, 0, 10)).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.accumulate("s", Usage::new(5, 0, 5)).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let session = store.get("s").await.unwrap();
        assert_eq!(session.total_tokens, 15);
        assert_eq!(session.request_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_concurrent_accumulates_equal_serial_sum() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (1..=50u32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.accumulate("s", Usage::new(i, 1, i + 1)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let session = store.get("s").await.unwrap();
        assert_eq!(session.total_prompt_tokens, (1..=50).sum::<i64>());
        assert_eq!(session.total_completion_tokens, 50);
        assert_eq!(session.total_tokens, (2..=51).sum::<i64>());
        assert_eq!(session.request_count, 50);
    }

    #[tokio::test]
    async fn close_twice_is_ok() {
        let store = MemoryStore::new();
        store.close().await.unwrap();
        store.close().await.unwrap();
    }
}
