//! In-process session store.

use super::{validate_metadata_keys, SessionPolicy, SessionStore, SessionStoreError};
use crate::models::{Session, SessionAction};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct MemorySessionStore {
    sessions: Arc<DashMap<String, Session>>,
    policy: SessionPolicy,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemorySessionStore {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            policy,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn purge(sessions: &DashMap<String, Session>, ttl: chrono::Duration) -> u64 {
        let now = Utc::now();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now, ttl));
        before.saturating_sub(sessions.len()) as u64
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn init(&self) -> Result<(), SessionStoreError> {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return Ok(());
        }

        let sessions = self.sessions.clone();
        let policy = self.policy;
        let shutdown = self.shutdown.clone();

        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(policy.purge_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = Self::purge(&sessions, policy.ttl);
                        if removed > 0 {
                            tracing::info!(removed, "Purged expired sessions");
                        }
                    }
                }
            }
        }));

        tracing::info!(
            ttl_hours = self.policy.ttl.num_hours(),
            max_actions = self.policy.max_actions,
            "In-memory session store ready"
        );
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn create(&self) -> Result<Session, SessionStoreError> {
        let session = Session::new();
        self.sessions.insert(session.id.clone(), session.clone());
        tracing::debug!(session_id = %session.id, "Session created");
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, SessionStoreError> {
        let ttl = self.policy.ttl;
        if self
            .sessions
            .remove_if(id, |_, s| s.is_expired(Utc::now(), ttl))
            .is_some()
        {
            tracing::debug!(session_id = %id, "Session expired on access");
            return Ok(None);
        }

        Ok(self.sessions.get_mut(id).map(|mut entry| {
            entry.touch();
            entry.clone()
        }))
    }

    async fn update_metadata(
        &self,
        id: &str,
        patch: HashMap<String, serde_json::Value>,
    ) -> Result<Session, SessionStoreError> {
        validate_metadata_keys(&patch)?;
        let mut entry = self
            .sessions
            .get_mut(id)
            .filter(|s| !s.is_expired(Utc::now(), self.policy.ttl))
            .ok_or_else(|| SessionStoreError::NotFound(id.to_string()))?;

        entry.merge_metadata(patch);
        Ok(entry.clone())
    }

    async fn append_action(
        &self,
        id: &str,
        action: SessionAction,
    ) -> Result<(), SessionStoreError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .filter(|s| !s.is_expired(Utc::now(), self.policy.ttl))
            .ok_or_else(|| SessionStoreError::NotFound(id.to_string()))?;

        entry.push_action(action, self.policy.max_actions);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, SessionStoreError> {
        Ok(self.sessions.remove(id).is_some())
    }

    async fn purge_expired(&self) -> Result<u64, SessionStoreError> {
        Ok(Self::purge(&self.sessions, self.policy.ttl))
    }

    async fn health_check(&self) -> Result<(), SessionStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(max_actions: usize) -> MemorySessionStore {
        MemorySessionStore::new(SessionPolicy {
            max_actions,
            ..SessionPolicy::default()
        })
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = store(10);
        let session = store.create().await.unwrap();

        let fetched = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, session.id);
        assert!(fetched.last_accessed >= session.last_accessed);

        assert!(store.delete(&session.id).await.unwrap());
        assert!(store.get(&session.id).await.unwrap().is_none());
        assert!(!store.delete(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_action_log_keeps_newest() {
        let store = store(10);
        let session = store.create().await.unwrap();
        for i in 0..15 {
            store
                .append_action(&session.id, SessionAction::new("click", json!({ "n": i })))
                .await
                .unwrap();
        }

        let session = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(session.actions.len(), 10);
        assert_eq!(session.actions[0].data["n"], 5);
        assert_eq!(session.actions[9].data["n"], 14);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let store = Arc::new(store(1_000));
        let id = store.create().await.unwrap().id;

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    store
                        .append_action(&id, SessionAction::new("click", json!({ "n": i })))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.get(&id).await.unwrap().unwrap().actions.len(), 50);
    }

    #[tokio::test]
    async fn test_expired_session_reads_as_absent_and_is_purged() {
        let store = store(10);
        let live = store.create().await.unwrap();
        let stale = store.create().await.unwrap();
        if let Some(mut entry) = store.sessions.get_mut(&stale.id) {
            entry.last_accessed = Utc::now() - chrono::Duration::days(8);
        }

        assert!(matches!(
            store.append_action(&stale.id, SessionAction::new("x", json!({}))).await,
            Err(SessionStoreError::NotFound(_))
        ));
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get(&live.id).await.unwrap().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_patch() {
        let store = store(10);
        let id = store.create().await.unwrap().id;

        let session = store
            .update_metadata(&id, HashMap::from([("step".to_string(), json!("speech"))]))
            .await
            .unwrap();
        assert_eq!(session.metadata["step"], "speech");

        assert!(matches!(
            store.update_metadata("missing", HashMap::new()).await,
            Err(SessionStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_init_and_shutdown_sweeper() {
        let store = store(10);
        store.init().await.unwrap();
        store.init().await.unwrap();
        store.shutdown().await;
        assert!(store.sweeper.lock().await.is_none());
    }
}
