//! Session store: cookie-correlated sessions with a bounded action log.
//!
//! Two backends implement [`SessionStore`]: an in-process map for single
//! instances and tests, and MongoDB for shared deployments.

pub mod memory;
pub mod mongo;

use crate::models::{Session, SessionAction};
use async_trait::async_trait;
use service_core::error::AppError;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemorySessionStore;
pub use mongo::MongoSessionStore;

#[derive(Error, Debug)]
pub enum SessionStoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Invalid session data: {0}")]
    Invalid(String),

    #[error("Session store error: {0}")]
    Backend(String),
}

impl From<SessionStoreError> for AppError {
    fn from(err: SessionStoreError) -> Self {
        match err {
            SessionStoreError::NotFound(_) => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            SessionStoreError::Invalid(_) => AppError::BadRequest(anyhow::anyhow!(err.to_string())),
            SessionStoreError::Backend(_) => AppError::DatabaseError(anyhow::anyhow!(err.to_string())),
        }
    }
}

/// Lifetime and size limits shared by all backends.
#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    /// Sessions idle for longer than this are gone.
    pub ttl: chrono::Duration,
    /// Oldest actions are dropped beyond this many.
    pub max_actions: usize,
    /// How often the background sweep runs.
    pub purge_interval: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::days(7),
            max_actions: 100,
            purge_interval: Duration::from_secs(3600),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Prepare the backend (indexes, background sweep).
    async fn init(&self) -> Result<(), SessionStoreError>;

    /// Stop background work.
    async fn shutdown(&self);

    async fn create(&self) -> Result<Session, SessionStoreError>;

    /// Fetch a live session and refresh its last-access time. Expired
    /// sessions read as absent.
    async fn get(&self, id: &str) -> Result<Option<Session>, SessionStoreError>;

    /// Shallow-merge `patch` into the metadata; `null` values remove keys.
    async fn update_metadata(
        &self,
        id: &str,
        patch: HashMap<String, serde_json::Value>,
    ) -> Result<Session, SessionStoreError>;

    /// Append to the action log, evicting the oldest entries beyond the cap.
    async fn append_action(&self, id: &str, action: SessionAction)
        -> Result<(), SessionStoreError>;

    /// Returns whether a session was removed.
    async fn delete(&self, id: &str) -> Result<bool, SessionStoreError>;

    /// Remove expired sessions; returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, SessionStoreError>;

    async fn health_check(&self) -> Result<(), SessionStoreError>;
}

/// Metadata keys become document paths in some backends.
pub(crate) fn validate_metadata_keys(
    patch: &HashMap<String, serde_json::Value>,
) -> Result<(), SessionStoreError> {
    for key in patch.keys() {
        if key.is_empty() || key.contains('.') || key.starts_with('$') || key.len() > 128 {
            return Err(SessionStoreError::Invalid(format!(
                "metadata key '{}' is not allowed",
                key
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_key_rules() {
        assert!(validate_metadata_keys(&HashMap::from([("step".to_string(), json!(1))])).is_ok());
        for bad in ["", "a.b", "$set"] {
            assert!(validate_metadata_keys(&HashMap::from([(bad.to_string(), json!(1))])).is_err());
        }
    }
}
