//! In-memory store for finished presentations, keyed by a client-chosen id.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

const MAX_ID_LEN: usize = 128;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PresentationError {
    #[error("Invalid presentation id: {0}")]
    InvalidId(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPresentation {
    pub id: String,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct PresentationStore {
    items: Arc<DashMap<String, StoredPresentation>>,
}

impl PresentationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_id(id: &str) -> Result<(), PresentationError> {
        let valid = !id.is_empty()
            && id.len() <= MAX_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(PresentationError::InvalidId(id.chars().take(MAX_ID_LEN).collect()))
        }
    }

    /// Insert or replace. Returns the stored record.
    pub fn put(
        &self,
        id: &str,
        data: serde_json::Value,
    ) -> Result<StoredPresentation, PresentationError> {
        Self::check_id(id)?;
        let stored = StoredPresentation {
            id: id.to_string(),
            data,
            updated_at: Utc::now(),
        };
        self.items.insert(id.to_string(), stored.clone());
        Ok(stored)
    }

    pub fn get(&self, id: &str) -> Option<StoredPresentation> {
        self.items.get(id).map(|entry| entry.clone())
    }

    pub fn delete(&self, id: &str) -> bool {
        self.items.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
