//! Session model: a cookie-correlated record of one browser's actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A browser session with its bounded action log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque identifier carried in the session cookie.
    pub id: String,

    /// When the session was created.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    /// Last time the session was read or written; the TTL runs from here.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_accessed: DateTime<Utc>,

    /// Most recent actions, oldest first.
    #[serde(default)]
    pub actions: Vec<SessionAction>,

    /// Free-form client metadata (current step, UI preferences, ...).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Estimated tokens consumed by generations in this session.
    #[serde(default)]
    pub tokens_used: i64,

    /// Number of model calls (text or image) made in this session.
    #[serde(default)]
    pub ml_request_count: i64,
}

/// A single tracked user action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAction {
    pub id: String,

    /// Free-form event tag, e.g. `generate_outline` or `step_change`.
    #[serde(rename = "type")]
    pub action_type: String,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl Session {
    /// Create a new session.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            last_accessed: now,
            actions: Vec::new(),
            metadata: HashMap::new(),
            tokens_used: 0,
            ml_request_count: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_accessed > ttl
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    /// Append an action, dropping the oldest entries beyond `max_actions`.
    pub fn push_action(&mut self, action: SessionAction, max_actions: usize) {
        if action.tokens_used.is_some() || action.duration_ms.is_some() {
            self.ml_request_count += 1;
        }
        self.tokens_used += action.tokens_used.unwrap_or(0);
        self.actions.push(action);

        if self.actions.len() > max_actions {
            let overflow = self.actions.len() - max_actions;
            self.actions.drain(..overflow);
        }
        self.touch();
    }

    /// Shallow-merge metadata; a `null` value removes the key.
    pub fn merge_metadata(&mut self, patch: HashMap<String, serde_json::Value>) {
        for (key, value) in patch {
            if value.is_null() {
                self.metadata.remove(&key);
            } else {
                self.metadata.insert(key, value);
            }
        }
        self.touch();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionAction {
    pub fn new(action_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action_type: action_type.into(),
            timestamp: Utc::now(),
            endpoint: None,
            data,
            result: None,
            tokens_used: None,
            duration_ms: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Attach model-call metrics; marks the action as an ML request.
    pub fn with_metrics(mut self, tokens_used: i64, duration_ms: i64) -> Self {
        self.tokens_used = Some(tokens_used);
        self.duration_ms = Some(duration_ms);
        self
    }
}
