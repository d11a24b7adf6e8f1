//! MongoDB-backed session store.
//!
//! Sessions live in the `sessions` collection. Every write refreshes an
//! `expires_at` date that a TTL index uses to delete idle sessions, and the
//! action log is capped server-side with `$push` + `$slice`, so concurrent
//! appends from several instances never lose entries.

use super::{validate_metadata_keys, SessionPolicy, SessionStore, SessionStoreError};
use crate::models::{Session, SessionAction};
use crate::services::metrics;
use async_trait::async_trait;
use chrono::Utc;
use mongodb::{
    bson::{doc, to_bson, to_document, DateTime as BsonDateTime, Document},
    options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument},
    Client as MongoClient, Collection, Database, IndexModel,
};
use std::collections::HashMap;
use std::time::Duration;

const COLLECTION: &str = "sessions";

#[derive(Clone)]
pub struct MongoSessionStore {
    client: MongoClient,
    db: Database,
    policy: SessionPolicy,
}

fn backend_error(operation: &'static str, e: impl std::fmt::Display) -> SessionStoreError {
    tracing::error!(operation, "Session store operation failed: {}", e);
    metrics::record_session_store_error(operation);
    SessionStoreError::Backend(e.to_string())
}

impl MongoSessionStore {
    pub async fn connect(
        uri: &str,
        database: &str,
        policy: SessionPolicy,
    ) -> Result<Self, SessionStoreError> {
        tracing::info!("Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri)
            .await
            .map_err(|e| backend_error("connect", e))?;
        let db = client.database(database);
        tracing::info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { client, db, policy })
    }

    fn sessions(&self) -> Collection<Session> {
        self.db.collection(COLLECTION)
    }

    fn documents(&self) -> Collection<Document> {
        self.db.collection(COLLECTION)
    }

    fn expires_at(&self) -> BsonDateTime {
        BsonDateTime::from_millis((Utc::now() + self.policy.ttl).timestamp_millis())
    }

    /// Filter matching a live session by id.
    fn live(id: &str) -> Document {
        doc! { "id": id, "expires_at": { "$gt": BsonDateTime::now() } }
    }

    fn touch_fields(&self) -> Document {
        doc! {
            "lastAccessed": Utc::now().timestamp_millis(),
            "expires_at": self.expires_at(),
        }
    }

    async fn create_indexes(&self) -> Result<(), SessionStoreError> {
        tracing::info!("Creating MongoDB indexes for sessions");

        let id_index = IndexModel::builder()
            .keys(doc! { "id": 1 })
            .options(
                IndexOptions::builder()
                    .name("session_id_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();
        self.documents()
            .create_index(id_index, None)
            .await
            .map_err(|e| backend_error("create_index", e))?;

        let ttl_index = IndexModel::builder()
            .keys(doc! { "expires_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("expires_at_ttl_idx".to_string())
                    .expire_after(Duration::from_secs(0))
                    .build(),
            )
            .build();
        self.documents()
            .create_index(ttl_index, None)
            .await
            .map_err(|e| backend_error("create_index", e))?;

        Ok(())
    }
}

#[async_trait]
impl SessionStore for MongoSessionStore {
    async fn init(&self) -> Result<(), SessionStoreError> {
        self.create_indexes().await
    }

    async fn shutdown(&self) {
        tracing::info!("MongoDB session store shutting down");
    }

    async fn create(&self) -> Result<Session, SessionStoreError> {
        let session = Session::new();
        let mut document = to_document(&session).map_err(|e| backend_error("serialize", e))?;
        document.insert("expires_at", self.expires_at());

        self.documents()
            .insert_one(document, None)
            .await
            .map_err(|e| backend_error("insert", e))?;

        tracing::debug!(session_id = %session.id, "Session created");
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, SessionStoreError> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        self.sessions()
            .find_one_and_update(Self::live(id), doc! { "$set": self.touch_fields() }, options)
            .await
            .map_err(|e| backend_error("get", e))
    }

    async fn update_metadata(
        &self,
        id: &str,
        patch: HashMap<String, serde_json::Value>,
    ) -> Result<Session, SessionStoreError> {
        validate_metadata_keys(&patch)?;

        let mut set = self.touch_fields();
        let mut unset = Document::new();
        for (key, value) in patch {
            let path = format!("metadata.{}", key);
            if value.is_null() {
                unset.insert(path, "");
            } else {
                let value = to_bson(&value).map_err(|e| backend_error("serialize", e))?;
                set.insert(path, value);
            }
        }

        let mut update = doc! { "$set": set };
        if !unset.is_empty() {
            update.insert("$unset", unset);
        }

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        self.sessions()
            .find_one_and_update(Self::live(id), update, options)
            .await
            .map_err(|e| backend_error("update_metadata", e))?
            .ok_or_else(|| SessionStoreError::NotFound(id.to_string()))
    }

    async fn append_action(
        &self,
        id: &str,
        action: SessionAction,
    ) -> Result<(), SessionStoreError> {
        let is_ml_request = action.tokens_used.is_some() || action.duration_ms.is_some();
        let tokens = action.tokens_used.unwrap_or(0);
        let ml_requests: i64 = if is_ml_request { 1 } else { 0 };
        let keep_last = -(self.policy.max_actions as i64);
        let action_doc = to_document(&action).map_err(|e| backend_error("serialize", e))?;

        let result = self
            .documents()
            .update_one(
                Self::live(id),
                doc! {
                    "$push": {
                        "actions": {
                            "$each": [action_doc],
                            "$slice": keep_last,
                        }
                    },
                    "$inc": {
                        "tokensUsed": tokens,
                        "mlRequestCount": ml_requests,
                    },
                    "$set": self.touch_fields(),
                },
                None,
            )
            .await
            .map_err(|e| backend_error("append_action", e))?;

        if result.matched_count == 0 {
            return Err(SessionStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, SessionStoreError> {
        let result = self
            .documents()
            .delete_one(doc! { "id": id }, None)
            .await
            .map_err(|e| backend_error("delete", e))?;

        Ok(result.deleted_count > 0)
    }

    async fn purge_expired(&self) -> Result<u64, SessionStoreError> {
        // The TTL monitor runs about once a minute; this makes purges immediate.
        let result = self
            .documents()
            .delete_many(doc! { "expires_at": { "$lte": BsonDateTime::now() } }, None)
            .await
            .map_err(|e| backend_error("purge", e))?;

        Ok(result.deleted_count)
    }

    async fn health_check(&self) -> Result<(), SessionStoreError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| backend_error("ping", e))?;
        Ok(())
    }
}
