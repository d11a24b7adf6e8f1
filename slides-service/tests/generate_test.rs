mod common;

use async_trait::async_trait;
use common::{memory_store, mock_providers, session_cookie, sse_events, test_config, TestApp};
use serde_json::json;
use slides_service::models::{Session, SessionAction};
use slides_service::services::providers::mock::MockTextProvider;
use slides_service::services::sessions::{MemorySessionStore, SessionStoreError};
use slides_service::services::SessionStore;
use slides_service::startup::Providers;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Memory store whose action log writes hang, like an unreachable database.
struct SlowActionStore {
    inner: MemorySessionStore,
    delay: Duration,
}

#[async_trait]
impl SessionStore for SlowActionStore {
    async fn init(&self) -> Result<(), SessionStoreError> {
        self.inner.init().await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    async fn create(&self) -> Result<Session, SessionStoreError> {
        self.inner.create().await
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, SessionStoreError> {
        self.inner.get(id).await
    }

    async fn update_metadata(
        &self,
        id: &str,
        patch: HashMap<String, serde_json::Value>,
    ) -> Result<Session, SessionStoreError> {
        self.inner.update_metadata(id, patch).await
    }

    async fn append_action(
        &self,
        id: &str,
        action: SessionAction,
    ) -> Result<(), SessionStoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.append_action(id, action).await
    }

    async fn delete(&self, id: &str) -> Result<bool, SessionStoreError> {
        self.inner.delete(id).await
    }

    async fn purge_expired(&self) -> Result<u64, SessionStoreError> {
        self.inner.purge_expired().await
    }

    async fn health_check(&self) -> Result<(), SessionStoreError> {
        self.inner.health_check().await
    }
}

#[tokio::test]
async fn generate_streams_chunks_then_done() {
    let app = TestApp::spawn().await;

    let response = app
        .post_json(
            "/api/generate",
            json!({ "topic": "Cats in space", "stepType": "outline", "duration": 10 }),
        )
        .await;

    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");

    let events = sse_events(&response.text().await.unwrap());
    let (last, chunks) = events.split_last().expect("no events");

    assert!(!chunks.is_empty());
    let streamed: String = chunks
        .iter()
        .map(|e| e["chunk"].as_str().expect("chunk event"))
        .collect();

    assert_eq!(last["done"], true);
    assert_eq!(last["content"], streamed.as_str());
    assert!(streamed.starts_with("Mock streaming response for:"));
    assert_eq!(
        last["tokensUsed"],
        (streamed.encode_utf16().count() / 4) as u64
    );
    assert!(last["duration"].is_u64());

    app.stop().await;
}

#[tokio::test]
async fn generate_rejects_blank_topic() {
    let app = TestApp::spawn().await;

    let response = app
        .post_json("/api/generate", json!({ "topic": "   ", "stepType": "speech" }))
        .await;

    assert_eq!(response.status(), 422);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Validation error");

    app.stop().await;
}

#[tokio::test]
async fn html_slides_requires_previous_content() {
    let app = TestApp::spawn().await;

    let response = app
        .post_json(
            "/api/generate",
            json!({ "topic": "Cats", "stepType": "html_slides", "previousContent": "  " }),
        )
        .await;

    assert_eq!(response.status(), 400);

    app.stop().await;
}

#[tokio::test]
async fn unknown_step_type_falls_back_to_outline() {
    let app = TestApp::spawn().await;

    let response = app
        .post_json(
            "/api/generate",
            json!({ "topic": "Cats", "stepType": "mystery", "language": "xx" }),
        )
        .await;

    assert_eq!(response.status(), 200);
    let events = sse_events(&response.text().await.unwrap());
    assert_eq!(events.last().unwrap()["done"], true);

    app.stop().await;
}

#[tokio::test]
async fn provider_failure_ends_stream_with_error_event() {
    let providers = Providers {
        text: Arc::new(MockTextProvider::with_chunks(["Slide 1", "Slide 2"]).failing_after(1)),
        ..mock_providers()
    };
    let app = TestApp::spawn_with(test_config(), providers).await;

    let response = app
        .post_json("/api/generate", json!({ "topic": "Cats" }))
        .await;
    assert_eq!(response.status(), 200);

    let events = sse_events(&response.text().await.unwrap());
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["chunk"], "Slide 1");
    assert!(events[1]["error"].as_str().unwrap().starts_with("Error:"));
    assert!(events.iter().all(|e| e.get("done").is_none()));

    app.stop().await;
}

#[tokio::test]
async fn generation_routes_are_rate_limited() {
    let mut config = test_config();
    config.rate_limit.generation_requests = 1;
    let app = TestApp::spawn_with(config, mock_providers()).await;

    let first = app
        .post_json("/api/generate", json!({ "topic": "Cats" }))
        .await;
    assert_eq!(first.status(), 200);
    let _ = first.text().await;

    let second = app
        .post_json("/api/generate", json!({ "topic": "Cats" }))
        .await;
    assert_eq!(second.status(), 429);
    assert!(second.headers().contains_key("retry-after"));

    // Non-model routes are not limited.
    let extract = app
        .post_json("/api/extract-placeholders", json!({ "htmlContent": "<p>x</p>" }))
        .await;
    assert_eq!(extract.status(), 200);

    app.stop().await;
}

#[tokio::test]
async fn done_event_is_not_held_back_by_session_tracking() {
    let config = test_config();
    let sessions = Arc::new(SlowActionStore {
        inner: memory_store(&config),
        delay: Duration::from_secs(5),
    });
    let app = TestApp::spawn_with_store(config, mock_providers(), sessions).await;

    let created = app.client.post(app.url("/api/sessions")).send().await.unwrap();
    let cookie = session_cookie(&created).expect("session cookie");

    let started = Instant::now();
    let mut response = app
        .client
        .post(app.url("/api/generate"))
        .header("cookie", cookie)
        .json(&json!({ "topic": "Cats" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let mut body = String::new();
    let saw_done = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(chunk) = response.chunk().await.unwrap() {
            body.push_str(&String::from_utf8_lossy(&chunk));
            if body.contains("\"done\":true") {
                return true;
            }
        }
        false
    })
    .await;

    assert_eq!(saw_done, Ok(true));
    assert!(started.elapsed() < Duration::from_secs(3));

    app.stop().await;
}
