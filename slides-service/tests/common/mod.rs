#![allow(dead_code)]

use slides_service::config::{
    ImageProviderConfig, ImageProviderKind, RateLimitConfig, SessionBackend, SessionConfig,
    SlidesConfig, TextProviderConfig, TextProviderKind,
};
use slides_service::services::providers::credentials::NoCredentials;
use slides_service::services::providers::mock::{MockImageProvider, MockTextProvider};
use slides_service::services::sessions::{MemorySessionStore, SessionPolicy};
use slides_service::services::SessionStore;
use slides_service::startup::{Application, Providers};
use service_core::config::Config as CoreConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: reqwest::Client,
    shutdown: Option<oneshot::Sender<()>>,
}

pub fn test_config() -> SlidesConfig {
    SlidesConfig {
        common: CoreConfig {
            port: 0, // Random port for testing
            log_level: "info".to_string(),
            otlp_endpoint: None,
        },
        text: TextProviderConfig {
            kind: TextProviderKind::Mock,
            api_base: "http://127.0.0.1:9".to_string(),
            api_key: String::new(),
            model: "mock".to_string(),
            temperature: 0.7,
            max_tokens: 4_000,
            stream_timeout: Duration::from_secs(30),
        },
        image: ImageProviderConfig {
            kind: ImageProviderKind::Mock,
            api_base: "http://127.0.0.1:9".to_string(),
            operations_base: "http://127.0.0.1:9".to_string(),
            model_uri: String::new(),
            api_key: None,
            service_account_key_file: None,
            iam_url: "http://127.0.0.1:9".to_string(),
            poll_interval: Duration::from_millis(5),
            max_poll_attempts: 10,
            save_dir: None,
        },
        sessions: SessionConfig {
            backend: SessionBackend::Memory,
            mongodb_uri: None,
            mongodb_database: "slides_test".to_string(),
            ttl: chrono::Duration::days(7),
            max_actions: 100,
            cookie_secure: false,
        },
        rate_limit: RateLimitConfig {
            generation_requests: 100,
            window_seconds: 60,
        },
        allowed_origins: vec!["http://localhost:3000".to_string()],
    }
}

pub fn memory_store(config: &SlidesConfig) -> MemorySessionStore {
    MemorySessionStore::new(SessionPolicy {
        ttl: config.sessions.ttl,
        max_actions: config.sessions.max_actions,
        ..SessionPolicy::default()
    })
}

pub fn mock_providers() -> Providers {
    Providers {
        text: Arc::new(MockTextProvider::new(true)),
        image: Arc::new(MockImageProvider::new(1).failing_on("FAIL")),
        credentials: Arc::new(NoCredentials),
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config(), mock_providers()).await
    }

    pub async fn spawn_with(config: SlidesConfig, providers: Providers) -> Self {
        let sessions = Arc::new(memory_store(&config));
        Self::spawn_with_store(config, providers, sessions).await
    }

    pub async fn spawn_with_store(
        config: SlidesConfig,
        providers: Providers,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let app = Application::build_with(config, providers, sessions)
            .await
            .expect("Failed to build test application");
        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            app.run_with_shutdown(async {
                let _ = rx.await;
            })
            .await
            .ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        TestApp {
            address,
            port,
            client,
            shutdown: Some(tx),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub async fn post_json(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// JSON payloads of every `data:` line in an SSE body.
pub fn sse_events(body: &str) -> Vec<serde_json::Value> {
    body.split("\n\n")
        .flat_map(|event| event.lines())
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("SSE data is not JSON"))
        .collect()
}

/// `name=value` of the session cookie set by a response.
pub fn session_cookie(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("slides_session="))
        .and_then(|v| v.split(';').next())
        .map(|pair| pair.to_string())
}
