//! Application startup and lifecycle management.

use crate::config::{ImageProviderKind, SessionBackend, SlidesConfig, TextProviderKind};
use crate::handlers;
use crate::services::providers::async_image::{AsyncImageConfig, AsyncImageProvider};
use crate::services::providers::credentials::{
    NoCredentials, ServiceAccountCredentials, ServiceAccountKey, StaticApiKey,
};
use crate::services::providers::mock::{MockImageProvider, MockTextProvider};
use crate::services::providers::openai::{OpenAiConfig, OpenAiTextProvider};
use crate::services::providers::{CredentialsProvider, ImageProvider, TextProvider};
use crate::services::sessions::{MemorySessionStore, MongoSessionStore, SessionPolicy};
use crate::services::{
    GenerationRelay, ImageGenerator, ImagePipeline, PollPolicy, PresentationStore, PromptBuilder,
    SessionStore,
};
use crate::services::prompt::PromptTemplates;
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware},
    security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Slide HTML carries inline base64 images, so bodies get large.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SlidesConfig>,
    pub prompts: Arc<PromptBuilder>,
    pub relay: GenerationRelay,
    pub images: ImagePipeline,
    pub sessions: Arc<dyn SessionStore>,
    pub presentations: PresentationStore,
    /// Fires on shutdown; in-flight generations and image jobs hang off it.
    pub shutdown: CancellationToken,
}

/// Model backends selected by configuration.
pub struct Providers {
    pub text: Arc<dyn TextProvider>,
    pub image: Arc<dyn ImageProvider>,
    pub credentials: Arc<dyn CredentialsProvider>,
}

impl Providers {
    pub async fn from_config(config: &SlidesConfig) -> Result<Self, AppError> {
        let text: Arc<dyn TextProvider> = match config.text.kind {
            TextProviderKind::OpenAi => Arc::new(OpenAiTextProvider::new(OpenAiConfig {
                api_base: config.text.api_base.clone(),
                api_key: config.text.api_key.clone(),
                model: config.text.model.clone(),
            })),
            TextProviderKind::Mock => Arc::new(MockTextProvider::new(true)),
        };
        tracing::info!(
            provider = text.name(),
            model = %config.text.model,
            "Initialized text provider"
        );

        let (image, credentials): (Arc<dyn ImageProvider>, Arc<dyn CredentialsProvider>) =
            match config.image.kind {
                ImageProviderKind::Async => (
                    Arc::new(AsyncImageProvider::new(AsyncImageConfig {
                        api_base: config.image.api_base.clone(),
                        operations_base: config.image.operations_base.clone(),
                        model_uri: config.image.model_uri.clone(),
                    })),
                    image_credentials(config).await?,
                ),
                ImageProviderKind::Mock => (
                    Arc::new(MockImageProvider::default()),
                    Arc::new(NoCredentials),
                ),
            };
        tracing::info!(provider = image.name(), "Initialized image provider");

        Ok(Self {
            text,
            image,
            credentials,
        })
    }
}

async fn image_credentials(
    config: &SlidesConfig,
) -> Result<Arc<dyn CredentialsProvider>, AppError> {
    if let Some(key) = &config.image.api_key {
        return Ok(Arc::new(StaticApiKey::new(key.clone())));
    }

    let Some(path) = &config.image.service_account_key_file else {
        return Ok(Arc::new(NoCredentials));
    };

    let key = ServiceAccountKey::from_file(path).await.map_err(|e| {
        tracing::error!("Failed to read service account key {}: {}", path.display(), e);
        AppError::ConfigError(anyhow::anyhow!(e))
    })?;
    let credentials = ServiceAccountCredentials::new(key, config.image.iam_url.clone())
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;

    Ok(Arc::new(credentials))
}

async fn session_store(config: &SlidesConfig) -> Result<Arc<dyn SessionStore>, AppError> {
    let policy = SessionPolicy {
        ttl: config.sessions.ttl,
        max_actions: config.sessions.max_actions,
        ..SessionPolicy::default()
    };

    let store: Arc<dyn SessionStore> = match config.sessions.backend {
        SessionBackend::Memory => Arc::new(MemorySessionStore::new(policy)),
        SessionBackend::Mongo => {
            let uri = config.sessions.mongodb_uri.as_deref().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!("MONGODB_URI is not set"))
            })?;
            Arc::new(
                MongoSessionStore::connect(uri, &config.sessions.mongodb_database, policy)
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to connect to MongoDB: {}", e);
                        AppError::DatabaseError(anyhow::anyhow!(e))
                    })?,
            )
        }
    };
    Ok(store)
}

pub fn build_router(state: AppState) -> Router {
    let generation_limiter = create_ip_rate_limiter(
        state.config.rate_limit.generation_requests,
        state.config.rate_limit.window_seconds,
    );

    // Only model-backed routes are rate limited.
    let generation_routes = Router::new()
        .route("/api/generate", post(handlers::generate::generate))
        .route("/api/generate-images", post(handlers::images::generate_images))
        .route(
            "/api/generate-images/stream",
            post(handlers::images::generate_images_stream),
        )
        .route_layer(from_fn_with_state(
            generation_limiter,
            ip_rate_limit_middleware,
        ));

    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                None
            }
        })
        .collect();

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::health::metrics_handler))
        .merge(generation_routes)
        .route(
            "/api/extract-placeholders",
            post(handlers::images::extract_placeholders),
        )
        .route(
            "/api/sessions",
            post(handlers::sessions::create_session)
                .get(handlers::sessions::get_session)
                .put(handlers::sessions::update_session)
                .delete(handlers::sessions::delete_session),
        )
        .route(
            "/api/presentations/:id",
            put(handlers::presentations::put_presentation)
                .get(handlers::presentations::get_presentation)
                .delete(handlers::presentations::delete_presentation),
        )
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_credentials(true)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    header::HeaderName::from_static("x-request-id"),
                ]),
        )
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with providers and session store chosen by
    /// `config`.
    pub async fn build(config: SlidesConfig) -> Result<Self, AppError> {
        let providers = Providers::from_config(&config).await?;
        let sessions = session_store(&config).await?;
        Self::build_with(config, providers, sessions).await
    }

    /// Build with explicit backends.
    pub async fn build_with(
        config: SlidesConfig,
        providers: Providers,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self, AppError> {
        sessions.init().await.map_err(|e| {
            tracing::error!("Failed to initialize session store: {}", e);
            AppError::from(e)
        })?;

        let policy = PollPolicy {
            interval: config.image.poll_interval,
            max_attempts: config.image.max_poll_attempts,
        };
        let generator = ImageGenerator::new(providers.image, providers.credentials, policy)
            .with_save_dir(config.image.save_dir.clone());

        let state = AppState {
            prompts: Arc::new(PromptBuilder::new(PromptTemplates::builtin())),
            relay: GenerationRelay::new(providers.text, config.text.stream_timeout),
            images: ImagePipeline::new(Arc::new(generator)),
            sessions,
            presentations: PresentationStore::new(),
            shutdown: CancellationToken::new(),
            config: Arc::new(config),
        };

        // Port 0 picks a random port for testing.
        let addr = SocketAddr::from(([0, 0, 0, 0], state.config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Slides service listening on port {}", port);

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Serve until `signal` resolves, then cancel in-flight model work, drain
    /// connections and stop the session store.
    pub async fn run_with_shutdown<F>(self, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.state.shutdown.clone();
        let sessions = self.state.sessions.clone();
        let app = build_router(self.state);

        let result = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            signal.await;
            tracing::info!("Draining connections");
            // Open SSE streams only end once their generations stop.
            shutdown.cancel();
        })
        .await;

        sessions.shutdown().await;
        if let Err(e) = &result {
            tracing::error!("HTTP server error: {}", e);
        }
        result
    }
}
