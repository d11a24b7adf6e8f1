use crate::services::metrics::get_metrics;
use crate::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Liveness probe; reports the session store and the configured providers.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.sessions.health_check().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "slides-service",
                "version": env!("CARGO_PKG_VERSION"),
                "textProvider": state.relay.provider().name(),
                "imageProvider": state.images.provider_name(),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "service": "slides-service",
                "error": e.to_string()
            })),
        ),
    }
}

/// Readiness probe: the session store must answer and we must not be draining.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match state.sessions.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
