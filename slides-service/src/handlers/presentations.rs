use crate::services::presentations::{PresentationError, StoredPresentation};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;

impl From<PresentationError> for AppError {
    fn from(err: PresentationError) -> Self {
        AppError::BadRequest(anyhow::anyhow!(err))
    }
}

/// `PUT /api/presentations/:id`
pub async fn put_presentation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(data): Json<serde_json::Value>,
) -> Result<Json<StoredPresentation>, AppError> {
    let stored = state.presentations.put(&id, data)?;
    tracing::debug!(presentation_id = %id, "Presentation saved");
    Ok(Json(stored))
}

/// `GET /api/presentations/:id`
pub async fn get_presentation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StoredPresentation>, AppError> {
    state
        .presentations
        .get(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Presentation '{}' not found", id)))
}

/// `DELETE /api/presentations/:id`
pub async fn delete_presentation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.presentations.delete(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(anyhow::anyhow!(
            "Presentation '{}' not found",
            id
        )))
    }
}
