use crate::handlers::{session_id, track_action};
use crate::models::{ImagePlaceholder, SessionAction};
use crate::services::pipeline::{BatchProgress, BatchSummary, PipelineError, PlaceholderOutcome};
use crate::services::placeholders::extract;
use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use axum_extra::extract::CookieJar;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GenerateImagesRequest {
    #[validate(length(min = 1, message = "htmlContent is required"))]
    pub html_content: String,

    /// Index into the placeholders of `html_content`.
    #[serde(default)]
    pub placeholder_index: Option<usize>,

    /// Descriptor from a previous `extract-placeholders` call.
    #[serde(default)]
    pub placeholder: Option<ImagePlaceholder>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateImagesResponse {
    pub success: bool,
    pub html_content: String,
    pub images_generated: usize,
    pub total_placeholders: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder_generated: Option<PlaceholderOutcome>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExtractRequest {
    #[validate(length(min = 1, message = "htmlContent is required"))]
    pub html_content: String,
}

#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub count: usize,
    pub placeholders: Vec<ImagePlaceholder>,
}

/// Events of `POST /api/generate-images/stream`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageStreamEvent {
    Started { total: usize },
    Progress(BatchProgress),
    Done(BatchSummary),
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::IndexOutOfRange { .. } | PipelineError::PlaceholderNotFound => {
                AppError::BadRequest(anyhow::anyhow!(err))
            }
            PipelineError::Cancelled => AppError::ServiceUnavailable,
        }
    }
}

/// `POST /api/generate-images`.
///
/// With `placeholder` or `placeholderIndex` a single image is generated;
/// with neither, every placeholder in the document is processed in order.
pub async fn generate_images(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<GenerateImagesRequest>,
) -> Result<Json<GenerateImagesResponse>, AppError> {
    request.validate()?;
    let started = Instant::now();
    let cancel = state.shutdown.child_token();
    let total_placeholders = extract(&request.html_content).len();

    let response = match (request.placeholder, request.placeholder_index) {
        (Some(placeholder), _) => {
            let (html_content, outcome) = state
                .images
                .resolve_descriptor(&request.html_content, placeholder, &cancel)
                .await?;
            single_response(html_content, total_placeholders, outcome)
        }
        (None, Some(index)) => {
            let (html_content, outcome) = state
                .images
                .resolve_index(&request.html_content, index, &cancel)
                .await?;
            single_response(html_content, total_placeholders, outcome)
        }
        (None, None) => {
            let summary = state
                .images
                .resolve_all(request.html_content, cancel)
                .await?;
            GenerateImagesResponse {
                success: true,
                html_content: summary.html_content,
                images_generated: summary.images_generated,
                total_placeholders: summary.total_placeholders,
                placeholder_generated: None,
            }
        }
    };

    tracing::info!(
        total = response.total_placeholders,
        generated = response.images_generated,
        "Image generation request finished"
    );

    let action = SessionAction::new(
        "generate_images",
        json!({
            "totalPlaceholders": response.total_placeholders,
            "placeholderIndex": request.placeholder_index,
        }),
    )
    .with_endpoint("/api/generate-images")
    .with_result(json!({ "imagesGenerated": response.images_generated }))
    .with_metrics(0, started.elapsed().as_millis() as i64);
    track_action(&state, session_id(&jar).as_deref(), action).await;

    Ok(Json(response))
}

fn single_response(
    html_content: String,
    total_placeholders: usize,
    outcome: PlaceholderOutcome,
) -> GenerateImagesResponse {
    GenerateImagesResponse {
        success: true,
        html_content,
        images_generated: usize::from(outcome.result.is_generated()),
        total_placeholders,
        placeholder_generated: Some(outcome),
    }
}

/// `POST /api/generate-images/stream`: like the batch mode of
/// [`generate_images`], but reports progress after every placeholder.
pub async fn generate_images_stream(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<ExtractRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    request.validate()?;

    let (tx, rx) = mpsc::channel::<ImageStreamEvent>(8);
    let cancel = state.shutdown.child_token();
    let session = session_id(&jar);
    let html = request.html_content;
    let total = extract(&html).len();

    tokio::spawn(async move {
        let started = Instant::now();
        let mut summary = BatchSummary {
            html_content: html.clone(),
            total_placeholders: total,
            images_generated: 0,
            images_failed: 0,
        };

        if tx.send(ImageStreamEvent::Started { total }).await.is_err() {
            return;
        }

        let progress = state.images.resolve_all_stream(html, cancel.clone());
        futures::pin_mut!(progress);
        loop {
            let next = tokio::select! {
                next = progress.next() => next,
                _ = tx.closed() => {
                    tracing::debug!("Image stream client went away");
                    cancel.cancel();
                    return;
                }
            };
            let Some(step) = next else {
                break;
            };

            if !step.outcome.result.is_generated() {
                summary.images_failed += 1;
            }
            summary.images_generated = step.images_generated;
            summary.html_content = step.html_content.clone();
            if tx.send(ImageStreamEvent::Progress(step)).await.is_err() {
                cancel.cancel();
                return;
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        let action = SessionAction::new("generate_images", json!({ "totalPlaceholders": total }))
            .with_endpoint("/api/generate-images/stream")
            .with_result(json!({
                "imagesGenerated": summary.images_generated,
                "imagesFailed": summary.images_failed,
            }))
            .with_metrics(0, started.elapsed().as_millis() as i64);
        let _ = tx.send(ImageStreamEvent::Done(summary)).await;
        track_action(&state, session.as_deref(), action).await;
    });

    let events = ReceiverStream::new(rx).map(|event| Event::default().json_data(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// `POST /api/extract-placeholders`.
pub async fn extract_placeholders(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<ExtractRequest>,
) -> Result<Json<ExtractResponse>, AppError> {
    request.validate()?;
    let placeholders = extract(&request.html_content);

    let action = SessionAction::new(
        "extract_placeholders",
        json!({ "count": placeholders.len() }),
    )
    .with_endpoint("/api/extract-placeholders");
    track_action(&state, session_id(&jar).as_deref(), action).await;

    Ok(Json(ExtractResponse {
        count: placeholders.len(),
        placeholders,
    }))
}
