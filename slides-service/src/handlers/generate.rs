use crate::handlers::{session_id, track_action};
use crate::models::{GenerationEvent, GenerationRequest, SessionAction};
use crate::services::providers::GenerationParams;
use crate::services::relay::{system_prompt, RelayRequest};
use crate::AppState;
use axum::{
    extract::State,
    http::{header::HeaderName, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use axum_extra::extract::CookieJar;
use futures::StreamExt;
use serde_json::json;
use service_core::error::AppError;
use validator::Validate;

/// `POST /api/generate`: stream one wizard step as server-sent events.
///
/// Each event's data is a JSON object: `{"chunk": ...}` while text arrives,
/// then exactly one `{"done": true, ...}` or `{"error": ...}`.
pub async fn generate(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<GenerationRequest>,
) -> Result<Response, AppError> {
    let request = request.normalize();
    request.validate()?;

    if request.requires_previous_content() && request.previous_content.is_none() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "previousContent is required for the html_slides step"
        )));
    }

    let step = request.step_type;
    let prompt = state.prompts.build(step, &request);
    tracing::debug!(step = step.as_str(), "Prompt built");

    let relay_request = RelayRequest {
        prompt,
        step,
        language: request.language,
        params: GenerationParams {
            temperature: Some(state.config.text.temperature),
            max_tokens: Some(state.config.text.max_tokens),
            system_prompt: Some(system_prompt(request.language).to_string()),
        },
    };
    let events = state
        .relay
        .stream(relay_request, state.shutdown.child_token());

    let session = session_id(&jar);
    let topic = request.topic.clone();
    // The event goes out before the session write, so a slow store never
    // holds back the terminal event.
    let events = events
        .flat_map(move |event| {
            let data = Event::default().json_data(&event);
            let action = terminal_action(&event, step.as_str(), &topic);
            let state = state.clone();
            let session = session.clone();

            let tracked = futures::stream::once(async move {
                if let Some(action) = action {
                    track_action(&state, session.as_deref(), action).await;
                }
                None
            });
            futures::stream::once(async move { Some(data) }).chain(tracked)
        })
        .filter_map(futures::future::ready);

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    // Keep reverse proxies from buffering the stream.
    response.headers_mut().insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    Ok(response)
}

fn terminal_action(event: &GenerationEvent, step: &str, topic: &str) -> Option<SessionAction> {
    let action = SessionAction::new(
        format!("generate_{}", step),
        json!({ "topic": topic, "stepType": step }),
    )
    .with_endpoint("/api/generate");

    match event {
        GenerationEvent::Chunk { .. } => None,
        GenerationEvent::Done {
            tokens_used,
            duration,
            ..
        } => Some(
            action
                .with_result(json!({ "success": true }))
                .with_metrics(*tokens_used as i64, *duration as i64),
        ),
        GenerationEvent::Error { error } => {
            Some(action.with_result(json!({ "success": false, "error": error })))
        }
    }
}
