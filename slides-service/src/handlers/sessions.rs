use crate::handlers::{session_id, SESSION_COOKIE};
use crate::models::{Session, SessionAction};
use crate::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::HashMap;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct ActionInput {
    #[serde(rename = "type")]
    #[validate(length(min = 1, max = 64, message = "action type must be 1-64 characters"))]
    pub action_type: String,

    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateSessionRequest {
    /// Shallow-merged into the session metadata; `null` removes a key.
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,

    #[serde(default)]
    #[validate(nested)]
    pub action: Option<ActionInput>,
}

fn session_cookie(state: &AppState, id: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, id))
        .path("/")
        .http_only(true)
        .secure(state.config.sessions.cookie_secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(
            state.config.sessions.ttl.num_seconds(),
        ))
        .build()
}

async fn current_session(state: &AppState, jar: &CookieJar) -> Result<Session, AppError> {
    let id = session_id(jar)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No active session")))?;

    state
        .sessions
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Session expired or unknown")))
}

/// `POST /api/sessions`: resume the cookie's session or start a new one.
pub async fn create_session(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Response, AppError> {
    if let Some(id) = session_id(&jar) {
        if let Some(session) = state.sessions.get(&id).await? {
            // Re-issue the cookie so its lifetime follows the session's.
            let jar = jar.add(session_cookie(&state, session.id.clone()));
            return Ok((StatusCode::OK, jar, Json(session)).into_response());
        }
    }

    let session = state.sessions.create().await?;
    tracing::info!(session_id = %session.id, "Session started");
    let jar = jar.add(session_cookie(&state, session.id.clone()));

    Ok((StatusCode::CREATED, jar, Json(session)).into_response())
}

/// `GET /api/sessions`
pub async fn get_session(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Json<Session>, AppError> {
    Ok(Json(current_session(&state, &jar).await?))
}

/// `PUT /api/sessions`: patch metadata and/or log a client action.
pub async fn update_session(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<UpdateSessionRequest>,
) -> Result<Json<Session>, AppError> {
    request.validate()?;
    let id = current_session(&state, &jar).await?.id;

    if let Some(metadata) = request.metadata {
        state.sessions.update_metadata(&id, metadata).await?;
    }

    if let Some(input) = request.action {
        let mut action = SessionAction::new(input.action_type, input.data);
        if let Some(endpoint) = input.endpoint {
            action = action.with_endpoint(endpoint);
        }
        state.sessions.append_action(&id, action).await?;
    }

    Ok(Json(current_session(&state, &jar).await?))
}

/// `DELETE /api/sessions`: forget the session and clear the cookie.
pub async fn delete_session(State(state): State<AppState>, jar: CookieJar) -> Result<Response, AppError> {
    if let Some(id) = session_id(&jar) {
        if state.sessions.delete(&id).await? {
            tracing::info!(session_id = %id, "Session deleted");
        }
    }

    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    Ok((StatusCode::NO_CONTENT, jar).into_response())
}
