pub mod generate;
pub mod health;
pub mod images;
pub mod presentations;
pub mod sessions;

use crate::models::SessionAction;
use crate::AppState;
use axum_extra::extract::CookieJar;

pub const SESSION_COOKIE: &str = "slides_session";

/// Session id carried by the request, if any.
pub fn session_id(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .filter(|id| !id.is_empty())
}

/// Best-effort action logging for the caller's session. Requests without a
/// session, or whose session expired, are served normally.
pub async fn track_action(state: &AppState, session_id: Option<&str>, action: SessionAction) {
    let Some(id) = session_id else {
        return;
    };

    if let Err(e) = state.sessions.append_action(id, action).await {
        tracing::debug!(session_id = %id, "Action not tracked: {}", e);
    }
}
