use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::errors::AppError;
use crate::models::{
    ChatRequest, ChatResponse, FeedbackRequest, FeedbackResponse, RenameRequest, SearchQuery,
    ShareToken, StateResponse,
};
use crate::service::chat_service::ChatService;

// ── Sessions ──────────────────────────────────────────────────────────────────

/// GET `/api/state` — current selection and loading flag
pub async fn state_handler(State(svc): State<ChatService>) -> impl IntoResponse {
    Json(StateResponse {
        current_session_id: svc.store().current_session_id(),
        loading: svc.store().is_loading(),
    })
}

/// GET `/api/sessions?q=` — all sessions, optionally filtered by title
pub async fn list_sessions_handler(
    State(svc): State<ChatService>,
    Query(query): Query<SearchQuery>,
) -> impl IntoResponse {
    Json(svc.store().search_sessions(&query.q))
}

/// POST `/api/sessions` — start a new chat
pub async fn create_session_handler(State(svc): State<ChatService>) -> impl IntoResponse {
    (StatusCode::CREATED, Json(svc.store().create_session()))
}

/// DELETE `/api/sessions` — clear all history
pub async fn clear_sessions_handler(State(svc): State<ChatService>) -> impl IntoResponse {
    Json(svc.store().clear_all())
}

/// GET `/api/sessions/{id}`
pub async fn get_session_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> Response {
    match svc.store().session(&id) {
        Some(session) => Json(session).into_response(),
        None => error_response(&AppError::session_not_found(id)),
    }
}

/// DELETE `/api/sessions/{id}`
pub async fn delete_session_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> Response {
    match svc.store().delete_session(&id) {
        Ok(()) => state_handler(State(svc)).await.into_response(),
        Err(e) => error_response(&e),
    }
}

/// PUT `/api/sessions/{id}/select`
pub async fn select_session_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> Response {
    match svc.store().select_session(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// PUT `/api/sessions/{id}/title` — manual rename
pub async fn rename_session_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
    Json(body): Json<RenameRequest>,
) -> Response {
    match svc.store().set_title(&id, &body.title) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/sessions/{id}/title-suggestions`
pub async fn title_suggestions_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> Response {
    match svc.suggest_titles(&id).await {
        Ok(suggestions) => Json(suggestions).into_response(),
        Err(e) => error_response(&e),
    }
}

/// PUT `/api/sessions/{id}/messages/{message_id}/feedback` — toggles thumbs up/down
pub async fn feedback_handler(
    Path((id, message_id)): Path<(String, String)>,
    State(svc): State<ChatService>,
    Json(body): Json<FeedbackRequest>,
) -> Response {
    match svc.store().set_feedback(&id, &message_id, body.feedback) {
        Ok(feedback) => Json(FeedbackResponse { feedback }).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Sharing ───────────────────────────────────────────────────────────────────

/// POST `/api/sessions/{id}/share` — share token for the session's messages
pub async fn share_session_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> Response {
    match svc.share_session(&id) {
        Ok(token) => Json(ShareToken { token }).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/shared` — open a shared conversation
pub async fn import_shared_handler(
    State(svc): State<ChatService>,
    Json(body): Json<ShareToken>,
) -> Response {
    match svc.store().import_shared(&body.token) {
        Ok(session) => Json(session).into_response(),
        Err(e) => {
            warn!("Rejected shared link: {e}");
            error_response(&e)
        }
    }
}

// ── Chat ──────────────────────────────────────────────────────────────────────

/// POST `/api/chat` — runs a whole turn and returns the final reply
pub async fn chat_handler(
    State(svc): State<ChatService>,
    Json(request): Json<ChatRequest>,
) -> Response {
    match svc.send_message(request.session_id.as_deref(), &request.message).await {
        Ok(outcome) => Json(ChatResponse {
            session_id: outcome.session_id,
            message: outcome.message,
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Helper ────────────────────────────────────────────────────────────────────

fn status_for(err: &AppError) -> StatusCode {
    if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_conflict() {
        StatusCode::CONFLICT
    } else if err.is_too_large() {
        StatusCode::PAYLOAD_TOO_LARGE
    } else if err.is_agent_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

pub(crate) fn error_response(err: &AppError) -> Response {
    (status_for(err), Json(json!({ "error": err.to_string() }))).into_response()
}
