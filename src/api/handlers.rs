//! HTTP request handlers: session lifecycle, instruction submission,
//! SSE streaming, and confirmation/cancellation of an in-flight turn.

use super::sse::sse_stream;
use super::types::{
    CancelResponse, CompactResponse, ConfirmationRequest, CreateSessionRequest, ErrorResponse,
    InstructionRequest, InstructionResponse, ModelsResponse, SessionListResponse, SessionResponse,
};
use super::AppState;
use crate::runtime;
use crate::state_machine::Event;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::path::PathBuf;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/stream", get(stream_session))
        .route("/api/sessions/:id/instruction", post(send_instruction))
        .route("/api/sessions/:id/confirmation", post(resolve_confirmation))
        .route("/api/sessions/:id/cancel", post(cancel_session))
        .route("/api/sessions/:id/compact", post(compact_session))
        .route("/api/models", get(list_models))
        .with_state(state)
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    match state
        .sessions
        .create(PathBuf::from(req.cwd), req.model, req.display_name)
        .await
    {
        Ok(session) => Json(SessionResponse {
            session_id: session.id.clone(),
            cwd: session.workspace.root().display().to_string(),
            model: session.model_id.clone(),
        })
        .into_response(),
        Err(err) => session_error_response(err),
    }
}

async fn list_sessions(State(state): State<AppState>) -> Response {
    let ids = state.sessions.list_ids().await;
    Json(SessionListResponse { session_ids: ids }).into_response()
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.sessions.get_or_restore(&id).await {
        Ok(session) => Json(SessionResponse {
            session_id: session.id.clone(),
            cwd: session.workspace.root().display().to_string(),
            model: session.model_id.clone(),
        })
        .into_response(),
        Err(err) => session_error_response(err),
    }
}

async fn stream_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.sessions.get_or_restore(&id).await {
        Ok(session) => {
            let (_id, rx) = session.events.subscribe().await;
            sse_stream(rx).into_response()
        }
        Err(err) => session_error_response(err),
    }
}

async fn send_instruction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InstructionRequest>,
) -> Response {
    let session = match state.sessions.get_or_restore(&id).await {
        Ok(session) => session,
        Err(err) => return session_error_response(err),
    };

    let event = Event::UserMessage {
        text: req.text,
        attachments: req.attachments,
    };

    match runtime::run_turn_loop(session.clone(), event).await {
        Ok(result) => {
            let history = session.inner.lock().await.history.clone();
            if let Err(err) = state.sessions.store().save_state(&session.id, &history).await {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse::new(err.to_string())),
                )
                    .into_response();
            }
            Json(InstructionResponse { result }).into_response()
        }
        Err(err) => executor_error_response(err),
    }
}

async fn resolve_confirmation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmationRequest>,
) -> Response {
    let session = match state.sessions.get_or_restore(&id).await {
        Ok(session) => session,
        Err(err) => return session_error_response(err),
    };
    match runtime::submit_confirmation(&session, req.policy).await {
        Ok(()) => Json(CancelResponse { ok: true }).into_response(),
        Err(err) => executor_error_response(err),
    }
}

async fn cancel_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let session = match state.sessions.get_or_restore(&id).await {
        Ok(session) => session,
        Err(err) => return session_error_response(err),
    };
    runtime::cancel(&session).await;
    Json(CancelResponse { ok: true }).into_response()
}

/// User-initiated `/compact`: always a full-history summary, independent
/// of the auto-triggered todo-aware path the turn loop uses on its own.
/// Refused while a turn is in flight for this session.
async fn compact_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let session = match state.sessions.get_or_restore(&id).await {
        Ok(session) => session,
        Err(err) => return session_error_response(err),
    };

    let Ok(_guard) = session.turn_lock.try_lock() else {
        return (
            StatusCode::CONFLICT,
            Json(ErrorResponse::new(
                "session is busy; cancel the current operation before compacting",
            )),
        )
            .into_response();
    };

    let mut inner = session.inner.lock().await;
    let compacted = match session
        .context_manager
        .full_history_compact(&inner.history, &session.llm)
        .await
    {
        Ok(compacted) => compacted,
        Err(err) => {
            return (StatusCode::BAD_GATEWAY, Json(ErrorResponse::new(err.to_string())))
                .into_response()
        }
    };
    let turn_count = compacted.turn_count;
    inner.history = compacted.clone();
    drop(inner);

    if let Err(err) = state.sessions.store().save_state(&session.id, &compacted).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(err.to_string())),
        )
            .into_response();
    }

    Json(CompactResponse { turn_count }).into_response()
}

async fn list_models(State(state): State<AppState>) -> Response {
    Json(ModelsResponse {
        models: state.llm_registry.available_model_info(),
        default: state.llm_registry.default_model_id().to_string(),
    })
    .into_response()
}

fn session_error_response(err: crate::session::SessionError) -> Response {
    use crate::session::SessionError;
    let status = match err {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::NoModelAvailable => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::Store(_) => StatusCode::NOT_FOUND,
        SessionError::Workspace(_) => StatusCode::BAD_REQUEST,
        SessionError::WorkspaceInUse(_) => StatusCode::CONFLICT,
    };
    (status, Json(ErrorResponse::new(err.to_string()))).into_response()
}

fn executor_error_response(err: runtime::ExecutorError) -> Response {
    use runtime::ExecutorError;
    let status = match err {
        ExecutorError::Busy => StatusCode::CONFLICT,
        ExecutorError::Protocol(_) => StatusCode::BAD_REQUEST,
        ExecutorError::ContextExhausted(_) => StatusCode::PAYLOAD_TOO_LARGE,
        ExecutorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse::new(err.to_string()))).into_response()
}
