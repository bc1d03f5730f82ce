//! Chat routes: the streaming relay and the history listing.
//!
//! `POST /v1/chat/stream` answers with a chunked `text/plain` body carrying
//! the raw provider fragments in arrival order.  Every rejection happens
//! before the first byte, as a JSON error; once streaming has started a
//! failure only ends the body early.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use localfarm_relay::{FARMING_SYSTEM_PROMPT, HistoryStore, ValidationError, assemble, validate};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::middleware::auth::CurrentUser;
use crate::schemas::ErrorResponse;
use crate::schemas::v1::chat::{ChatMessageResponse, ChatStreamRequest, HistoryQuery, HistoryTurn};
use crate::state::AppState;

/// Page size of `GET /v1/chat/history` when `limit` is absent.
pub const DEFAULT_HISTORY_PAGE: u32 = 20;
/// Largest accepted `limit`.
pub const MAX_HISTORY_PAGE: u32 = 100;

#[derive(OpenApi)]
#[openapi(
    paths(chat_stream, chat_history),
    components(schemas(ChatStreamRequest, HistoryTurn, ChatMessageResponse, ErrorResponse))
)]
pub struct ChatApi;

/// Register chat routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/stream", post(chat_stream))
        .route("/chat/history", get(chat_history))
}

/// Stream an answer to the caller's message (`POST /v1/chat/stream`).
///
/// The user turn is stored before the provider is called; the assistant turn
/// is stored once the stream ends, even if the client has gone away.
#[utoipa::path(
    post,
    path = "/v1/chat/stream",
    tag = "chat",
    request_body = ChatStreamRequest,
    responses(
        (status = 200, description = "Answer fragments, streamed as they arrive", content_type = "text/plain", body = String),
        (status = 400, description = "Invalid request body", body = ErrorResponse),
        (status = 401, description = "No identified user", body = ErrorResponse),
        (status = 502, description = "Completion provider failed to start", body = ErrorResponse),
        (status = 503, description = "Chat history unavailable", body = ErrorResponse),
    )
)]
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    body: Bytes,
) -> Result<Response, ServerError> {
    let body: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ValidationError::MalformedBody(e.to_string()))?;
    let input = validate(&body)?;
    debug!(
        user_id = %user_id,
        message_len = input.turn.content.len(),
        history_len = input.history.len(),
        "chat stream request"
    );

    let transcript = assemble(
        FARMING_SYSTEM_PROMPT,
        &input.history,
        input.turn,
        state.config.history_window,
    );

    // One fragment of slack between the relay and the HTTP writer.
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(1);
    let handle = state.engine.relay(user_id, transcript, tx).await?;

    let message_id = handle.user_message_id();
    tokio::spawn(async move {
        if let Err(e) = handle.join().await {
            error!(%message_id, error = %e, "relay task failed");
        }
    });

    Ok((
        [
            (CONTENT_TYPE, "text/plain; charset=utf-8"),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}

/// The caller's most recent messages, oldest first (`GET /v1/chat/history`).
#[utoipa::path(
    get,
    path = "/v1/chat/history",
    tag = "chat",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Most recent messages, oldest first", body = [ChatMessageResponse]),
        (status = 400, description = "Invalid limit", body = ErrorResponse),
        (status = 401, description = "No identified user", body = ErrorResponse),
        (status = 503, description = "Chat history unavailable", body = ErrorResponse),
    )
)]
pub async fn chat_history(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Vec<ChatMessageResponse>>, ServerError> {
    let Query(query) = query.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_PAGE);
    if !(1..=MAX_HISTORY_PAGE).contains(&limit) {
        return Err(ServerError::BadRequest(format!(
            "invalid limit ({limit}): must be between 1 and {MAX_HISTORY_PAGE}"
        )));
    }

    let messages = state.store.list(&user_id, limit as usize).await?;
    Ok(Json(messages.into_iter().map(ChatMessageResponse::from).collect()))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
