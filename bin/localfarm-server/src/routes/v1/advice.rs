//! One-shot crop advice (`GET /v1/advice/{crop}`).
//!
//! Not part of the chat history: nothing is persisted.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use localfarm_relay::complete_text;
use localfarm_relay::transcript::{DEFAULT_LOCATION, advice};
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::middleware::auth::CurrentUser;
use crate::schemas::ErrorResponse;
use crate::schemas::v1::advice::AdviceResponse;
use crate::state::AppState;

/// Longest accepted crop name, in characters.
const MAX_CROP_CHARS: usize = 64;

#[derive(OpenApi)]
#[openapi(paths(get_advice), components(schemas(AdviceResponse)))]
pub struct AdviceApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/advice/{crop}", get(get_advice))
}

/// Practical advice for growing `crop` in Niigata today.
#[utoipa::path(
    get,
    path = "/v1/advice/{crop}",
    tag = "advice",
    params(("crop" = String, Path, description = "Crop name, e.g. `rice` or `edamame`")),
    responses(
        (status = 200, description = "Advice generated", body = AdviceResponse),
        (status = 400, description = "Invalid crop name", body = ErrorResponse),
        (status = 401, description = "No identified user", body = ErrorResponse),
        (status = 502, description = "Completion provider failed", body = ErrorResponse),
    )
)]
pub async fn get_advice(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(crop): Path<String>,
) -> Result<Json<AdviceResponse>, ServerError> {
    let crop = crop.trim().to_owned();
    if crop.is_empty() || crop.chars().count() > MAX_CROP_CHARS || crop.chars().any(char::is_control) {
        return Err(ServerError::BadRequest(format!(
            "crop must be 1 to {MAX_CROP_CHARS} printable characters"
        )));
    }

    let transcript = advice(&crop, DEFAULT_LOCATION);
    let idle = state.engine.options().provider_idle_timeout;
    let text = complete_text(state.provider(), &transcript, idle).await?;
    info!(user_id = %user_id, crop = %crop, advice_len = text.len(), "advice generated");

    Ok(Json(AdviceResponse {
        crop,
        advice: text,
        timestamp: Utc::now(),
    }))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
