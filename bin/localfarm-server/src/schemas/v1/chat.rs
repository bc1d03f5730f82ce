//! Chat request / response types.
//!
//! Field names follow the browser client: the stream request uses
//! `message` / `history`, history rows are camelCase.

use chrono::{DateTime, Utc};
use localfarm_relay::ChatMessage;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// One prior turn supplied by the client.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HistoryTurn {
    /// `"user"` or `"assistant"`.
    pub role: String,
    pub content: String,
}

/// Request body for `POST /v1/chat/stream`.
///
/// Documented here; the handler validates the raw JSON so every rejection
/// carries a precise `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatStreamRequest {
    /// The new user message (trimmed, non-empty, at most 128 KiB).
    pub message: String,
    /// Prior turns, oldest first. Only the most recent ones are sent on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryTurn>>,
}

/// Query string of `GET /v1/chat/history`.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// Number of most recent messages to return (1–100, default 20).
    pub limit: Option<u32>,
}

/// One persisted message.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageResponse {
    pub id: Uuid,
    pub user_id: String,
    /// `"user"` or `"assistant"`.
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<ChatMessage> for ChatMessageResponse {
    fn from(message: ChatMessage) -> Self {
        Self {
            id: message.id,
            user_id: message.user_id.to_string(),
            role: message.role.to_string(),
            content: message.content,
            created_at: message.created_at,
        }
    }
}
