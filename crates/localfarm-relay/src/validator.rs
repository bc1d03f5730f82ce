//! Shape and size checks for an inbound chat request.
//!
//! Runs on the raw JSON body so that malformed history entries are reported
//! with their index instead of as a generic deserialisation failure.

use serde_json::Value;

use crate::error::ValidationError;
use crate::types::{Role, Turn};

/// Maximum accepted size of the new user message (128 KiB).
pub const MAX_MESSAGE_BYTES: usize = 128 * 1024;

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatInput {
    /// The new user turn, trimmed.
    pub turn: Turn,
    /// Prior turns as supplied by the client, in conversation order.
    pub history: Vec<Turn>,
}

/// Validate a request body of the form `{ message, history? }`.
pub fn validate(body: &Value) -> Result<ChatInput, ValidationError> {
    let obj = body
        .as_object()
        .ok_or_else(|| ValidationError::MalformedBody("expected a JSON object".into()))?;

    let message = match obj.get("message") {
        None | Some(Value::Null) => return Err(ValidationError::EmptyMessage),
        Some(Value::String(s)) => s.trim(),
        Some(_) => {
            return Err(ValidationError::MalformedBody("`message` must be a string".into()));
        }
    };
    if message.is_empty() {
        return Err(ValidationError::EmptyMessage);
    }
    if message.len() > MAX_MESSAGE_BYTES {
        return Err(ValidationError::MessageTooLong {
            len: message.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }

    let history = match obj.get("history") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .iter()
            .enumerate()
            .map(|(index, entry)| history_entry(index, entry))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(ValidationError::MalformedBody("`history` must be an array".into()));
        }
    };

    Ok(ChatInput { turn: Turn::user(message), history })
}

fn history_entry(index: usize, entry: &Value) -> Result<Turn, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidHistoryEntry {
        index,
        reason: reason.to_owned(),
    };

    let obj = entry.as_object().ok_or_else(|| invalid("expected an object"))?;
    let role = match obj.get("role").and_then(Value::as_str) {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        Some(_) => return Err(invalid("role must be \"user\" or \"assistant\"")),
        None => return Err(invalid("missing string field `role`")),
    };
    let content = obj
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing string field `content`"))?;

    Ok(Turn::new(role, content))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
