//! Wire types for the HTTP API, with their OpenAPI schemas.

pub mod v1;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Body of every error response sent before a stream starts.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable detail.
    pub error: String,
    /// Stable identifier, e.g. `"empty_message"` or `"unauthorized"`.
    pub kind: String,
}
