use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response body for `GET /v1/advice/{crop}`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AdviceResponse {
    pub crop: String,
    pub advice: String,
    pub timestamp: DateTime<Utc>,
}
