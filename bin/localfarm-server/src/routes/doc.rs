use axum::Json;
use axum::routing::get;
use utoipa::OpenApi;

use crate::routes::{health, v1};

#[derive(OpenApi)]
#[openapi(info(
    title = "localfarm-server",
    description = "LocalFarm farming-assistant chat API",
    version = "0.1.0",
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(v1::api_docs());
    root
}

/// Serves the merged document at `/api-docs/openapi.json`.
pub fn router<S: Clone + Send + Sync + 'static>() -> axum::Router<S> {
    let doc = get_docs();
    axum::Router::new().route("/api-docs/openapi.json", get(move || async move { Json(doc) }))
}
