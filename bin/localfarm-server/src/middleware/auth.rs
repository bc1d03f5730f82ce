//! Request identity.
//!
//! Handlers take a [`CurrentUser`] argument; extraction fails with `401`
//! before the handler body runs, so an unidentified request never causes a
//! side effect.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use localfarm_relay::UserId;
use tracing::debug;

use crate::config::Config;
use crate::error::ServerError;
use crate::state::AppState;

/// Maps request credentials to the user who owns the chat history.
pub trait IdentityResolver: Send + Sync + 'static {
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId>;
}

/// Bearer tokens from configuration, with an optional development fallback.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, UserId>,
    fallback: Option<UserId>,
}

impl StaticTokenResolver {
    pub fn new(tokens: impl IntoIterator<Item = (String, UserId)>, fallback: Option<UserId>) -> Self {
        Self { tokens: tokens.into_iter().collect(), fallback }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .api_tokens
                .iter()
                .map(|(token, user)| (token.clone(), UserId::new(user.as_str()))),
            config.dev_user_id(),
        )
    }
}

impl IdentityResolver for StaticTokenResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);

        match token.and_then(|t| self.tokens.get(t)) {
            Some(user) => Some(user.clone()),
            None => self.fallback.clone(),
        }
    }
}

/// The identified caller of a request.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserId);

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        match state.identity.resolve(&parts.headers) {
            Some(user) => Ok(CurrentUser(user)),
            None => {
                debug!(path = %parts.uri.path(), "request without a recognised user");
                Err(ServerError::Unauthorized("authentication required".into()))
            }
        }
    }
}
