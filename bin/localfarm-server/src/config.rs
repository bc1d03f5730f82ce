//! Server configuration, loaded from environment variables at startup.

use std::collections::HashMap;
use std::time::Duration;

use localfarm_relay::provider::openai::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use localfarm_relay::{DEFAULT_HISTORY_WINDOW, OpenAiConfig, RelayOptions, UserId};

/// Runtime configuration for localfarm-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// SQLite database URL (default: `"sqlite://localfarm.db"`).
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Directory for daily-rolling log files; stdout only when unset.
    pub log_dir: Option<String>,

    /// Comma-separated list of allowed CORS origins.
    pub cors_allowed_origins: Option<String>,

    /// Serve the OpenAPI document at `/api-docs/openapi.json`.
    pub enable_docs: bool,

    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,

    /// Number of prior turns kept in the prompt.
    pub history_window: usize,

    /// Seconds to wait for the next provider fragment.
    pub provider_idle_secs: u64,

    /// Seconds to wait for the client to accept one fragment.
    pub client_write_secs: u64,

    /// Inline marker written when the provider breaks mid-stream.
    pub stream_error_trailer: Option<String>,

    /// Bearer token → user id.
    pub api_tokens: HashMap<String, String>,

    /// User assumed for requests without a recognised token.
    pub dev_user: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("LOCALFARM_BIND", "0.0.0.0:3000"),
            database_url: env_or("LOCALFARM_DATABASE_URL", "sqlite://localfarm.db"),
            log_level: env_or("LOCALFARM_LOG", "info"),
            log_json: flag_env("LOCALFARM_LOG_JSON", false),
            log_dir: optional_env("LOCALFARM_LOG_DIR"),
            cors_allowed_origins: Some(env_or("LOCALFARM_CORS_ORIGINS", "http://localhost:3001")),
            enable_docs: flag_env("LOCALFARM_ENABLE_DOCS", true),
            openai_api_key: optional_env("LOCALFARM_OPENAI_API_KEY")
                .or_else(|| optional_env("OPENAI_API_KEY")),
            openai_base_url: env_or("LOCALFARM_OPENAI_BASE_URL", DEFAULT_BASE_URL),
            model: env_or("LOCALFARM_MODEL", DEFAULT_MODEL),
            temperature: parse_env("LOCALFARM_TEMPERATURE", 0.7),
            max_tokens: parse_env("LOCALFARM_MAX_TOKENS", 500),
            history_window: parse_env("LOCALFARM_HISTORY_WINDOW", DEFAULT_HISTORY_WINDOW),
            provider_idle_secs: parse_env("LOCALFARM_PROVIDER_IDLE_SECS", 60),
            client_write_secs: parse_env("LOCALFARM_CLIENT_WRITE_SECS", 30),
            stream_error_trailer: optional_env("LOCALFARM_STREAM_ERROR_TRAILER"),
            api_tokens: optional_env("LOCALFARM_API_TOKENS")
                .map(|raw| parse_token_map(&raw))
                .unwrap_or_default(),
            dev_user: optional_env("LOCALFARM_DEV_USER"),
        }
    }

    pub fn openai(&self) -> OpenAiConfig {
        OpenAiConfig {
            api_key: self.openai_api_key.clone(),
            base_url: self.openai_base_url.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..OpenAiConfig::default()
        }
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            provider_idle_timeout: Duration::from_secs(self.provider_idle_secs),
            client_write_timeout: Duration::from_secs(self.client_write_secs),
            error_trailer: self.stream_error_trailer.clone(),
        }
    }

    pub fn dev_user_id(&self) -> Option<UserId> {
        self.dev_user.as_deref().map(UserId::from)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".into(),
            database_url: "sqlite::memory:".into(),
            log_level: "info".into(),
            log_json: false,
            log_dir: None,
            cors_allowed_origins: None,
            enable_docs: true,
            openai_api_key: None,
            openai_base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            temperature: 0.7,
            max_tokens: 500,
            history_window: DEFAULT_HISTORY_WINDOW,
            provider_idle_secs: 60,
            client_write_secs: 30,
            stream_error_trailer: None,
            api_tokens: HashMap::new(),
            dev_user: None,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn flag_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `"token:user,token2:user2"`; malformed pairs are skipped.
fn parse_token_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once(':'))
        .map(|(token, user)| (token.trim().to_owned(), user.trim().to_owned()))
        .filter(|(token, user)| !token.is_empty() && !user.is_empty())
        .collect()
}
