//! OpenAI-compatible streaming chat-completion client.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::debug;

use super::sse::{SseEvent, SseParser};
use super::{CompletionProvider, FragmentStream};
use crate::error::ProviderError;
use crate::transcript::Transcript;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4";

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Bearer token. Requests are sent unauthenticated when absent.
    pub api_key: Option<String>,
    /// API root, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Upper bound on establishing the TCP/TLS connection.
    pub connect_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_owned(),
            model: DEFAULT_MODEL.to_owned(),
            temperature: 0.7,
            max_tokens: 500,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    http: Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .user_agent(concat!("localfarm-relay/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// JSON payload for a streamed completion of `transcript`.
    pub fn request_body(&self, transcript: &Transcript) -> Value {
        let messages: Vec<Value> = transcript
            .turns()
            .map(|turn| json!({ "role": turn.role.as_ref(), "content": turn.content }))
            .collect();
        json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn completions(&self, transcript: &Transcript) -> Result<FragmentStream, ProviderError> {
        let mut request = self.http.post(self.endpoint()).json(&self.request_body(transcript));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                message: parse_error_message(status, &body),
            });
        }

        debug!(model = %self.config.model, turns = transcript.turns().count(), "completion stream opened");
        Ok(sse_fragments(response.bytes_stream().boxed()))
    }
}

/// Extract the human-readable message from an OpenAI error envelope.
pub fn parse_error_message(status: StatusCode, body: &str) -> String {
    let from_envelope = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        v.get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
    });
    if let Some(message) = from_envelope {
        return message;
    }

    let body = body.trim();
    if body.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_owned()
    } else {
        body.chars().take(512).collect()
    }
}

struct SseDecoder {
    bytes: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    parser: SseParser,
    pending: VecDeque<Result<String, ProviderError>>,
    finished: bool,
}

impl SseDecoder {
    /// Queue fragments up to the first terminal event.
    fn push_events(&mut self, events: impl IntoIterator<Item = SseEvent>) {
        for event in events {
            match event {
                SseEvent::Delta(text) => self.pending.push_back(Ok(text)),
                SseEvent::Done => {
                    self.finished = true;
                    break;
                }
                SseEvent::Error(message) => {
                    self.pending.push_back(Err(ProviderError::Stream(message)));
                    self.finished = true;
                    break;
                }
                SseEvent::Malformed(message) => {
                    self.pending.push_back(Err(ProviderError::Decode(message)));
                    self.finished = true;
                    break;
                }
            }
        }
    }
}

/// Turn a raw SSE body into a fragment stream.
///
/// Ends after `[DONE]`, after the body ends, or right after the first error.
pub fn sse_fragments(bytes: BoxStream<'static, Result<Bytes, reqwest::Error>>) -> FragmentStream {
    let decoder = SseDecoder {
        bytes,
        parser: SseParser::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(decoder, |mut d| async move {
        loop {
            if let Some(item) = d.pending.pop_front() {
                return Some((item, d));
            }
            if d.finished {
                return None;
            }
            match d.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = d.parser.feed(&chunk);
                    d.push_events(events);
                }
                Some(Err(e)) => {
                    d.finished = true;
                    return Some((Err(ProviderError::Http(e)), d));
                }
                None => {
                    let last = d.parser.finish();
                    d.push_events(last);
                    d.finished = true;
                }
            }
        }
    })
    .boxed()
}

// ── Tests ──────────────────────────────────────────────────────────────────────
