//! Completion provider seam.
//!
//! The relay never talks to a vendor SDK directly: it receives an explicitly
//! constructed [`CompletionProvider`] handle.  [`openai::OpenAiProvider`] is the
//! production implementation.  With the `test-support` feature,
//! `scripted::ScriptedProvider` replays canned fragments for tests.

pub mod openai;
#[cfg(any(test, feature = "test-support"))]
pub mod scripted;
pub mod sse;

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::ProviderError;
use crate::transcript::Transcript;

pub use openai::{OpenAiConfig, OpenAiProvider};
#[cfg(any(test, feature = "test-support"))]
pub use scripted::{ScriptStep, ScriptedProvider};

/// Lazy, forward-only sequence of text fragments in arrival order.
///
/// An `Err` item means the stream broke mid-flight; nothing follows it.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync + 'static {
    /// Start a streamed completion for `transcript`.
    ///
    /// Returns `Err` only when no stream could be opened at all.
    async fn completions(&self, transcript: &Transcript) -> Result<FragmentStream, ProviderError>;
}

/// Open a completion stream, giving up after `idle`.
pub async fn open_completions(
    provider: &dyn CompletionProvider,
    transcript: &Transcript,
    idle: Duration,
) -> Result<FragmentStream, ProviderError> {
    tokio::time::timeout(idle, provider.completions(transcript))
        .await
        .map_err(|_| ProviderError::Timeout(idle))?
}

/// Run a completion to the end and return the trimmed text.
///
/// Fails with [`ProviderError::Timeout`] when the stream does not open, or no
/// fragment arrives, within `idle`.
pub async fn complete_text(
    provider: &dyn CompletionProvider,
    transcript: &Transcript,
    idle: Duration,
) -> Result<String, ProviderError> {
    let mut stream = open_completions(provider, transcript, idle).await?;
    let mut text = String::new();
    loop {
        match tokio::time::timeout(idle, stream.next()).await {
            Ok(Some(fragment)) => text.push_str(&fragment?),
            Ok(None) => break,
            Err(_) => return Err(ProviderError::Timeout(idle)),
        }
    }
    Ok(text.trim().to_owned())
}

// ── Tests ──────────────────────────────────────────────────────────────────────
