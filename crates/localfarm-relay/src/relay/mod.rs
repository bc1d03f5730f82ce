//! Incremental response relay.
//!
//! Drives one provider fragment stream to one client sink while accumulating
//! the answer, then commits the assistant turn at most once.
//!
//! Lifecycle of a relay:
//! 1. **Init** – the user turn is persisted before the provider is called.
//!    A storage failure here aborts the relay; the provider is never called.
//! 2. **Streaming** – runs on its own task so the commit still happens when
//!    the HTTP body is dropped.  Each fragment is appended to the accumulator
//!    and written to the sink before the next one is drawn.
//! 3. **Terminal** – `Completed`, `FailedPartial` or `FailedEmpty`.  The sink
//!    is closed first, then a non-blank trimmed accumulator is persisted as
//!    the assistant turn.  That write failing is logged and swallowed.

mod sink;

#[cfg(test)]
mod tests;

pub use sink::{FragmentSink, SinkClosed};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use strum::Display;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::{RelayError, StreamInterruption};
use crate::history::HistoryStore;
use crate::provider::{CompletionProvider, FragmentStream, open_completions};
use crate::transcript::Transcript;
use crate::types::{ChatMessage, Role, UserId};

/// Tunables for every relay run by one engine.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Longest wait for the next provider fragment.
    pub provider_idle_timeout: Duration,
    /// Longest wait for the client to accept one fragment.
    pub client_write_timeout: Duration,
    /// Written once before close when the provider side breaks mid-stream.
    pub error_trailer: Option<String>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            provider_idle_timeout: Duration::from_secs(60),
            client_write_timeout: Duration::from_secs(30),
            error_trailer: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RelayState {
    Init,
    Streaming,
    Completed,
    FailedPartial,
    FailedEmpty,
}

/// Outcome of one finished relay.
#[derive(Debug)]
pub struct RelayReport {
    /// Terminal state.
    pub state: RelayState,
    /// The trimmed accumulator.
    pub content: String,
    /// Fragments drawn from the provider.
    pub fragments: usize,
    /// Set when the assistant turn was persisted.
    pub assistant_message_id: Option<Uuid>,
    /// Set when the assistant write was attempted and failed.
    pub persistence_failed: bool,
    pub interruption: Option<StreamInterruption>,
}

/// A relay whose streaming phase is running in the background.
#[derive(Debug)]
pub struct RelayHandle {
    user_message_id: Uuid,
    task: JoinHandle<RelayReport>,
}

impl RelayHandle {
    /// Id of the persisted user turn.
    pub fn user_message_id(&self) -> Uuid {
        self.user_message_id
    }

    /// Wait for the streaming phase and the assistant commit to finish.
    pub async fn join(self) -> Result<RelayReport, JoinError> {
        self.task.await
    }
}

/// Relays completions for many concurrent requests.
///
/// Holds no per-relay state: each call owns its accumulator and its sink.
pub struct RelayEngine<S> {
    store: Arc<S>,
    provider: Arc<dyn CompletionProvider>,
    options: RelayOptions,
}

impl<S> Clone for RelayEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider),
            options: self.options.clone(),
        }
    }
}

impl<S> std::fmt::Debug for RelayEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine").field("options", &self.options).finish_non_exhaustive()
    }
}

impl<S: HistoryStore> RelayEngine<S> {
    pub fn new(store: Arc<S>, provider: Arc<dyn CompletionProvider>, options: RelayOptions) -> Self {
        Self { store, provider, options }
    }

    pub fn provider(&self) -> &Arc<dyn CompletionProvider> {
        &self.provider
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Start relaying `transcript` for `user_id` into `sink`.
    ///
    /// Returns once the provider stream is open, or fails with
    /// [`ProviderError::Timeout`](crate::ProviderError::Timeout) when opening
    /// takes longer than the provider idle timeout.  On `Err` nothing was
    /// sent and the sink has already been closed.
    pub async fn relay<K: FragmentSink>(
        &self,
        user_id: UserId,
        transcript: Transcript,
        sink: K,
    ) -> Result<RelayHandle, RelayError> {
        let user_message = ChatMessage::new(
            user_id.clone(),
            Role::User,
            transcript.user_turn().content.clone(),
        );
        let user_message_id = user_message.id;
        debug!(user_id = %user_id, state = %RelayState::Init, turns = transcript.turns().count(), "relay starting");

        if let Err(e) = self.store.append(user_message).await {
            error!(user_id = %user_id, error = %e, "failed to persist user message; provider not called");
            sink.close().await;
            return Err(RelayError::Persistence(e));
        }

        let idle = self.options.provider_idle_timeout;
        let fragments = match open_completions(self.provider.as_ref(), &transcript, idle).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "completion provider failed to start");
                sink.close().await;
                return Err(RelayError::Provider(e));
            }
        };
        debug!(user_id = %user_id, state = %RelayState::Streaming, "provider stream opened");

        let span = info_span!("relay", user_id = %user_id, message_id = %user_message_id);
        let engine = self.clone();
        let task = tokio::spawn(engine.stream(user_id, fragments, sink).instrument(span));

        Ok(RelayHandle { user_message_id, task })
    }

    async fn stream<K: FragmentSink>(
        self,
        user_id: UserId,
        mut fragments: FragmentStream,
        mut sink: K,
    ) -> RelayReport {
        let idle = self.options.provider_idle_timeout;
        let write_timeout = self.options.client_write_timeout;
        let mut accumulator = String::new();
        let mut count = 0usize;

        let interruption = loop {
            let next = tokio::select! {
                biased;
                _ = sink.closed() => None,
                next = tokio::time::timeout(idle, fragments.next()) => Some(next),
            };
            let fragment = match next {
                None => break Some(StreamInterruption::ClientGone),
                Some(Err(_)) => break Some(StreamInterruption::ProviderIdle(idle)),
                Some(Ok(None)) => break None,
                Some(Ok(Some(Err(e)))) => break Some(StreamInterruption::Provider(e)),
                Some(Ok(Some(Ok(fragment)))) => fragment,
            };

            accumulator.push_str(&fragment);
            count += 1;

            match tokio::time::timeout(write_timeout, sink.send(Bytes::from(fragment))).await {
                Ok(Ok(())) => {}
                Ok(Err(SinkClosed)) => break Some(StreamInterruption::ClientGone),
                Err(_) => break Some(StreamInterruption::ClientStalled(write_timeout)),
            }
        };

        // Stop drawing from the provider before anything else.
        drop(fragments);

        let trailer = match &interruption {
            Some(i) if i.client_reachable() => self.options.error_trailer.clone(),
            _ => None,
        };
        if let Some(trailer) = trailer {
            // Same bound as a fragment write; the trailer is never accumulated.
            match tokio::time::timeout(write_timeout, sink.send(Bytes::from(trailer))).await {
                Ok(Ok(())) => debug!("error trailer written"),
                Ok(Err(SinkClosed)) => debug!("client gone before error trailer"),
                Err(_) => debug!("client stalled on error trailer"),
            }
        }
        sink.close().await;

        let content = accumulator.trim().to_owned();
        let state = match (&interruption, content.is_empty()) {
            (None, _) => RelayState::Completed,
            (Some(_), false) => RelayState::FailedPartial,
            (Some(_), true) => RelayState::FailedEmpty,
        };
        if let Some(i) = &interruption {
            warn!(state = %state, fragments = count, error = %i, "stream interrupted");
        }

        let mut assistant_message_id = None;
        let mut persistence_failed = false;
        if !content.is_empty() {
            let message = ChatMessage::new(user_id, Role::Assistant, content.clone());
            let id = message.id;
            match self.store.append(message).await {
                Ok(()) => assistant_message_id = Some(id),
                Err(e) => {
                    persistence_failed = true;
                    error!(error = %e, "failed to persist assistant message");
                }
            }
        }

        info!(
            state = %state,
            fragments = count,
            content_len = content.len(),
            persisted = assistant_message_id.is_some(),
            "relay finished"
        );

        RelayReport {
            state,
            content,
            fragments: count,
            assistant_message_id,
            persistence_failed,
            interruption,
        }
    }
}
