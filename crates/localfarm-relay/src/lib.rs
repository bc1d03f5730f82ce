//! localfarm-relay – the chat pipeline behind the LocalFarm assistant.
//!
//! A chat request flows through three stages:
//! 1. [`validator::validate`] turns a raw JSON body into a [`ChatInput`].
//! 2. [`transcript::assemble`] prepends the farming directive and bounds the
//!    history window.
//! 3. [`RelayEngine::relay`] persists the user turn, streams provider
//!    fragments to the client as they arrive and commits the assistant turn.
//!
//! Storage and the completion backend are seams ([`HistoryStore`],
//! [`CompletionProvider`]) so the HTTP server and tests can plug in their own.

pub mod error;
pub mod history;
pub mod provider;
pub mod relay;
pub mod transcript;
pub mod types;
pub mod validator;

pub use error::{PersistenceError, ProviderError, RelayError, StreamInterruption, ValidationError};
pub use history::HistoryStore;
pub use provider::{
    CompletionProvider, FragmentStream, OpenAiConfig, OpenAiProvider, complete_text, open_completions,
};
pub use relay::{FragmentSink, RelayEngine, RelayHandle, RelayOptions, RelayReport, RelayState, SinkClosed};
pub use transcript::{DEFAULT_HISTORY_WINDOW, FARMING_SYSTEM_PROMPT, Transcript, assemble};
pub use types::{ChatMessage, Role, Turn, UserId};
pub use validator::{ChatInput, MAX_MESSAGE_BYTES, validate};
