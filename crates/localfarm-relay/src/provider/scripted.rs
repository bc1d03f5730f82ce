//! Deterministic provider that replays a fixed script.
//!
//! Contains no transport logic.  Compiled for this crate's tests and, through
//! the `test-support` feature, for the server's.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::{CompletionProvider, FragmentStream};
use crate::error::ProviderError;
use crate::transcript::Transcript;

/// One step of a scripted completion.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Yield a fragment.
    Fragment(String),
    /// Sleep before the next step.
    Delay(Duration),
    /// Break the stream with a provider error.
    Fail(String),
    /// Never produce anything again.
    Stall,
}

#[derive(Debug)]
pub struct ScriptedProvider {
    steps: Vec<ScriptStep>,
    refuse: Option<String>,
    hang: bool,
    calls: AtomicUsize,
    pulled: Arc<AtomicUsize>,
    last_transcript: Mutex<Option<Transcript>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            refuse: None,
            hang: false,
            calls: AtomicUsize::new(0),
            pulled: Arc::new(AtomicUsize::new(0)),
            last_transcript: Mutex::new(None),
        }
    }

    /// A script that yields `fragments` and ends normally.
    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(fragments.into_iter().map(|f| ScriptStep::Fragment(f.into())).collect())
    }

    /// A provider whose call fails before any stream is opened.
    pub fn refusing(message: impl Into<String>) -> Self {
        Self { refuse: Some(message.into()), ..Self::new(Vec::new()) }
    }

    /// A provider whose call never returns, neither a stream nor an error.
    pub fn hanging() -> Self {
        Self { hang: true, ..Self::new(Vec::new()) }
    }

    /// Number of times `completions` was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of fragments handed out across all streams.
    pub fn fragments_pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    /// The transcript passed to the most recent call.
    pub fn last_transcript(&self) -> Option<Transcript> {
        self.last_transcript.lock().ok().and_then(|t| t.clone())
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn completions(&self, transcript: &Transcript) -> Result<FragmentStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_transcript.lock() {
            *last = Some(transcript.clone());
        }
        if self.hang {
            futures::future::pending::<()>().await;
        }
        if let Some(message) = &self.refuse {
            return Err(ProviderError::Status { status: 503, message: message.clone() });
        }

        let state = (self.steps.clone().into_iter(), Arc::clone(&self.pulled), false);
        let stream = futures::stream::unfold(state, |(mut steps, pulled, failed)| async move {
            if failed {
                return None;
            }
            loop {
                match steps.next()? {
                    ScriptStep::Fragment(text) => {
                        pulled.fetch_add(1, Ordering::SeqCst);
                        return Some((Ok(text), (steps, pulled, false)));
                    }
                    ScriptStep::Delay(d) => tokio::time::sleep(d).await,
                    ScriptStep::Fail(message) => {
                        return Some((Err(ProviderError::Stream(message)), (steps, pulled, true)));
                    }
                    ScriptStep::Stall => futures::future::pending::<()>().await,
                }
            }
        });
        Ok(stream.boxed())
    }
}
