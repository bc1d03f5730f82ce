use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing_test::traced_test;

use super::*;
use crate::error::{PersistenceError, ProviderError};
use crate::provider::{ScriptStep, ScriptedProvider};
use crate::transcript::{FARMING_SYSTEM_PROMPT, assemble};
use crate::types::Turn;

// ── helpers ───────────────────────────────────────────────────────────────────

/// In-memory history with switchable failures.
#[derive(Default)]
struct MemoryStore {
    messages: Mutex<Vec<ChatMessage>>,
    fail_user: bool,
    fail_assistant: bool,
    attempts: AtomicUsize,
}

impl MemoryStore {
    fn failing_user() -> Self {
        Self { fail_user: true, ..Self::default() }
    }

    fn failing_assistant() -> Self {
        Self { fail_assistant: true, ..Self::default() }
    }

    fn by_role(&self, role: Role) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.role == role)
            .cloned()
            .collect()
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl HistoryStore for MemoryStore {
    async fn append(&self, message: ChatMessage) -> Result<(), PersistenceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = match message.role {
            Role::Assistant => self.fail_assistant,
            _ => self.fail_user,
        };
        if fail {
            return Err(PersistenceError::Unavailable("disk full".into()));
        }
        self.messages.lock().unwrap().push(message);
        Ok(())
    }

    async fn list(&self, user_id: &UserId, limit: usize) -> Result<Vec<ChatMessage>, PersistenceError> {
        let all: Vec<ChatMessage> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| &m.user_id == user_id)
            .cloned()
            .collect();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }
}

/// Sink that records everything and counts closes.
#[derive(Clone, Default)]
struct RecordingSink {
    sent: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
    /// Reject writes after this many fragments.
    accept: Option<usize>,
}

impl RecordingSink {
    fn accepting(n: usize) -> Self {
        Self { accept: Some(n), ..Self::default() }
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl FragmentSink for RecordingSink {
    async fn send(&mut self, fragment: Bytes) -> Result<(), SinkClosed> {
        let mut sent = self.sent.lock().unwrap();
        if self.accept.is_some_and(|n| sent.len() >= n) {
            return Err(SinkClosed);
        }
        sent.push(String::from_utf8_lossy(&fragment).into_owned());
        Ok(())
    }

    async fn closed(&self) {
        futures::future::pending::<()>().await
    }

    async fn close(self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn frost_transcript() -> Transcript {
    assemble(
        FARMING_SYSTEM_PROMPT,
        &[],
        Turn::user("How do I protect rice from frost?"),
        10,
    )
}

fn engine(store: &Arc<MemoryStore>, provider: &Arc<ScriptedProvider>) -> RelayEngine<MemoryStore> {
    engine_with(store, provider, RelayOptions::default())
}

fn engine_with(
    store: &Arc<MemoryStore>,
    provider: &Arc<ScriptedProvider>,
    options: RelayOptions,
) -> RelayEngine<MemoryStore> {
    let provider: Arc<dyn CompletionProvider> = provider.clone();
    RelayEngine::new(Arc::clone(store), provider, options)
}

async fn drain(mut rx: mpsc::Receiver<Result<Bytes, Infallible>>) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(Ok(bytes)) = rx.recv().await {
        out.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    out
}

// ── scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn completed_stream_is_relayed_in_order_and_persisted_once() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::fragments(["Cover ", "seedlings ", "at night."]));
    let (tx, rx) = mpsc::channel(1);

    let handle = engine(&store, &provider)
        .relay("farmer-1".into(), frost_transcript(), tx)
        .await
        .unwrap();
    let user_message_id = handle.user_message_id();
    let received = drain(rx).await;
    let report = handle.join().await.unwrap();

    assert_eq!(received, vec!["Cover ", "seedlings ", "at night."]);
    assert_eq!(report.state, RelayState::Completed);
    assert_eq!(report.fragments, 3);

    let assistant = store.by_role(Role::Assistant);
    assert_eq!(assistant.len(), 1);
    assert_eq!(assistant[0].content, "Cover seedlings at night.");
    assert_eq!(assistant[0].user_id, UserId::new("farmer-1"));
    assert_eq!(report.assistant_message_id, Some(assistant[0].id));

    let user = store.by_role(Role::User);
    assert_eq!(user.len(), 1);
    assert_eq!(user[0].content, "How do I protect rice from frost?");
    assert_eq!(user[0].id, user_message_id);
}

#[tokio::test]
async fn partial_answer_is_kept_when_provider_fails_mid_stream() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptStep::Fragment("Use ".into()),
        ScriptStep::Fail("connection reset by peer".into()),
    ]));
    let (tx, rx) = mpsc::channel(1);

    let handle = engine(&store, &provider)
        .relay("farmer-1".into(), frost_transcript(), tx)
        .await
        .unwrap();
    let received = drain(rx).await;
    let report = handle.join().await.unwrap();

    assert_eq!(received, vec!["Use "]);
    assert_eq!(report.state, RelayState::FailedPartial);
    assert!(matches!(
        report.interruption,
        Some(StreamInterruption::Provider(ProviderError::Stream(_)))
    ));
    let assistant = store.by_role(Role::Assistant);
    assert_eq!(assistant.len(), 1);
    assert_eq!(assistant[0].content, "Use");
}

#[tokio::test]
async fn failure_before_first_fragment_persists_no_answer() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptStep::Fail("boom".into())]));
    let (tx, rx) = mpsc::channel(1);

    let handle = engine(&store, &provider)
        .relay("farmer-1".into(), frost_transcript(), tx)
        .await
        .unwrap();
    let received = drain(rx).await;
    let report = handle.join().await.unwrap();

    assert!(received.is_empty());
    assert_eq!(report.state, RelayState::FailedEmpty);
    assert!(store.by_role(Role::Assistant).is_empty());
    assert_eq!(store.by_role(Role::User).len(), 1);
}

#[tokio::test]
async fn whitespace_only_failure_counts_as_empty() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptStep::Fragment("  \n".into()),
        ScriptStep::Fail("boom".into()),
    ]));
    let sink = RecordingSink::default();

    let handle = engine(&store, &provider)
        .relay("farmer-1".into(), frost_transcript(), sink.clone())
        .await
        .unwrap();
    let report = handle.join().await.unwrap();

    assert_eq!(report.state, RelayState::FailedEmpty);
    assert_eq!(sink.sent(), vec!["  \n"]);
    assert!(store.by_role(Role::Assistant).is_empty());
}

#[tokio::test]
async fn blank_completion_persists_nothing() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::fragments([" ", "\t"]));
    let sink = RecordingSink::default();

    let report = engine(&store, &provider)
        .relay("farmer-1".into(), frost_transcript(), sink.clone())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(report.state, RelayState::Completed);
    assert_eq!(report.assistant_message_id, None);
    assert!(!report.persistence_failed);
    assert!(store.by_role(Role::Assistant).is_empty());
    assert_eq!(store.attempts(), 1);
}

#[tokio::test]
async fn user_turn_storage_failure_aborts_before_provider_call() {
    let store = Arc::new(MemoryStore::failing_user());
    let provider = Arc::new(ScriptedProvider::fragments(["never"]));
    let sink = RecordingSink::default();

    let err = engine(&store, &provider)
        .relay("farmer-1".into(), frost_transcript(), sink.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::Persistence(_)));
    assert_eq!(provider.calls(), 0);
    assert!(sink.sent().is_empty());
    assert_eq!(sink.closes(), 1);
}

#[tokio::test]
async fn provider_refusal_surfaces_synchronously_and_keeps_user_turn() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::refusing("model overloaded"));
    let sink = RecordingSink::default();

    let err = engine(&store, &provider)
        .relay("farmer-1".into(), frost_transcript(), sink.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::Provider(ProviderError::Status { status: 503, .. })));
    assert_eq!(store.by_role(Role::User).len(), 1);
    assert!(store.by_role(Role::Assistant).is_empty());
    assert_eq!(sink.closes(), 1);
}

#[tokio::test]
#[traced_test]
async fn assistant_storage_failure_is_swallowed_and_logged() {
    let store = Arc::new(MemoryStore::failing_assistant());
    let provider = Arc::new(ScriptedProvider::fragments(["Drain ", "the paddy."]));
    let sink = RecordingSink::default();

    let report = engine(&store, &provider)
        .relay("farmer-1".into(), frost_transcript(), sink.clone())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(report.state, RelayState::Completed);
    assert!(report.persistence_failed);
    assert_eq!(report.assistant_message_id, None);
    assert_eq!(sink.sent(), vec!["Drain ", "the paddy."]);
    assert_eq!(sink.closes(), 1);
    assert_eq!(store.attempts(), 2, "assistant write attempted exactly once");
    assert!(logs_contain("failed to persist assistant message"));
}

// ── ordering and lifecycle properties ─────────────────────────────────────────

/// Records how many messages the store held when the provider was called.
struct StoreObservingProvider {
    store: Arc<MemoryStore>,
    seen: Mutex<Option<usize>>,
}

#[async_trait]
impl CompletionProvider for StoreObservingProvider {
    async fn completions(&self, _transcript: &Transcript) -> Result<FragmentStream, ProviderError> {
        *self.seen.lock().unwrap() = Some(self.store.by_role(Role::User).len());
        Ok(futures::stream::iter(vec![Ok("ok".to_owned())]).boxed())
    }
}

#[tokio::test]
async fn user_turn_is_persisted_before_provider_call() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(StoreObservingProvider { store: Arc::clone(&store), seen: Mutex::new(None) });
    let engine = RelayEngine::new(
        Arc::clone(&store),
        Arc::clone(&provider) as Arc<dyn CompletionProvider>,
        RelayOptions::default(),
    );

    engine
        .relay("farmer-1".into(), frost_transcript(), RecordingSink::default())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(*provider.seen.lock().unwrap(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn provider_that_never_opens_times_out_and_closes_sink() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::hanging());
    let options = RelayOptions {
        provider_idle_timeout: Duration::from_secs(5),
        ..RelayOptions::default()
    };
    let sink = RecordingSink::default();

    let err = tokio::time::timeout(
        Duration::from_secs(3600),
        engine_with(&store, &provider, options).relay("farmer-1".into(), frost_transcript(), sink.clone()),
    )
    .await
    .expect("relay must give up after the provider idle timeout")
    .unwrap_err();

    assert!(matches!(err, RelayError::Provider(ProviderError::Timeout(d)) if d == Duration::from_secs(5)));
    assert_eq!(sink.closes(), 1);
    assert!(sink.sent().is_empty());
    assert_eq!(store.by_role(Role::User).len(), 1);
    assert!(store.by_role(Role::Assistant).is_empty());
}

#[tokio::test]
async fn provider_receives_the_assembled_transcript() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::fragments(["ok"]));
    let transcript = assemble(
        FARMING_SYSTEM_PROMPT,
        &[Turn::user("hi"), Turn::assistant("hello")],
        Turn::user("frost?"),
        10,
    );

    engine(&store, &provider)
        .relay("farmer-1".into(), transcript.clone(), RecordingSink::default())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(provider.last_transcript(), Some(transcript));
}

#[tokio::test]
async fn sink_is_closed_exactly_once_on_every_path() {
    let cases: Vec<(ScriptedProvider, MemoryStore)> = vec![
        (ScriptedProvider::fragments(["a", "b"]), MemoryStore::default()),
        (
            ScriptedProvider::new(vec![ScriptStep::Fragment("a".into()), ScriptStep::Fail("x".into())]),
            MemoryStore::default(),
        ),
        (ScriptedProvider::fragments(["a"]), MemoryStore::failing_assistant()),
        (ScriptedProvider::fragments(["a"]), MemoryStore::failing_user()),
        (ScriptedProvider::refusing("down"), MemoryStore::default()),
    ];

    for (provider, store) in cases {
        let store = Arc::new(store);
        let provider = Arc::new(provider);
        let sink = RecordingSink::default();
        if let Ok(handle) = engine(&store, &provider)
            .relay("farmer-1".into(), frost_transcript(), sink.clone())
            .await
        {
            handle.join().await.unwrap();
        }
        assert_eq!(sink.closes(), 1);
    }
}

#[tokio::test]
async fn error_trailer_is_written_once_after_provider_failure() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptStep::Fragment("Use ".into()),
        ScriptStep::Fail("reset".into()),
    ]));
    let options = RelayOptions {
        error_trailer: Some("\n[response interrupted]".into()),
        ..RelayOptions::default()
    };
    // One slot, as the HTTP route uses: the last fragment may still be
    // buffered when the provider breaks.
    let (tx, rx) = mpsc::channel(1);

    let handle = engine_with(&store, &provider, options)
        .relay("farmer-1".into(), frost_transcript(), tx)
        .await
        .unwrap();
    let received = drain(rx).await;
    let report = handle.join().await.unwrap();

    assert_eq!(received, vec!["Use ", "\n[response interrupted]"]);
    assert_eq!(report.content, "Use");
    assert_eq!(store.by_role(Role::Assistant)[0].content, "Use");
}

#[tokio::test(start_paused = true)]
async fn unread_trailer_does_not_hold_the_relay() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptStep::Fragment("Use ".into()),
        ScriptStep::Fail("reset".into()),
    ]));
    let options = RelayOptions {
        client_write_timeout: Duration::from_secs(2),
        error_trailer: Some("!".into()),
        ..RelayOptions::default()
    };
    // Never read: "Use " fills the only slot and the trailer cannot land.
    let (tx, rx) = mpsc::channel(1);

    let report = engine_with(&store, &provider, options)
        .relay("farmer-1".into(), frost_transcript(), tx)
        .await
        .unwrap()
        .join()
        .await
        .unwrap();
    drop(rx);

    assert_eq!(report.state, RelayState::FailedPartial);
    assert_eq!(store.by_role(Role::Assistant)[0].content, "Use");
}

#[tokio::test]
async fn no_trailer_after_normal_completion() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::fragments(["done"]));
    let options = RelayOptions { error_trailer: Some("!".into()), ..RelayOptions::default() };
    let sink = RecordingSink::default();

    engine_with(&store, &provider, options)
        .relay("farmer-1".into(), frost_transcript(), sink.clone())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(sink.sent(), vec!["done"]);
}

// ── cancellation and timeouts ─────────────────────────────────────────────────

#[tokio::test]
async fn client_disconnect_stops_drawing_and_keeps_partial_answer() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptStep::Fragment("Flood ".into()),
        ScriptStep::Stall,
    ]));
    let (tx, mut rx) = mpsc::channel(1);

    let handle = engine(&store, &provider)
        .relay("farmer-1".into(), frost_transcript(), tx)
        .await
        .unwrap();
    let first = rx.recv().await.unwrap().unwrap();
    assert_eq!(first, Bytes::from_static(b"Flood "));
    drop(rx);

    let report = handle.join().await.unwrap();
    assert!(matches!(report.interruption, Some(StreamInterruption::ClientGone)));
    assert_eq!(report.state, RelayState::FailedPartial);
    assert_eq!(store.by_role(Role::Assistant)[0].content, "Flood");
}

#[tokio::test]
async fn rejected_write_is_treated_as_disconnect() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::fragments(["one ", "two ", "three ", "four ", "five"]));
    let sink = RecordingSink::accepting(2);

    let report = engine(&store, &provider)
        .relay("farmer-1".into(), frost_transcript(), sink.clone())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    assert!(matches!(report.interruption, Some(StreamInterruption::ClientGone)));
    assert_eq!(sink.sent(), vec!["one ", "two "]);
    assert_eq!(provider.fragments_pulled(), 3, "no fragment drawn after the broken write");
    assert_eq!(report.content, "one two three");
    assert_eq!(sink.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_provider_times_out() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptStep::Fragment("Mulch ".into()),
        ScriptStep::Stall,
    ]));
    let options = RelayOptions {
        provider_idle_timeout: Duration::from_secs(5),
        error_trailer: Some(" …".into()),
        ..RelayOptions::default()
    };
    let sink = RecordingSink::default();

    let report = engine_with(&store, &provider, options)
        .relay("farmer-1".into(), frost_transcript(), sink.clone())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    assert!(matches!(report.interruption, Some(StreamInterruption::ProviderIdle(_))));
    assert_eq!(report.state, RelayState::FailedPartial);
    assert_eq!(sink.sent(), vec!["Mulch ", " …"]);
    assert_eq!(store.by_role(Role::Assistant)[0].content, "Mulch");
}

#[tokio::test(start_paused = true)]
async fn slow_provider_within_idle_window_completes() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptStep::Fragment("a".into()),
        ScriptStep::Delay(Duration::from_secs(4)),
        ScriptStep::Fragment("b".into()),
    ]));
    let options = RelayOptions {
        provider_idle_timeout: Duration::from_secs(5),
        ..RelayOptions::default()
    };

    let report = engine_with(&store, &provider, options)
        .relay("farmer-1".into(), frost_transcript(), RecordingSink::default())
        .await
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(report.state, RelayState::Completed);
    assert_eq!(report.content, "ab");
}

#[tokio::test(start_paused = true)]
async fn stalled_client_times_out_without_trailer() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::fragments(["a ", "b ", "c"]));
    let options = RelayOptions {
        client_write_timeout: Duration::from_secs(2),
        error_trailer: Some("!".into()),
        ..RelayOptions::default()
    };
    // Capacity one and never read: the second write cannot complete.
    let (tx, rx) = mpsc::channel(1);

    let report = engine_with(&store, &provider, options)
        .relay("farmer-1".into(), frost_transcript(), tx)
        .await
        .unwrap()
        .join()
        .await
        .unwrap();
    drop(rx);

    assert!(matches!(report.interruption, Some(StreamInterruption::ClientStalled(_))));
    assert_eq!(report.state, RelayState::FailedPartial);
    assert_eq!(report.content, "a b");
}

// ── concurrency ───────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_relays_do_not_interfere() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(ScriptedProvider::fragments(["Rotate ", "crops."]));
    let engine = engine(&store, &provider);

    let runs = (0..16).map(|i| {
        let engine = engine.clone();
        async move {
            let (tx, rx) = mpsc::channel(1);
            let handle = engine
                .relay(UserId::new(format!("farmer-{i}")), frost_transcript(), tx)
                .await
                .unwrap();
            let received = drain(rx).await;
            (received, handle.join().await.unwrap())
        }
    });
    let results = futures::future::join_all(runs).await;

    for (received, report) in results {
        assert_eq!(received, vec!["Rotate ", "crops."]);
        assert_eq!(report.state, RelayState::Completed);
    }
    for i in 0..16 {
        let history = store.list(&UserId::new(format!("farmer-{i}")), 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "Rotate crops.");
    }
}
