//! Append-only chat history.
//!
//! [`HistoryStore`] is the only persistence interface the relay needs.  The
//! server crate implements it on top of SQLite; tests use in-memory fakes.
//!
//! Trait methods use `impl Future` in their signatures, so no boxing or
//! `async-trait` is needed for this seam.

use std::future::Future;

use crate::error::PersistenceError;
use crate::types::{ChatMessage, UserId};

pub trait HistoryStore: Send + Sync + 'static {
    /// Persist one message. Messages are never updated or deleted afterwards.
    fn append(
        &self,
        message: ChatMessage,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// The `limit` most recent messages of `user_id`, oldest first.
    fn list(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ChatMessage>, PersistenceError>> + Send;
}
