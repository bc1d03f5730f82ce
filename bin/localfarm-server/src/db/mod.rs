//! Database layer.
//!
//! The relay only depends on [`localfarm_relay::HistoryStore`]; the default
//! implementation is [`sqlite::SqliteStore`].  To swap to another database,
//! implement that trait for the new type and change the concrete type in
//! [`crate::state::AppState`].

pub mod sqlite;
