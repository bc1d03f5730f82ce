//! SQLite implementation of [`HistoryStore`].
//!
//! Uses [`sqlx`] with the `sqlite` feature.  Migrations are embedded at
//! compile time from `./migrations` and run on [`SqliteStore::connect`].
//!
//! The `sqlx::query` (runtime-verified) form is used so that no
//! `DATABASE_URL` environment variable is needed at compile time.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use localfarm_relay::{ChatMessage, HistoryStore, PersistenceError, Role, UserId};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::warn;
use uuid::Uuid;

type MessageRow = (String, String, String, String, String);

/// SQLite-backed append-only chat history.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g. `"sqlite://localfarm.db"`
    /// or `"sqlite::memory:"` for tests.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every in-memory connection is its own database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Wait for checked-out connections, then close the pool.
    ///
    /// Every later call fails with [`PersistenceError::Unavailable`].
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl HistoryStore for SqliteStore {
    async fn append(&self, message: ChatMessage) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO chat_messages (id, user_id, role, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(message.id.to_string())
        .bind(message.user_id.as_str())
        .bind(message.role.to_string())
        .bind(&message.content)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn list(&self, user_id: &UserId, limit: usize) -> Result<Vec<ChatMessage>, PersistenceError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, user_id, role, content, created_at FROM ( \
                 SELECT seq, id, user_id, role, content, created_at \
                 FROM chat_messages WHERE user_id = ?1 \
                 ORDER BY seq DESC LIMIT ?2 \
             ) ORDER BY seq ASC",
        )
        .bind(user_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows.into_iter().filter_map(row_to_message).collect())
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn storage_error(e: sqlx::Error) -> PersistenceError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            PersistenceError::Unavailable(e.to_string())
        }
        other => PersistenceError::backend(other),
    }
}

fn row_to_message((id, user_id, role, content, created_at): MessageRow) -> Option<ChatMessage> {
    let id = match id.parse::<Uuid>() {
        Ok(id) => id,
        Err(e) => {
            warn!(raw = %id, error = %e, "skipping chat message with invalid id");
            return None;
        }
    };
    let role = match Role::from_str(&role) {
        Ok(role) => role,
        Err(_) => {
            warn!(%id, raw = %role, "skipping chat message with unknown role");
            return None;
        }
    };
    let created_at = created_at.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!(%id, raw = %created_at, error = %e, "failed to parse message created_at; using now");
        Utc::now()
    });
    Some(ChatMessage {
        id,
        user_id: UserId::new(user_id),
        role,
        content,
        created_at,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────
