// SQLite message store.
//
// Holds users and direct messages with the same authorization rules as the
// messaging server. `StoreChatApi` and `StoreTransport` together let a session
// run entirely against a local database file.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::UserConfig;
use crate::error::{ApiError, TransportError};
use crate::live::LiveFeed;
use crate::message::{
    ConversationHistory, ConversationSummary, MessageId, UserProfile, WireMessage,
};
use crate::normalize::parse_timestamp_str;
use crate::protocol::ServerEvent;
use crate::reconciler::MAX_CONTENT_LEN;
use crate::transport::{ChatApi, Transport};

/// Characters of the last message shown in a conversation summary.
pub const PREVIEW_LEN: usize = 50;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Requests the store refuses on domain grounds.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Cannot send message to yourself")]
    SelfMessage,

    #[error("Recipient not found")]
    RecipientNotFound,

    #[error("Message not found")]
    MessageNotFound,

    #[error("Access denied")]
    AccessDenied,

    #[error("message content must be 1 to {max} characters")]
    InvalidContent { max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: String,
}

impl StoredUser {
    /// The configured local user, with its name split into first and last.
    pub fn from_config(user: &UserConfig) -> Self {
        let mut parts = user.name.trim().splitn(2, char::is_whitespace);
        let first_name = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let last_name = parts.next().map(|s| s.trim().to_string());
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            first_name,
            last_name,
            role: user.role.clone(),
        }
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id.clone(),
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: String = row.get(5)?;
        Ok(StoredMessage {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            receiver_id: row.get(2)?,
            content: row.get(3)?,
            is_read: row.get(4)?,
            created_at: stored_time(&created_at),
        })
    }

    /// The wire shape the server returns for a message row.
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            id: Some(self.id.clone()),
            sender_id: Some(self.sender_id.clone()),
            recipient_id: Some(self.receiver_id.clone()),
            content: Some(self.content.clone()),
            is_read: Some(self.is_read),
            created_at: Some(Value::String(format_time(self.created_at))),
            ..Default::default()
        }
    }
}

/// Rows written by other tools may carry a timestamp we cannot read; those
/// are treated as written now, like wire messages without a usable time.
fn stored_time(raw: &str) -> DateTime<Utc> {
    parse_timestamp_str(raw).unwrap_or_else(|| {
        warn!("Unreadable created_at {:?} in store, using now", raw);
        Utc::now()
    })
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, is_read, created_at";

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id         TEXT PRIMARY KEY,
                email      TEXT NOT NULL DEFAULT '',
                first_name TEXT,
                last_name  TEXT,
                role       TEXT NOT NULL DEFAULT 'client'
            );

            CREATE TABLE IF NOT EXISTS messages (
                id          TEXT PRIMARY KEY,
                sender_id   TEXT NOT NULL REFERENCES users(id),
                receiver_id TEXT NOT NULL REFERENCES users(id),
                content     TEXT NOT NULL,
                is_read     INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_messages_pair
                ON messages(sender_id, receiver_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_unread
                ON messages(receiver_id, is_read);
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned, which only happens after another
    /// thread panicked mid-query.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // -- users -------------------------------------------------------------

    pub fn upsert_user(&self, user: &StoredUser) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (id, email, first_name, last_name, role)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                email      = excluded.email,
                first_name = excluded.first_name,
                last_name  = excluded.last_name,
                role       = excluded.role",
            params![user.id, user.email, user.first_name, user.last_name, user.role],
        )
        .context("failed to upsert user")?;
        Ok(())
    }

    pub fn find_user(&self, id: &str) -> Result<Option<StoredUser>> {
        find_user(&self.conn(), id)
    }

    // -- messages ----------------------------------------------------------

    /// Store a new message stamped with the current time.
    pub fn insert_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<StoredMessage> {
        self.insert_message_at(sender_id, receiver_id, content, Utc::now())
    }

    pub fn insert_message_at(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<StoredMessage> {
        if sender_id == receiver_id {
            return Err(StoreError::SelfMessage.into());
        }
        check_content(content)?;

        let conn = self.conn();
        if find_user(&conn, receiver_id)?.is_none() {
            return Err(StoreError::RecipientNotFound.into());
        }

        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            is_read: false,
            created_at: at,
        };
        conn.execute(
            "INSERT INTO messages (id, sender_id, receiver_id, content, is_read, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                message.id,
                message.sender_id,
                message.receiver_id,
                message.content,
                format_time(message.created_at),
            ],
        )
        .context("failed to insert message")?;
        debug!("Stored message {} from {} to {}", message.id, sender_id, receiver_id);
        Ok(message)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<StoredMessage>> {
        get_message(&self.conn(), id)
    }

    /// One page of the conversation between `user_id` and `other_id`, oldest
    /// first, plus the other user's profile. Messages addressed to `user_id`
    /// are marked read after the page is read, so the page itself shows
    /// their previous state.
    pub fn conversation(
        &self,
        user_id: &str,
        other_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<(Option<UserProfile>, Vec<StoredMessage>)> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;

        let mut page = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE (sender_id = ?1 AND receiver_id = ?2)
                        OR (sender_id = ?2 AND receiver_id = ?1)
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?3 OFFSET ?4"
                ))
                .context("failed to prepare conversation query")?;
            let rows = stmt
                .query_map(params![user_id, other_id, limit, offset], |row| {
                    StoredMessage::from_row(row)
                })
                .context("failed to query conversation")?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to map message rows")?;
            rows
        };
        page.reverse();

        tx.execute(
            "UPDATE messages SET is_read = 1 WHERE receiver_id = ?1 AND sender_id = ?2",
            params![user_id, other_id],
        )
        .context("failed to mark conversation read")?;

        let profile = find_user(&tx, other_id)?.map(|u| u.profile());
        tx.commit().context("failed to commit conversation read")?;
        Ok((profile, page))
    }

    /// Mark one message read. Only its recipient may do so; repeating is a
    /// no-op.
    pub fn mark_read(&self, user_id: &str, message_id: &str) -> Result<()> {
        let conn = self.conn();
        let message = get_message(&conn, message_id)?.ok_or(StoreError::MessageNotFound)?;
        if message.receiver_id != user_id {
            return Err(StoreError::AccessDenied.into());
        }
        conn.execute(
            "UPDATE messages SET is_read = 1 WHERE id = ?1",
            params![message_id],
        )
        .context("failed to mark message read")?;
        Ok(())
    }

    /// Replace a message's content. Only the sender may edit; the message
    /// becomes unread again.
    pub fn edit_message(
        &self,
        user_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<StoredMessage> {
        check_content(content)?;
        let conn = self.conn();
        let mut message = get_message(&conn, message_id)?.ok_or(StoreError::MessageNotFound)?;
        if message.sender_id != user_id {
            return Err(StoreError::AccessDenied.into());
        }
        conn.execute(
            "UPDATE messages SET content = ?1, is_read = 0 WHERE id = ?2",
            params![content, message_id],
        )
        .context("failed to edit message")?;
        message.content = content.to_string();
        message.is_read = false;
        Ok(message)
    }

    /// Delete a message. Either participant may delete.
    pub fn delete_message(&self, user_id: &str, message_id: &str) -> Result<()> {
        let conn = self.conn();
        let message = get_message(&conn, message_id)?.ok_or(StoreError::MessageNotFound)?;
        if message.sender_id != user_id && message.receiver_id != user_id {
            return Err(StoreError::AccessDenied.into());
        }
        conn.execute("DELETE FROM messages WHERE id = ?1", params![message_id])
            .context("failed to delete message")?;
        Ok(())
    }

    /// Delete every message between the two users. Returns how many were
    /// removed.
    pub fn clear_conversation(&self, user_id: &str, other_id: &str) -> Result<usize> {
        let conn = self.conn();
        let removed = conn
            .execute(
                "DELETE FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)",
                params![user_id, other_id],
            )
            .context("failed to clear conversation")?;
        info!("Cleared {} messages between {} and {}", removed, user_id, other_id);
        Ok(removed)
    }

    pub fn unread_count(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                params![user_id],
                |row| row.get(0),
            )
            .context("failed to count unread messages")?;
        Ok(count as usize)
    }

    /// One summary per counterparty found among the user's `limit` most
    /// recent messages, most recent activity first.
    pub fn conversations(&self, user_id: &str, limit: u32) -> Result<Vec<ConversationSummary>> {
        let conn = self.conn();
        let recent = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE sender_id = ?1 OR receiver_id = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2"
                ))
                .context("failed to prepare conversations query")?;
            let rows = stmt
                .query_map(params![user_id, limit], |row| StoredMessage::from_row(row))
                .context("failed to query conversations")?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to map message rows")?;
            rows
        };

        let mut seen = HashSet::new();
        let mut summaries = Vec::new();
        for msg in &recent {
            let peer = if msg.sender_id == user_id {
                &msg.receiver_id
            } else {
                &msg.sender_id
            };
            if !seen.insert(peer.clone()) {
                continue;
            }
            let Some(user) = find_user(&conn, peer)? else {
                continue;
            };

            // `recent` is newest first, so the first message seen for a peer
            // is the latest one.
            let unread_count = recent
                .iter()
                .filter(|m| m.sender_id == *peer && m.receiver_id == user_id && !m.is_read)
                .count();

            summaries.push(ConversationSummary {
                user_id: user.id.clone(),
                display_name: user.profile().display_name(),
                role: user.role.clone(),
                last_message: preview(&msg.content),
                last_message_time: Some(msg.created_at),
                unread_count,
            });
        }
        Ok(summaries)
    }
}

fn find_user(conn: &Connection, id: &str) -> Result<Option<StoredUser>> {
    conn.query_row(
        "SELECT id, email, first_name, last_name, role FROM users WHERE id = ?1",
        params![id],
        |row| {
            Ok(StoredUser {
                id: row.get(0)?,
                email: row.get(1)?,
                first_name: row.get(2)?,
                last_name: row.get(3)?,
                role: row.get(4)?,
            })
        },
    )
    .optional()
    .context("failed to look up user")
}

fn get_message(conn: &Connection, id: &str) -> Result<Option<StoredMessage>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        params![id],
        |row| StoredMessage::from_row(row),
    )
    .optional()
    .context("failed to look up message")
}

fn check_content(content: &str) -> Result<()> {
    if content.trim().is_empty() || content.chars().count() > MAX_CONTENT_LEN {
        return Err(StoreError::InvalidContent {
            max: MAX_CONTENT_LEN,
        }
        .into());
    }
    Ok(())
}

fn preview(content: &str) -> String {
    content.chars().take(PREVIEW_LEN).collect()
}

// ---------------------------------------------------------------------------
// ChatApi backend
// ---------------------------------------------------------------------------

/// `ChatApi` served straight from a local [`Database`], acting as `user_id`.
pub struct StoreChatApi {
    db: Arc<Database>,
    user_id: String,
    page_size: u32,
}

impl StoreChatApi {
    pub fn new(db: Arc<Database>, user_id: impl Into<String>, page_size: u32) -> Self {
        Self {
            db,
            user_id: user_id.into(),
            page_size,
        }
    }
}

/// Domain rejections become typed API errors; everything else is a store
/// failure.
fn store_error(err: anyhow::Error) -> ApiError {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::SelfMessage) | Some(StoreError::InvalidContent { .. }) => {
            ApiError::Invalid(err.to_string())
        }
        Some(StoreError::RecipientNotFound) | Some(StoreError::MessageNotFound) => {
            ApiError::NotFound(err.to_string())
        }
        Some(StoreError::AccessDenied) => ApiError::Forbidden(err.to_string()),
        None => ApiError::Store(err),
    }
}

#[async_trait]
impl ChatApi for StoreChatApi {
    async fn fetch_history(&self, remote_user_id: &str) -> Result<ConversationHistory, ApiError> {
        let (user, page) = self
            .db
            .conversation(&self.user_id, remote_user_id, self.page_size, 0)
            .map_err(store_error)?;
        Ok(ConversationHistory {
            user,
            messages: page.iter().map(StoredMessage::to_wire).collect(),
        })
    }

    async fn edit_message(&self, message_id: &MessageId, content: &str) -> Result<(), ApiError> {
        self.db
            .edit_message(&self.user_id, message_id.as_str(), content)
            .map_err(store_error)?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<(), ApiError> {
        self.db
            .delete_message(&self.user_id, message_id.as_str())
            .map_err(store_error)
    }

    async fn clear_conversation(&self, remote_user_id: &str) -> Result<(), ApiError> {
        self.db
            .clear_conversation(&self.user_id, remote_user_id)
            .map_err(store_error)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport backend
// ---------------------------------------------------------------------------

/// `Transport` for a session served from a local [`Database`]. Writes go to
/// the store and their effects are published on the live feed, the way the
/// messaging server echoes them over the socket. Messages other users store
/// appear on the next history load.
pub struct StoreTransport {
    db: Arc<Database>,
    feed: Arc<LiveFeed>,
    user_id: String,
}

impl StoreTransport {
    /// The store is always reachable, so the feed is marked connected.
    pub fn new(db: Arc<Database>, feed: Arc<LiveFeed>, user_id: impl Into<String>) -> Self {
        feed.set_connected(true);
        Self {
            db,
            feed,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl Transport for StoreTransport {
    fn is_connected(&self) -> bool {
        self.feed.snapshot().connected
    }

    async fn send(&self, recipient_id: &str, content: &str) -> Result<bool, TransportError> {
        match self.db.insert_message(&self.user_id, recipient_id, content) {
            Ok(stored) => {
                self.feed.apply(ServerEvent::MessageSent(stored.to_wire()));
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to store message to {}: {}", recipient_id, e);
                self.feed.apply(ServerEvent::MessageError {
                    message: e.to_string(),
                });
                Ok(false)
            }
        }
    }

    async fn mark_read(&self, message_id: &MessageId) -> Result<(), TransportError> {
        self.db.mark_read(&self.user_id, message_id.as_str())?;
        self.feed.apply(ServerEvent::MessageRead {
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    async fn emit_typing(&self, _recipient_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn emit_stop_typing(&self, _recipient_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn broadcast_edit(
        &self,
        _recipient_id: &str,
        message_id: &MessageId,
        content: &str,
    ) -> Result<(), TransportError> {
        self.feed.apply(ServerEvent::MessageEdited {
            message_id: message_id.to_string(),
            content: content.to_string(),
        });
        Ok(())
    }

    async fn broadcast_delete(
        &self,
        _recipient_id: &str,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        self.feed.apply(ServerEvent::MessageDeleted {
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    async fn broadcast_clear(&self, recipient_id: &str) -> Result<(), TransportError> {
        self.feed.apply(ServerEvent::ConversationCleared {
            user_id: recipient_id.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn test_db() -> Database {
        let db = Database::open(":memory:").expect("in-memory database should open");
        for (id, first) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
            db.upsert_user(&StoredUser {
                id: id.into(),
                email: format!("{id}@example.com"),
                first_name: Some(first.into()),
                last_name: None,
                role: "client".into(),
            })
            .unwrap();
        }
        db
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn store_err(err: anyhow::Error) -> StoreError {
        err.downcast::<StoreError>().expect("expected a StoreError")
    }

    #[test]
    fn open_creates_tables() {
        let db = test_db();
        let conn = db.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('users','messages')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn insert_validates_recipient_and_content() {
        let db = test_db();
        assert_eq!(
            store_err(db.insert_message("alice", "alice", "hi").unwrap_err()),
            StoreError::SelfMessage
        );
        assert_eq!(
            store_err(db.insert_message("alice", "nobody", "hi").unwrap_err()),
            StoreError::RecipientNotFound
        );
        assert_eq!(
            store_err(db.insert_message("alice", "bob", "").unwrap_err()),
            StoreError::InvalidContent { max: MAX_CONTENT_LEN }
        );
        let long = "é".repeat(MAX_CONTENT_LEN + 1);
        assert!(db.insert_message("alice", "bob", &long).is_err());
        let limit = "é".repeat(MAX_CONTENT_LEN);
        assert!(db.insert_message("alice", "bob", &limit).is_ok());
    }

    #[test]
    fn insert_generates_unique_ids() {
        let db = test_db();
        let a = db.insert_message("alice", "bob", "one").unwrap();
        let b = db.insert_message("alice", "bob", "two").unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(db.get_message(&a.id).unwrap().unwrap().content, "one");
    }

    #[test]
    fn conversation_pages_ascending_and_marks_read() {
        let db = test_db();
        db.insert_message_at("bob", "alice", "first", at(1)).unwrap();
        db.insert_message_at("alice", "bob", "second", at(2)).unwrap();
        db.insert_message_at("bob", "alice", "third", at(3)).unwrap();
        db.insert_message_at("carol", "alice", "other", at(4)).unwrap();

        let (profile, page) = db.conversation("alice", "bob", 2, 0).unwrap();
        assert_eq!(profile.unwrap().first_name.as_deref(), Some("Bob"));
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["second", "third"]);
        // The page shows the state before this read.
        assert!(!page[1].is_read);

        let (_, older) = db.conversation("alice", "bob", 2, 2).unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].content, "first");
        assert!(older[0].is_read);

        // Only bob's messages to alice were marked; carol's stay unread.
        assert_eq!(db.unread_count("alice").unwrap(), 1);
        assert_eq!(db.unread_count("bob").unwrap(), 1);
    }

    #[test]
    fn conversation_with_unknown_user_has_no_profile() {
        let db = test_db();
        let (profile, page) = db.conversation("alice", "ghost", 50, 0).unwrap();
        assert!(profile.is_none());
        assert!(page.is_empty());
    }

    #[test]
    fn mark_read_is_recipient_only_and_idempotent() {
        let db = test_db();
        let msg = db.insert_message("bob", "alice", "hi").unwrap();

        assert_eq!(
            store_err(db.mark_read("bob", &msg.id).unwrap_err()),
            StoreError::AccessDenied
        );
        db.mark_read("alice", &msg.id).unwrap();
        let once = db.get_message(&msg.id).unwrap();
        db.mark_read("alice", &msg.id).unwrap();
        assert_eq!(db.get_message(&msg.id).unwrap(), once);
        assert!(once.unwrap().is_read);

        assert_eq!(
            store_err(db.mark_read("alice", "missing").unwrap_err()),
            StoreError::MessageNotFound
        );
    }

    #[test]
    fn edit_is_sender_only_and_resets_read() {
        let db = test_db();
        let msg = db.insert_message("alice", "bob", "typo").unwrap();
        db.mark_read("bob", &msg.id).unwrap();

        assert_eq!(
            store_err(db.edit_message("bob", &msg.id, "hijack").unwrap_err()),
            StoreError::AccessDenied
        );
        let edited = db.edit_message("alice", &msg.id, "fixed").unwrap();
        assert_eq!(edited.content, "fixed");
        assert!(!db.get_message(&msg.id).unwrap().unwrap().is_read);
    }

    #[test]
    fn delete_allowed_for_participants_only() {
        let db = test_db();
        let msg = db.insert_message("alice", "bob", "bye").unwrap();
        assert_eq!(
            store_err(db.delete_message("carol", &msg.id).unwrap_err()),
            StoreError::AccessDenied
        );
        db.delete_message("bob", &msg.id).unwrap();
        assert!(db.get_message(&msg.id).unwrap().is_none());
    }

    #[test]
    fn clear_removes_only_the_pair() {
        let db = test_db();
        db.insert_message("alice", "bob", "a").unwrap();
        db.insert_message("bob", "alice", "b").unwrap();
        db.insert_message("alice", "carol", "c").unwrap();

        assert_eq!(db.clear_conversation("alice", "bob").unwrap(), 2);
        assert!(db.conversation("alice", "bob", 50, 0).unwrap().1.is_empty());
        assert_eq!(db.conversation("alice", "carol", 50, 0).unwrap().1.len(), 1);
    }

    #[test]
    fn conversations_summarize_by_recent_activity() {
        let db = test_db();
        db.insert_message_at("bob", "alice", &"x".repeat(80), at(1)).unwrap();
        db.insert_message_at("bob", "alice", "again", at(2)).unwrap();
        db.insert_message_at("alice", "carol", "hello carol", at(3)).unwrap();

        let list = db.conversations("alice", 50).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].user_id, "carol");
        assert_eq!(list[0].last_message, "hello carol");
        assert_eq!(list[0].unread_count, 0);
        assert_eq!(list[1].user_id, "bob");
        assert_eq!(list[1].display_name, "Bob");
        assert_eq!(list[1].last_message, "again");
        assert_eq!(list[1].unread_count, 2);
        assert_eq!(list[1].last_message_time, Some(at(2)));

        db.clear_conversation("alice", "carol").unwrap();
        db.insert_message_at("alice", "carol", &"y".repeat(80), at(4)).unwrap();
        let list = db.conversations("alice", 50).unwrap();
        assert_eq!(list[0].last_message.chars().count(), PREVIEW_LEN);
    }

    #[test]
    fn wire_form_round_trips_created_at() {
        let db = test_db();
        let msg = db.insert_message_at("alice", "bob", "hi", at(0)).unwrap();
        let wire = msg.to_wire();
        assert_eq!(
            wire.created_at,
            Some(Value::String("2026-03-01T12:00:00.000Z".into()))
        );
        assert_eq!(db.get_message(&msg.id).unwrap().unwrap().created_at, at(0));
    }

    #[test]
    fn unreadable_created_at_falls_back_to_now() {
        let db = test_db();
        db.conn()
            .execute(
                "INSERT INTO messages (id, sender_id, receiver_id, content, created_at)
                 VALUES ('odd', 'bob', 'alice', 'hi', 'not a time')",
                [],
            )
            .unwrap();

        let before = Utc::now();
        let msg = db.get_message("odd").unwrap().unwrap();
        assert!(msg.created_at >= before);
        assert!(msg.created_at <= Utc::now());
    }

    #[test]
    fn local_user_comes_from_config() {
        let user = StoredUser::from_config(&UserConfig {
            id: "alice".into(),
            name: "Alice  van Dijk".into(),
            email: "alice@example.com".into(),
            role: "client".into(),
        });
        assert_eq!(user.first_name.as_deref(), Some("Alice"));
        assert_eq!(user.last_name.as_deref(), Some("van Dijk"));
        assert_eq!(user.profile().display_name(), "Alice van Dijk");

        let unnamed = StoredUser::from_config(&UserConfig {
            id: "bob".into(),
            name: String::new(),
            email: "bob@example.com".into(),
            role: "lawyer".into(),
        });
        assert_eq!(unnamed.first_name, None);
        assert_eq!(unnamed.last_name, None);
    }

    #[tokio::test]
    async fn store_transport_writes_and_echoes_to_feed() {
        let db = Arc::new(test_db());
        let feed = Arc::new(LiveFeed::new("alice"));
        let transport = StoreTransport::new(Arc::clone(&db), Arc::clone(&feed), "alice");
        assert!(transport.is_connected());

        assert!(transport.send("bob", "hello bob").await.unwrap());
        let sent = feed.snapshot().messages[0].clone();
        assert_eq!(sent.content, "hello bob");
        assert_eq!(db.get_message(sent.id.as_str()).unwrap().unwrap().receiver_id, "bob");

        transport
            .broadcast_edit("bob", &sent.id, "hello again")
            .await
            .unwrap();
        assert_eq!(feed.snapshot().messages[0].content, "hello again");
        transport.broadcast_delete("bob", &sent.id).await.unwrap();
        assert!(feed.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn store_transport_reports_rejected_sends() {
        let db = Arc::new(test_db());
        let feed = Arc::new(LiveFeed::new("alice"));
        let transport = StoreTransport::new(Arc::clone(&db), Arc::clone(&feed), "alice");

        assert!(!transport.send("nobody", "hi").await.unwrap());
        let snap = feed.snapshot();
        assert!(snap.messages.is_empty());
        assert_eq!(snap.error_since(0), Some("Recipient not found"));
    }

    #[tokio::test]
    async fn store_transport_marks_read_for_recipient() {
        let db = Arc::new(test_db());
        let incoming = db.insert_message("bob", "alice", "hi").unwrap();
        let feed = Arc::new(LiveFeed::new("alice"));
        let transport = StoreTransport::new(Arc::clone(&db), feed, "alice");

        transport
            .mark_read(&MessageId::new(incoming.id.clone()))
            .await
            .unwrap();
        assert!(db.get_message(&incoming.id).unwrap().unwrap().is_read);

        let outgoing = db.insert_message("alice", "bob", "yo").unwrap();
        assert!(matches!(
            transport.mark_read(&MessageId::new(outgoing.id)).await,
            Err(TransportError::Store(_))
        ));
    }

    #[tokio::test]
    async fn store_api_maps_domain_errors() {
        let db = Arc::new(test_db());
        let msg = db.insert_message("alice", "bob", "hi").unwrap();
        let as_bob = StoreChatApi::new(Arc::clone(&db), "bob", 50);

        assert!(matches!(
            as_bob.edit_message(&MessageId::new(msg.id.clone()), "mine").await,
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            as_bob.delete_message(&MessageId::new("missing")).await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            as_bob.edit_message(&MessageId::new(msg.id.clone()), " ").await,
            Err(ApiError::Invalid(_))
        ));

        let history = as_bob.fetch_history("alice").await.unwrap();
        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.user.unwrap().id, "alice");
        assert_eq!(db.unread_count("bob").unwrap(), 0);
    }
}
