// Chat data model: wire payloads and their normalized counterparts.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::normalize::{effective_timestamp, ids_match};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque, globally unique message identity. Compared exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// A message as delivered by the history API or the live socket.
///
/// Every field is optional on the wire. Ids may arrive as strings or numbers,
/// `recipientId` is also accepted as `receiverId`, and timestamps may be
/// strings, epoch milliseconds, or missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(
        default,
        alias = "receiverId",
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,
}

/// Accept a string, a number, or null for an id-like field.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Normalized form
// ---------------------------------------------------------------------------

/// A normalized message, as held in history, the live feed, and the view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: String,
    pub recipient_id: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
}

impl Message {
    /// Normalize a wire message. `now` is the fallback instant for missing or
    /// unparseable timestamps and is fixed at the moment of arrival.
    ///
    /// Returns `None` only for messages without an id, which cannot take part
    /// in de-duplication.
    pub fn from_wire(wire: WireMessage, now: DateTime<Utc>) -> Option<Self> {
        let id = match wire.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => MessageId::new(id),
            _ => {
                debug!("Dropping message without an id");
                return None;
            }
        };
        let timestamp =
            effective_timestamp(wire.timestamp.as_ref(), wire.created_at.as_ref(), now);
        Some(Message {
            id,
            sender_id: wire.sender_id.unwrap_or_default(),
            recipient_id: wire.recipient_id.unwrap_or_default(),
            sender_name: wire.sender_name,
            content: wire.content.unwrap_or_default(),
            timestamp,
            is_read: wire.is_read.unwrap_or(false),
        })
    }

    /// Normalize a batch, dropping id-less entries.
    pub fn from_wire_batch(wires: Vec<WireMessage>, now: DateTime<Utc>) -> Vec<Self> {
        wires
            .into_iter()
            .filter_map(|w| Message::from_wire(w, now))
            .collect()
    }

    /// Whether `user_id` authored this message (case-insensitive).
    pub fn is_from(&self, user_id: &str) -> bool {
        ids_match(Some(&self.sender_id), Some(user_id))
    }
}

// ---------------------------------------------------------------------------
// Presence and profiles
// ---------------------------------------------------------------------------

/// One entry of the online-users broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    #[serde(default, alias = "userName")]
    pub display_name: String,
    #[serde(default)]
    pub role: String,
    /// `None` while the user is online.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl PresenceEntry {
    pub fn is_online(&self) -> bool {
        self.last_seen.is_none()
    }
}

/// Counterparty profile returned with a conversation history page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl UserProfile {
    /// "First Last", whichever parts exist, else the email.
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if name.is_empty() {
            self.email.clone()
        } else {
            name
        }
    }
}

/// Response of a conversation history fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationHistory {
    #[serde(default)]
    pub user: Option<UserProfile>,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub user_id: String,
    pub display_name: String,
    pub role: String,
    pub last_message: String,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: usize,
}
