// Shared live feed: the single-writer store of socket-delivered state.
//
// The transport is the only writer. Every change publishes a new immutable
// snapshot on a watch channel; views subscribe and filter it themselves.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::merge::ConversationKey;
use crate::message::{Message, MessageId, PresenceEntry};
use crate::normalize::{ids_match, normalize_id, parse_timestamp};
use crate::protocol::{PresenceStatus, ServerEvent};

/// One published state of the live feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveSnapshot {
    pub connected: bool,
    /// Messages in arrival order, at most one per id.
    pub messages: Vec<Message>,
    /// Normalized ids of users currently typing to us.
    pub typing: HashSet<String>,
    pub online: Vec<PresenceEntry>,
    pub last_error: Option<String>,
    /// Bumped on every recorded error, so a repeat of the same message is
    /// still a new error.
    pub error_seq: u64,
}

impl LiveSnapshot {
    pub fn is_typing(&self, user_id: &str) -> bool {
        let id = normalize_id(Some(user_id));
        !id.is_empty() && self.typing.contains(&id)
    }

    /// The latest error if it was recorded after `seen`.
    pub fn error_since(&self, seen: u64) -> Option<&str> {
        if self.error_seq > seen {
            self.last_error.as_deref()
        } else {
            None
        }
    }

    fn record_error(&mut self, message: String) {
        self.last_error = Some(message);
        self.error_seq += 1;
    }

    pub fn presence(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.online
            .iter()
            .find(|p| ids_match(Some(&p.user_id), Some(user_id)))
    }

    fn upsert_message(&mut self, msg: Message) {
        match self.messages.iter_mut().find(|m| m.id == msg.id) {
            Some(existing) => {
                // A read receipt is never undone by a later copy.
                let is_read = existing.is_read || msg.is_read;
                *existing = Message { is_read, ..msg };
            }
            None => self.messages.push(msg),
        }
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id.as_str() == id)
    }

    fn upsert_presence(&mut self, entry: PresenceEntry) {
        match self
            .online
            .iter_mut()
            .find(|p| ids_match(Some(&p.user_id), Some(&entry.user_id)))
        {
            Some(existing) => {
                if !entry.display_name.is_empty() {
                    existing.display_name = entry.display_name;
                }
                if !entry.role.is_empty() {
                    existing.role = entry.role;
                }
                existing.last_seen = entry.last_seen;
            }
            None => self.online.push(entry),
        }
    }
}

pub type LiveReceiver = watch::Receiver<Arc<LiveSnapshot>>;

/// Apply one server event to a snapshot. Returns whether anything changed.
///
/// `now` is the arrival instant, used as the fallback timestamp.
pub fn apply_event(
    snapshot: &mut LiveSnapshot,
    local_user_id: &str,
    event: ServerEvent,
    now: DateTime<Utc>,
) -> bool {
    match event {
        ServerEvent::NewMessage(wire) | ServerEvent::MessageSent(wire) => {
            match Message::from_wire(wire, now) {
                Some(msg) => {
                    snapshot.upsert_message(msg);
                    true
                }
                None => false,
            }
        }
        ServerEvent::MessageRead { message_id } => match snapshot.message_mut(&message_id) {
            Some(msg) if !msg.is_read => {
                msg.is_read = true;
                true
            }
            _ => false,
        },
        ServerEvent::MessageEdited {
            message_id,
            content,
        } => match snapshot.message_mut(&message_id) {
            Some(msg) if msg.content != content => {
                msg.content = content;
                true
            }
            _ => false,
        },
        ServerEvent::MessageDeleted { message_id } => {
            let id = MessageId::new(message_id);
            let before = snapshot.messages.len();
            snapshot.messages.retain(|m| m.id != id);
            snapshot.messages.len() != before
        }
        ServerEvent::ConversationCleared { user_id } => {
            let key = ConversationKey::new(local_user_id, &user_id);
            let before = snapshot.messages.len();
            snapshot.messages.retain(|m| !key.contains(m));
            snapshot.messages.len() != before
        }
        ServerEvent::UserTyping { sender_id, .. } => {
            let id = normalize_id(Some(&sender_id));
            !id.is_empty() && snapshot.typing.insert(id)
        }
        ServerEvent::UserStopTyping { sender_id } => {
            snapshot.typing.remove(&normalize_id(Some(&sender_id)))
        }
        ServerEvent::OnlineUsers(users) => {
            let users: Vec<PresenceEntry> = users
                .into_iter()
                .map(|p| PresenceEntry {
                    last_seen: None,
                    ..p
                })
                .collect();
            if snapshot.online == users {
                return false;
            }
            snapshot.online = users;
            true
        }
        ServerEvent::UserStatusChanged {
            user_id,
            status,
            user_name,
            role,
            timestamp,
        } => {
            let last_seen = match status {
                PresenceStatus::Online => None,
                PresenceStatus::Offline => {
                    snapshot.typing.remove(&normalize_id(Some(&user_id)));
                    Some(timestamp.as_ref().and_then(parse_timestamp).unwrap_or(now))
                }
            };
            snapshot.upsert_presence(PresenceEntry {
                user_id,
                display_name: user_name.unwrap_or_default(),
                role: role.unwrap_or_default(),
                last_seen,
            });
            true
        }
        ServerEvent::MessageError { message } => {
            warn!("Server reported message error: {}", message);
            snapshot.record_error(message);
            true
        }
    }
}

/// Owner of the live feed. Held by the transport; everyone else subscribes.
#[derive(Debug)]
pub struct LiveFeed {
    local_user_id: String,
    tx: watch::Sender<Arc<LiveSnapshot>>,
}

impl LiveFeed {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(LiveSnapshot::default()));
        Self {
            local_user_id: local_user_id.into(),
            tx,
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn subscribe(&self) -> LiveReceiver {
        self.tx.subscribe()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<LiveSnapshot> {
        self.tx.borrow().clone()
    }

    /// Update the connection flag. Typing indicators do not survive a
    /// disconnect.
    pub fn set_connected(&self, connected: bool) {
        self.modify(|snap| {
            if snap.connected == connected {
                return false;
            }
            snap.connected = connected;
            if !connected {
                snap.typing.clear();
            }
            true
        });
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.modify(|snap| {
            snap.record_error(message);
            true
        });
    }

    pub fn apply(&self, event: ServerEvent) {
        self.apply_at(event, Utc::now());
    }

    pub fn apply_at(&self, event: ServerEvent, now: DateTime<Utc>) {
        let local = self.local_user_id.as_str();
        let changed = self.modify(|snap| apply_event(snap, local, event, now));
        if !changed {
            debug!("Live event produced no change");
        }
    }

    fn modify(&self, f: impl FnOnce(&mut LiveSnapshot) -> bool) -> bool {
        self.tx
            .send_if_modified(|current| f(Arc::make_mut(current)))
    }
}
