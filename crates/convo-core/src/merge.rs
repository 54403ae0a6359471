// Conversation filtering and the history/live merge.
//
// Everything here is a pure function of its inputs: the same history and
// live snapshot always produce the same ordered view.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::message::{Message, MessageId};
use crate::normalize::normalize_id;

// ---------------------------------------------------------------------------
// Conversation identity
// ---------------------------------------------------------------------------

/// The (local, remote) pair a view is opened for, with both ids normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    local: String,
    remote: String,
}

impl ConversationKey {
    pub fn new(local_user_id: &str, remote_user_id: &str) -> Self {
        Self {
            local: normalize_id(Some(local_user_id)),
            remote: normalize_id(Some(remote_user_id)),
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// A key with an empty side matches nothing.
    pub fn is_valid(&self) -> bool {
        !self.local.is_empty() && !self.remote.is_empty()
    }

    /// Whether `msg` travels between the two parties, in either direction.
    pub fn contains(&self, msg: &Message) -> bool {
        if !self.is_valid() {
            return false;
        }
        let sender = normalize_id(Some(&msg.sender_id));
        let recipient = normalize_id(Some(&msg.recipient_id));
        (sender == self.local && recipient == self.remote)
            || (sender == self.remote && recipient == self.local)
    }

    /// Whether `msg` belongs to this conversation and was authored by the
    /// remote party.
    pub fn is_from_remote(&self, msg: &Message) -> bool {
        self.contains(msg) && normalize_id(Some(&msg.sender_id)) == self.remote
    }
}

/// Live messages belonging to the conversation identified by `key`.
pub fn filter_live<'a>(
    live: &'a [Message],
    key: &'a ConversationKey,
) -> impl Iterator<Item = &'a Message> + 'a {
    live.iter().filter(move |m| key.contains(m))
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merge a history page with the live feed into one ordered list.
///
/// History entries are taken as-is. Live entries are filtered to the
/// conversation and replace any history entry with the same id, keeping that
/// entry's slot. The result is stably sorted by timestamp, so ties keep
/// insertion order and the output is deterministic.
pub fn merge_conversation(
    history: &[Message],
    live: &[Message],
    key: &ConversationKey,
) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(history.len() + live.len());
    let mut index: HashMap<MessageId, usize> = HashMap::with_capacity(merged.capacity());

    for msg in history.iter().chain(filter_live(live, key)) {
        match index.get(&msg.id) {
            Some(&slot) => {
                if merged[slot].content != msg.content {
                    debug!(
                        "Live copy of message {} differs in content from history; using live",
                        msg.id
                    );
                }
                merged[slot] = msg.clone();
            }
            None => {
                index.insert(msg.id.clone(), merged.len());
                merged.push(msg.clone());
            }
        }
    }

    merged.sort_by_key(|m| m.timestamp);
    merged
}

// ---------------------------------------------------------------------------
// Local patches
// ---------------------------------------------------------------------------

/// Overlay of local edits and deletions that the live feed will never echo
/// back to this client. Message ids are globally unique, so one overlay
/// serves every conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalPatches {
    edited: HashMap<MessageId, String>,
    deleted: HashSet<MessageId>,
}

impl LocalPatches {
    pub fn is_empty(&self) -> bool {
        self.edited.is_empty() && self.deleted.is_empty()
    }

    /// Record new content for `id`. Returns the previously patched content.
    pub fn edit(&mut self, id: &MessageId, content: &str) -> Option<String> {
        self.edited.insert(id.clone(), content.to_string())
    }

    /// Undo an [`edit`](Self::edit), restoring whatever patch existed before.
    pub fn restore_edit(&mut self, id: &MessageId, previous: Option<String>) {
        match previous {
            Some(content) => {
                self.edited.insert(id.clone(), content);
            }
            None => {
                self.edited.remove(id);
            }
        }
    }

    /// Hide `id`. Returns `false` if it was already hidden.
    pub fn delete(&mut self, id: &MessageId) -> bool {
        self.deleted.insert(id.clone())
    }

    pub fn undelete(&mut self, id: &MessageId) {
        self.deleted.remove(id);
    }

    /// Apply the overlay to a merged list.
    pub fn apply(&self, messages: Vec<Message>) -> Vec<Message> {
        if self.is_empty() {
            return messages;
        }
        messages
            .into_iter()
            .filter(|m| !self.deleted.contains(&m.id))
            .map(|mut m| {
                if let Some(content) = self.edited.get(&m.id) {
                    m.content = content.clone();
                }
                m
            })
            .collect()
    }
}
