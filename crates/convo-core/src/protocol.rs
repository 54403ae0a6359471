// Protocol types: socket events on the wire, and the command/update channels
// between the event loop and a front end.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, MessageId, PresenceEntry, UserProfile, WireMessage};

// ---------------------------------------------------------------------------
// Socket events (server -> client)
// ---------------------------------------------------------------------------

/// Events pushed by the messaging server. Framed as
/// `{"event": "<snake_case name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// A message addressed to the local user.
    NewMessage(WireMessage),
    /// Echo of a message the local user sent, carrying its server id.
    MessageSent(WireMessage),
    MessageRead {
        message_id: String,
    },
    MessageEdited {
        message_id: String,
        content: String,
    },
    MessageDeleted {
        message_id: String,
    },
    /// The peer identified by `user_id` cleared its conversation with us.
    ConversationCleared {
        user_id: String,
    },
    UserTyping {
        sender_id: String,
        #[serde(default)]
        sender_name: Option<String>,
    },
    UserStopTyping {
        sender_id: String,
    },
    OnlineUsers(Vec<PresenceEntry>),
    UserStatusChanged {
        user_id: String,
        status: PresenceStatus,
        #[serde(default)]
        user_name: Option<String>,
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        timestamp: Option<Value>,
    },
    MessageError {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

// ---------------------------------------------------------------------------
// Socket events (client -> server)
// ---------------------------------------------------------------------------

/// Events the client emits. Same framing as [`ServerEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    UserOnline {
        name: String,
        email: String,
        role: String,
    },
    SendMessage {
        recipient_id: String,
        content: String,
    },
    MarkMessageRead {
        message_id: String,
    },
    UserTyping {
        recipient_id: String,
    },
    UserStopTyping {
        recipient_id: String,
    },
    MessageEdited {
        recipient_id: String,
        message_id: String,
        content: String,
    },
    MessageDeleted {
        recipient_id: String,
        message_id: String,
    },
    ConversationCleared {
        recipient_id: String,
    },
}

// ---------------------------------------------------------------------------
// Front end <-> event loop
// ---------------------------------------------------------------------------

/// Commands sent from the front end to the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Switch the view to the conversation with this user.
    Open(String),
    /// The input field now holds this text.
    Input(String),
    Send,
    Edit {
        message_id: MessageId,
        content: String,
    },
    Delete(MessageId),
    /// Clear the whole conversation. `confirmed` is the user's answer to the
    /// confirmation prompt.
    Clear {
        confirmed: bool,
    },
    /// Re-fetch history for the open conversation.
    Refresh,
    Quit,
}

/// Loading state of the history half of the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryState {
    #[default]
    Idle,
    Loading,
    Loaded,
    Failed,
}

/// Everything a front end needs to render one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub local_user_id: String,
    pub remote_user_id: String,
    pub remote_profile: Option<UserProfile>,
    pub remote_presence: Option<PresenceEntry>,
    pub remote_typing: bool,
    pub connected: bool,
    pub history: HistoryState,
    pub messages: Vec<Message>,
}

/// Which network operation a notice refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    FetchHistory,
    Send,
    Edit,
    Delete,
    Clear,
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::FetchHistory => "load history",
            Operation::Send => "send",
            Operation::Edit => "edit",
            Operation::Delete => "delete",
            Operation::Clear => "clear conversation",
        }
    }
}

/// Transient user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Failed { operation: Operation, message: String },
    Info(String),
}

/// Updates pushed from the event loop to the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    View(ViewSnapshot),
    /// The input field must show this text (cleared on send, restored on
    /// failure).
    Draft(String),
    Notice(Notice),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_event_new_message_parses() {
        let json = r#"{"event":"new_message","data":{"id":"m1","senderId":"bob",
            "senderName":"Bob","content":"hi","timestamp":"2026-03-01T12:00:00Z",
            "isRead":false,"receiverId":"alice"}}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::NewMessage(wire) => {
                assert_eq!(wire.id.as_deref(), Some("m1"));
                assert_eq!(wire.recipient_id.as_deref(), Some("alice"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn server_event_camel_case_fields() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"event":"message_read","data":{"messageId":"m9"}}"#)
                .unwrap();
        assert_eq!(
            event,
            ServerEvent::MessageRead {
                message_id: "m9".into()
            }
        );

        let event: ServerEvent = serde_json::from_str(
            r#"{"event":"user_status_changed","data":{"userId":"u2","status":"offline"}}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            ServerEvent::UserStatusChanged {
                status: PresenceStatus::Offline,
                ..
            }
        ));
    }

    #[test]
    fn online_users_is_a_list() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"event":"online_users","data":[{"userId":"u1","userName":"Ann","role":"lawyer"}]}"#,
        )
        .unwrap();
        match event {
            ServerEvent::OnlineUsers(users) => assert_eq!(users[0].display_name, "Ann"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        let result = serde_json::from_str::<ServerEvent>(r#"{"event":"reaction","data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn client_event_wire_shape() {
        let event = ClientEvent::MessageEdited {
            recipient_id: "bob".into(),
            message_id: "m1".into(),
            content: "fixed".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "event": "message_edited",
                "data": {"recipientId": "bob", "messageId": "m1", "content": "fixed"}
            })
        );
    }
}
