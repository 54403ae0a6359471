// Turns event-loop updates into terminal lines.
//
// The renderer remembers what it already printed so each view snapshot only
// produces the lines that changed.

use std::collections::HashMap;

use chrono::Local;
use convo_core::message::{ConversationSummary, Message, MessageId};
use convo_core::protocol::{HistoryState, Notice, UiUpdate, ViewSnapshot};

#[derive(Debug, Default)]
pub struct Renderer {
    remote_user_id: String,
    connected: Option<bool>,
    history: HistoryState,
    remote_typing: bool,
    remote_online: Option<bool>,
    shown: HashMap<MessageId, String>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, update: &UiUpdate) -> Vec<String> {
        match update {
            UiUpdate::View(view) => self.render_view(view),
            UiUpdate::Draft(text) if !text.is_empty() => {
                vec![format!("(not sent, draft kept) {text}")]
            }
            UiUpdate::Draft(_) => Vec::new(),
            UiUpdate::Notice(Notice::Failed { operation, message }) => {
                vec![format!("! could not {}: {}", operation.label(), message)]
            }
            UiUpdate::Notice(Notice::Info(message)) => vec![format!("* {message}")],
        }
    }

    fn render_view(&mut self, view: &ViewSnapshot) -> Vec<String> {
        let mut lines = Vec::new();
        let peer = peer_name(view);

        if view.remote_user_id != self.remote_user_id {
            self.remote_user_id = view.remote_user_id.clone();
            self.shown.clear();
            self.history = HistoryState::Idle;
            self.remote_typing = false;
            self.remote_online = None;
            if !view.remote_user_id.is_empty() {
                lines.push(format!("--- conversation with {peer} ---"));
            }
        }

        if self.connected != Some(view.connected) {
            self.connected = Some(view.connected);
            lines.push(if view.connected {
                "[connected]".to_string()
            } else {
                "[offline, messages cannot be sent]".to_string()
            });
        }

        if view.history != self.history {
            self.history = view.history;
            if view.history == HistoryState::Loading {
                lines.push("loading history...".to_string());
            }
        }

        let online = view.remote_presence.as_ref().map(|p| p.is_online());
        if online != self.remote_online {
            self.remote_online = online;
            match &view.remote_presence {
                Some(p) if p.is_online() => lines.push(format!("{peer} is online")),
                Some(p) => {
                    if let Some(seen) = p.last_seen {
                        lines.push(format!(
                            "{peer} went offline (last seen {})",
                            seen.with_timezone(&Local).format("%H:%M")
                        ));
                    }
                }
                None => {}
            }
        }

        for msg in &view.messages {
            match self.shown.get(&msg.id) {
                None => lines.push(message_line(msg, view, &peer, "")),
                Some(content) if *content != msg.content => {
                    lines.push(message_line(msg, view, &peer, " (edited)"))
                }
                Some(_) => continue,
            }
            self.shown.insert(msg.id.clone(), msg.content.clone());
        }

        let mut removed: Vec<MessageId> = self
            .shown
            .keys()
            .filter(|id| !view.messages.iter().any(|m| &m.id == *id))
            .cloned()
            .collect();
        removed.sort();
        for id in removed {
            self.shown.remove(&id);
            lines.push(format!("[message {id} deleted]"));
        }

        if view.remote_typing != self.remote_typing {
            self.remote_typing = view.remote_typing;
            if view.remote_typing {
                lines.push(format!("{peer} is typing..."));
            }
        }

        lines
    }
}

fn peer_name(view: &ViewSnapshot) -> String {
    view.remote_profile
        .as_ref()
        .map(|p| p.display_name())
        .filter(|n| !n.is_empty())
        .or_else(|| {
            view.remote_presence
                .as_ref()
                .map(|p| p.display_name.clone())
                .filter(|n| !n.is_empty())
        })
        .unwrap_or_else(|| view.remote_user_id.clone())
}

fn message_line(msg: &Message, view: &ViewSnapshot, peer: &str, suffix: &str) -> String {
    let who = if msg.is_from(&view.local_user_id) {
        "you".to_string()
    } else {
        msg.sender_name.clone().unwrap_or_else(|| peer.to_string())
    };
    format!(
        "[{}] {} <{}>{}: {}",
        msg.timestamp.with_timezone(&Local).format("%H:%M"),
        who,
        msg.id,
        suffix,
        msg.content
    )
}

pub fn summary_line(summary: &ConversationSummary) -> String {
    let unread = if summary.unread_count > 0 {
        format!(" [{} unread]", summary.unread_count)
    } else {
        String::new()
    };
    format!(
        "{} ({}, {}){}: {}",
        summary.display_name, summary.user_id, summary.role, unread, summary.last_message
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use convo_core::protocol::Operation;

    fn msg(id: &str, from: &str, content: &str) -> Message {
        Message {
            id: MessageId::new(id),
            sender_id: from.into(),
            recipient_id: if from == "alice" { "bob" } else { "alice" }.into(),
            sender_name: None,
            content: content.into(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            is_read: false,
        }
    }

    fn view(messages: Vec<Message>) -> ViewSnapshot {
        ViewSnapshot {
            local_user_id: "alice".into(),
            remote_user_id: "bob".into(),
            remote_profile: None,
            remote_presence: None,
            remote_typing: false,
            connected: true,
            history: HistoryState::Loaded,
            messages,
        }
    }

    #[test]
    fn first_view_prints_header_and_messages() {
        let mut r = Renderer::new();
        let lines = r.render(&UiUpdate::View(view(vec![
            msg("m1", "bob", "hi"),
            msg("m2", "alice", "hello"),
        ])));
        assert_eq!(lines[0], "--- conversation with bob ---");
        assert_eq!(lines[1], "[connected]");
        assert!(lines[2].contains("bob <m1>: hi"));
        assert!(lines[3].contains("you <m2>: hello"));
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn only_changes_are_printed_again() {
        let mut r = Renderer::new();
        r.render(&UiUpdate::View(view(vec![
            msg("m1", "bob", "hi"),
            msg("m2", "alice", "typo"),
        ])));

        assert!(r
            .render(&UiUpdate::View(view(vec![
                msg("m1", "bob", "hi"),
                msg("m2", "alice", "typo"),
            ])))
            .is_empty());

        let lines = r.render(&UiUpdate::View(view(vec![msg("m2", "alice", "fixed")])));
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("<m2> (edited): fixed"));
        assert_eq!(lines[1], "[message m1 deleted]");
    }

    #[test]
    fn typing_is_announced_once() {
        let mut r = Renderer::new();
        let mut v = view(vec![]);
        r.render(&UiUpdate::View(v.clone()));
        v.remote_typing = true;
        assert_eq!(r.render(&UiUpdate::View(v.clone())), vec!["bob is typing..."]);
        assert!(r.render(&UiUpdate::View(v)).is_empty());
    }

    #[test]
    fn presence_transitions_are_printed() {
        use convo_core::message::PresenceEntry;

        let mut r = Renderer::new();
        let mut v = view(vec![]);
        v.remote_presence = Some(PresenceEntry {
            user_id: "bob".into(),
            display_name: "Bob".into(),
            role: "lawyer".into(),
            last_seen: None,
        });
        let lines = r.render(&UiUpdate::View(v.clone()));
        assert_eq!(lines.last().unwrap(), "Bob is online");

        if let Some(p) = v.remote_presence.as_mut() {
            p.last_seen = Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        }
        let lines = r.render(&UiUpdate::View(v));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Bob went offline"));
    }

    #[test]
    fn notices_and_restored_drafts_render() {
        let mut r = Renderer::new();
        assert_eq!(
            r.render(&UiUpdate::Notice(Notice::Failed {
                operation: Operation::Edit,
                message: "Access denied".into(),
            })),
            vec!["! could not edit: Access denied"]
        );
        assert_eq!(
            r.render(&UiUpdate::Draft("hello".into())),
            vec!["(not sent, draft kept) hello"]
        );
        assert!(r.render(&UiUpdate::Draft(String::new())).is_empty());
    }

    #[test]
    fn summary_line_shows_unread() {
        let summary = ConversationSummary {
            user_id: "bob".into(),
            display_name: "Bob".into(),
            role: "lawyer".into(),
            last_message: "see you".into(),
            last_message_time: None,
            unread_count: 2,
        };
        assert_eq!(summary_line(&summary), "Bob (bob, lawyer) [2 unread]: see you");
    }
}
