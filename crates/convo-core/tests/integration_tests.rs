// Integration tests for the conversation client.
//
// These exercise the public API end-to-end: socket frames are pumped into a
// live feed, history comes from a SQLite store, and the reconciler merges
// both into one view while mutations round-trip through the store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures_util::stream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use convo_core::app;
use convo_core::db::{Database, StoreChatApi, StoreTransport, StoredUser};
use convo_core::error::TransportError;
use convo_core::live::LiveFeed;
use convo_core::message::MessageId;
use convo_core::protocol::{HistoryState, UiUpdate, UserCommand};
use convo_core::reconciler::{ClearOutcome, Confirmation, Propagation, Reconciler};
use convo_core::transport::Transport;
use convo_core::ws_client::process_message_stream;

// ===========================================================================
// Test helpers
// ===========================================================================

#[derive(Default)]
struct RecordingTransport {
    calls: Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn is_connected(&self) -> bool {
        true
    }

    async fn send(&self, recipient_id: &str, content: &str) -> Result<bool, TransportError> {
        self.record(format!("send {recipient_id} {content}"));
        Ok(true)
    }

    async fn mark_read(&self, message_id: &MessageId) -> Result<(), TransportError> {
        self.record(format!("read {message_id}"));
        Ok(())
    }

    async fn emit_typing(&self, recipient_id: &str) -> Result<(), TransportError> {
        self.record(format!("typing {recipient_id}"));
        Ok(())
    }

    async fn emit_stop_typing(&self, recipient_id: &str) -> Result<(), TransportError> {
        self.record(format!("stop {recipient_id}"));
        Ok(())
    }

    async fn broadcast_edit(
        &self,
        recipient_id: &str,
        message_id: &MessageId,
        content: &str,
    ) -> Result<(), TransportError> {
        self.record(format!("edit {recipient_id} {message_id} {content}"));
        Ok(())
    }

    async fn broadcast_delete(
        &self,
        recipient_id: &str,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        self.record(format!("delete {recipient_id} {message_id}"));
        Ok(())
    }

    async fn broadcast_clear(&self, recipient_id: &str) -> Result<(), TransportError> {
        self.record(format!("clear {recipient_id}"));
        Ok(())
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + ChronoDuration::seconds(secs)
}

fn store() -> Arc<Database> {
    let db = Database::open(":memory:").expect("in-memory database should open");
    for (id, first, role) in [
        ("alice", "Alice", "client"),
        ("bob", "Bob", "lawyer"),
        ("carol", "Carol", "client"),
    ] {
        db.upsert_user(&StoredUser {
            id: id.into(),
            email: format!("{id}@example.com"),
            first_name: Some(first.into()),
            last_name: None,
            role: role.into(),
        })
        .unwrap();
    }
    Arc::new(db)
}

fn reconciler_for(db: &Arc<Database>, transport: &Arc<RecordingTransport>) -> Reconciler {
    Reconciler::new(
        transport.clone(),
        Arc::new(StoreChatApi::new(Arc::clone(db), "alice", 50)),
        "alice",
        "bob",
        Duration::from_secs(3),
    )
}

fn new_message_frame(id: &str, from: &str, to: &str, content: &str, ts: &str) -> String {
    format!(
        r#"{{"event":"new_message","data":{{"id":"{id}","senderId":"{from}","recipientId":"{to}","content":"{content}","timestamp":"{ts}"}}}}"#
    )
}

async fn pump(feed: &LiveFeed, frames: Vec<String>) -> usize {
    let items: Vec<Result<WsMessage, WsError>> = frames
        .into_iter()
        .map(|f| Ok(WsMessage::Text(f.into())))
        .collect();
    process_message_stream(stream::iter(items), feed).await
}

// ===========================================================================
// Reconciler over store + live feed
// ===========================================================================

#[tokio::test]
async fn history_and_live_frames_merge_into_one_ordered_view() {
    let db = store();
    let first = db.insert_message_at("bob", "alice", "draft text", at(0)).unwrap();
    db.insert_message_at("alice", "bob", "reply", at(60)).unwrap();
    db.insert_message_at("carol", "alice", "unrelated", at(30)).unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let feed = LiveFeed::new("alice");
    let mut reconciler = reconciler_for(&db, &transport);
    reconciler.load_history().await.unwrap();
    assert_eq!(reconciler.history_state(), HistoryState::Loaded);
    assert_eq!(reconciler.remote_profile().unwrap().display_name(), "Bob");

    let applied = pump(
        &feed,
        vec![
            // Same id as the first stored message: live content wins.
            new_message_frame(&first.id, "bob", "alice", "final text", "2026-03-01T09:00:00Z"),
            new_message_frame("live-2", "bob", "alice", "latest", "2026-03-01T09:02:00Z"),
            new_message_frame("live-3", "carol", "alice", "not here", "2026-03-01T09:03:00Z"),
        ],
    )
    .await;
    assert_eq!(applied, 3);
    reconciler.on_live_update(feed.snapshot()).await;

    let contents: Vec<&str> = reconciler.view().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["final text", "reply", "latest"]);

    // The history page predates its own read marking, so bob's stored
    // message gets a receipt on load; the live one follows. No id twice.
    assert_eq!(
        transport.calls(),
        vec![format!("read {}", first.id), "read live-2".to_string()]
    );
}

#[tokio::test]
async fn edit_persists_and_survives_refetch() {
    let db = store();
    let mine = db.insert_message_at("alice", "bob", "helo", at(0)).unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let mut reconciler = reconciler_for(&db, &transport);
    reconciler.load_history().await.unwrap();

    let id = MessageId::new(mine.id.clone());
    let outcome = reconciler.edit(&id, " hello ").await.unwrap();
    assert_eq!(outcome, Propagation::Broadcast);
    assert_eq!(reconciler.view()[0].content, "hello");
    assert_eq!(db.get_message(&mine.id).unwrap().unwrap().content, "hello");

    reconciler.load_history().await.unwrap();
    assert_eq!(reconciler.view()[0].content, "hello");
    assert!(transport
        .calls()
        .contains(&format!("edit bob {} hello", mine.id)));
}

#[tokio::test]
async fn editing_someone_elses_message_is_refused_locally() {
    let db = store();
    let theirs = db.insert_message_at("bob", "alice", "hi", at(0)).unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let mut reconciler = reconciler_for(&db, &transport);
    reconciler.load_history().await.unwrap();

    let err = reconciler
        .edit(&MessageId::new(theirs.id.clone()), "changed")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("only the sender"));
    assert_eq!(db.get_message(&theirs.id).unwrap().unwrap().content, "hi");
}

#[tokio::test]
async fn clear_wipes_store_and_view_but_not_other_conversations() {
    let db = store();
    db.insert_message_at("alice", "bob", "one", at(0)).unwrap();
    db.insert_message_at("bob", "alice", "two", at(1)).unwrap();
    db.insert_message_at("alice", "carol", "three", at(2)).unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let mut reconciler = reconciler_for(&db, &transport);
    reconciler.load_history().await.unwrap();
    assert_eq!(reconciler.view().len(), 2);

    assert_eq!(
        reconciler.clear(Confirmation::Declined).await.unwrap(),
        ClearOutcome::Declined
    );
    assert_eq!(reconciler.view().len(), 2);

    assert_eq!(
        reconciler.clear(Confirmation::Confirmed).await.unwrap(),
        ClearOutcome::Cleared(Propagation::Broadcast)
    );
    assert!(reconciler.view().is_empty());
    assert!(db.conversation("alice", "bob", 50, 0).unwrap().1.is_empty());
    assert_eq!(db.conversation("alice", "carol", 50, 0).unwrap().1.len(), 1);
    assert!(transport.calls().contains(&"clear bob".to_string()));
}

#[tokio::test]
async fn remote_clear_frame_empties_live_half() {
    let db = store();
    let transport = Arc::new(RecordingTransport::default());
    let feed = LiveFeed::new("alice");
    let mut reconciler = reconciler_for(&db, &transport);
    reconciler.load_history().await.unwrap();

    pump(
        &feed,
        vec![
            new_message_frame("m1", "bob", "alice", "hi", "2026-03-01T09:00:00Z"),
            r#"{"event":"conversation_cleared","data":{"userId":"bob"}}"#.to_string(),
        ],
    )
    .await;
    reconciler.on_live_update(feed.snapshot()).await;
    assert!(reconciler.view().is_empty());
}

#[tokio::test]
async fn conversation_summaries_reflect_store_state() {
    let db = store();
    db.insert_message_at("bob", "alice", "question about my visa", at(0))
        .unwrap();
    db.insert_message_at("carol", "alice", "hello", at(10)).unwrap();

    let list = db.conversations("alice", 50).unwrap();
    let ids: Vec<&str> = list.iter().map(|s| s.user_id.as_str()).collect();
    assert_eq!(ids, vec!["carol", "bob"]);
    assert_eq!(list[1].role, "lawyer");
    assert_eq!(db.unread_count("alice").unwrap(), 2);

    let transport = Arc::new(RecordingTransport::default());
    let mut reconciler = reconciler_for(&db, &transport);
    reconciler.load_history().await.unwrap();
    assert_eq!(db.unread_count("alice").unwrap(), 1);
}

// ===========================================================================
// Local session over the store
// ===========================================================================

#[tokio::test]
async fn local_session_sends_edits_and_deletes_through_the_store() {
    let db = store();
    let feed = Arc::new(LiveFeed::new("alice"));
    let transport = Arc::new(StoreTransport::new(Arc::clone(&db), Arc::clone(&feed), "alice"));
    let mut reconciler = Reconciler::new(
        transport,
        Arc::new(StoreChatApi::new(Arc::clone(&db), "alice", 50)),
        "alice",
        "bob",
        Duration::from_secs(3),
    );
    reconciler.load_history().await.unwrap();

    reconciler.on_input("first").await;
    reconciler.send().await.unwrap();
    reconciler.on_input("secnod").await;
    reconciler.send().await.unwrap();
    reconciler.on_live_update(feed.snapshot()).await;
    let ids: Vec<MessageId> = reconciler.view().iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids.len(), 2);

    reconciler.edit(&ids[1], "second").await.unwrap();
    reconciler.delete(&ids[0]).await.unwrap();
    reconciler.on_live_update(feed.snapshot()).await;

    // Away and back: the store and the feed agree with what the user did.
    reconciler.open("carol").await.unwrap();
    reconciler.open("bob").await.unwrap();
    reconciler.load_history().await.unwrap();
    let contents: Vec<&str> = reconciler.view().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["second"]);

    let (_, stored) = db.conversation("bob", "alice", 50, 0).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "second");
}

#[tokio::test]
async fn local_send_to_unknown_user_restores_draft_and_records_error() {
    let db = store();
    let feed = Arc::new(LiveFeed::new("alice"));
    let transport = Arc::new(StoreTransport::new(Arc::clone(&db), Arc::clone(&feed), "alice"));
    let mut reconciler = Reconciler::new(
        transport,
        Arc::new(StoreChatApi::new(Arc::clone(&db), "alice", 50)),
        "alice",
        "dave",
        Duration::from_secs(3),
    );

    reconciler.on_input("anyone there?").await;
    assert!(reconciler.send().await.is_err());
    assert_eq!(reconciler.draft(), "anyone there?");
    assert_eq!(feed.snapshot().error_since(0), Some("Recipient not found"));
}

// ===========================================================================
// Event loop end-to-end
// ===========================================================================

#[tokio::test]
async fn event_loop_serves_store_history_and_live_updates() {
    let db = store();
    db.insert_message_at("bob", "alice", "stored", at(0)).unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let feed = Arc::new(LiveFeed::new("alice"));
    feed.set_connected(true);
    let reconciler = reconciler_for(&db, &transport);

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (ui_tx, mut ui_rx) = mpsc::channel(64);
    let handle = tokio::spawn(app::run(reconciler, feed.subscribe(), cmd_rx, ui_tx));

    let mut saw_history = false;
    let mut saw_live = false;
    let mut live_sent = false;
    while !(saw_history && saw_live) {
        let update = tokio::time::timeout(Duration::from_secs(5), ui_rx.recv())
            .await
            .expect("Should receive UI update within timeout")
            .expect("Channel should not be closed");
        let UiUpdate::View(view) = update else {
            continue;
        };
        if view.history == HistoryState::Loaded && view.messages.len() == 1 {
            saw_history = true;
            if !live_sent {
                live_sent = true;
                pump(
                    &feed,
                    vec![new_message_frame(
                        "live-1",
                        "bob",
                        "alice",
                        "fresh",
                        "2026-03-01T10:00:00Z",
                    )],
                )
                .await;
            }
        }
        if view.messages.iter().any(|m| m.content == "fresh") {
            assert_eq!(view.messages.last().unwrap().content, "fresh");
            saw_live = true;
        }
    }

    cmd_tx.send(UserCommand::Quit).await.unwrap();
    handle.await.unwrap().unwrap();
    assert!(transport.calls().contains(&"read live-1".to_string()));
}
