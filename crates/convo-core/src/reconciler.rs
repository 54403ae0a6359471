// Conversation reconciler.
//
// Owns the view of one conversation between the local user and a remote
// party. The view is rebuilt from three inputs whenever any of them changes:
// the last history page, the latest live-feed snapshot, and the local patch
// overlay. All side effects (read receipts, typing signals, sends, mutations)
// go through the `Transport` and `ChatApi` seams.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{ApiError, ChatError};
use crate::live::LiveSnapshot;
use crate::merge::{merge_conversation, ConversationKey, LocalPatches};
use crate::message::{ConversationHistory, Message, MessageId, PresenceEntry, UserProfile};
use crate::pending::PendingOp;
use crate::protocol::{HistoryState, ViewSnapshot};
use crate::timer::DebounceTimer;
use crate::transport::{ChatApi, Transport};

/// Longest message body accepted for send and edit, in characters.
pub const MAX_CONTENT_LEN: usize = 5000;

/// Idle time after the last keystroke before "typing stopped" is sent.
pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Identity of one history request. Results carrying an outdated ticket are
/// discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    pub remote_user_id: String,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Nothing to send, or the transport is offline. No state changed.
    Skipped,
}

/// Whether the counterparty was told about a successful mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Broadcast,
    LocalOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Declined,
}

impl From<bool> for Confirmation {
    fn from(confirmed: bool) -> Self {
        if confirmed {
            Confirmation::Confirmed
        } else {
            Confirmation::Declined
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    Declined,
    Cleared(Propagation),
}

/// What a failed edit, delete, or clear must undo.
#[derive(Debug)]
enum MutationRollback {
    Edit {
        id: MessageId,
        previous: Option<String>,
    },
    Delete {
        id: MessageId,
    },
    Clear {
        history: Vec<Message>,
        patches: LocalPatches,
    },
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    transport: Arc<dyn Transport>,
    api: Arc<dyn ChatApi>,

    local_user_id: String,
    remote_user_id: String,
    key: ConversationKey,
    generation: u64,

    history: Vec<Message>,
    history_state: HistoryState,
    remote_profile: Option<UserProfile>,
    live: Arc<LiveSnapshot>,
    /// Local edits and deletions, keyed by globally unique message id. Kept
    /// across conversation switches: the live feed still holds the
    /// pre-mutation copies and the server never echoes them back.
    patches: LocalPatches,
    view: Vec<Message>,

    /// Ids a read receipt was emitted for. Ids are globally unique, so this
    /// survives conversation switches.
    receipts_sent: HashSet<MessageId>,

    draft: String,
    typing_announced: bool,
    typing_timer: DebounceTimer,

    send_op: PendingOp<String>,
    mutation_op: PendingOp<MutationRollback>,
}

impl Reconciler {
    /// Create a reconciler for `local_user_id`. `remote_user_id` may be empty
    /// until a conversation is opened.
    pub fn new(
        transport: Arc<dyn Transport>,
        api: Arc<dyn ChatApi>,
        local_user_id: impl Into<String>,
        remote_user_id: impl Into<String>,
        typing_idle: Duration,
    ) -> Self {
        let local_user_id = local_user_id.into();
        let remote_user_id = remote_user_id.into();
        let key = ConversationKey::new(&local_user_id, &remote_user_id);
        Self {
            transport,
            api,
            local_user_id,
            remote_user_id,
            key,
            generation: 0,
            history: Vec::new(),
            history_state: HistoryState::Idle,
            remote_profile: None,
            live: Arc::new(LiveSnapshot::default()),
            patches: LocalPatches::default(),
            view: Vec::new(),
            receipts_sent: HashSet::new(),
            draft: String::new(),
            typing_announced: false,
            typing_timer: DebounceTimer::new(typing_idle),
            send_op: PendingOp::new("send"),
            mutation_op: PendingOp::new("change"),
        }
    }

    // -- conversation and history ------------------------------------------

    /// Switch to the conversation with `remote_user_id` and start a history
    /// load for it. The caller performs the fetch and hands the result to
    /// [`apply_history`](Self::apply_history) with the returned ticket.
    pub async fn open(&mut self, remote_user_id: &str) -> Result<HistoryTicket, ChatError> {
        let key = ConversationKey::new(&self.local_user_id, remote_user_id);
        if !key.is_valid() {
            return Err(ChatError::NoConversation);
        }

        if self.typing_announced {
            self.signal_typing(false).await;
        }
        self.typing_timer.cancel();

        info!("Opening conversation with {}", remote_user_id);
        self.remote_user_id = remote_user_id.to_string();
        self.key = key;
        self.history.clear();
        self.remote_profile = None;
        self.draft.clear();

        let ticket = self.begin_history_load()?;
        self.refresh_view().await;
        Ok(ticket)
    }

    /// Mark history as loading and issue a fresh ticket. Any fetch still in
    /// flight becomes stale.
    pub fn begin_history_load(&mut self) -> Result<HistoryTicket, ChatError> {
        if !self.key.is_valid() {
            return Err(ChatError::NoConversation);
        }
        self.generation += 1;
        self.history_state = HistoryState::Loading;
        Ok(self.current_ticket())
    }

    pub fn current_ticket(&self) -> HistoryTicket {
        HistoryTicket {
            remote_user_id: self.remote_user_id.clone(),
            generation: self.generation,
        }
    }

    /// Install a fetched history page. Returns `Ok(false)` if the ticket is
    /// stale and the result was ignored.
    pub async fn apply_history(
        &mut self,
        ticket: &HistoryTicket,
        result: Result<ConversationHistory, ApiError>,
    ) -> Result<bool, ApiError> {
        if *ticket != self.current_ticket() {
            debug!(
                "Discarding stale history for {} (generation {}, current {})",
                ticket.remote_user_id, ticket.generation, self.generation
            );
            return Ok(false);
        }

        match result {
            Ok(page) => {
                let now = Utc::now();
                self.history = Message::from_wire_batch(page.messages, now);
                self.remote_profile = page.user;
                self.history_state = HistoryState::Loaded;
                info!(
                    "Loaded {} history messages with {}",
                    self.history.len(),
                    self.remote_user_id
                );
                self.refresh_view().await;
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to load history with {}: {}", self.remote_user_id, e);
                self.history_state = HistoryState::Failed;
                Err(e)
            }
        }
    }

    /// Fetch and apply history inline.
    pub async fn load_history(&mut self) -> Result<(), ChatError> {
        let ticket = self.begin_history_load()?;
        let result = self.api.fetch_history(&ticket.remote_user_id).await;
        self.apply_history(&ticket, result).await?;
        Ok(())
    }

    /// A new live-feed snapshot was published.
    pub async fn on_live_update(&mut self, live: Arc<LiveSnapshot>) {
        self.live = live;
        self.refresh_view().await;
    }

    async fn refresh_view(&mut self) {
        self.rebuild();
        self.emit_receipts().await;
    }

    fn rebuild(&mut self) {
        let merged = merge_conversation(&self.history, &self.live.messages, &self.key);
        self.view = self.patches.apply(merged);
    }

    /// Unread messages from the remote party that have not had a receipt
    /// yet. Claimed ids are recorded before emission.
    fn take_due_receipts(&mut self) -> Vec<MessageId> {
        if !self.transport.is_connected() {
            return Vec::new();
        }
        let key = &self.key;
        let sent = &mut self.receipts_sent;
        self.view
            .iter()
            .filter(|m| !m.is_read && key.is_from_remote(m))
            .filter_map(|m| sent.insert(m.id.clone()).then(|| m.id.clone()))
            .collect()
    }

    async fn emit_receipts(&mut self) {
        for id in self.take_due_receipts() {
            match self.transport.mark_read(&id).await {
                Ok(()) => debug!("Marked message {} read", id),
                Err(e) => {
                    warn!("Failed to mark message {} read: {}", id, e);
                    self.receipts_sent.remove(&id);
                }
            }
        }
    }

    // -- typing ------------------------------------------------------------

    /// The input field changed. Every change re-arms the debounce, whatever
    /// the field now holds.
    pub async fn on_input(&mut self, value: impl Into<String>) {
        self.draft = value.into();
        let has_text = !self.draft.trim().is_empty();
        if has_text != self.typing_announced {
            self.signal_typing(has_text).await;
        }
        self.typing_timer.reset();
    }

    /// Resolves when the typing debounce deadline passes. Owns its deadline,
    /// so it can sit in a `select!` alongside `&mut self` calls.
    pub fn typing_idle(&self) -> impl Future<Output = ()> + Send + 'static {
        self.typing_timer.expired()
    }

    /// Handle the debounce deadline. Sends "typing stopped" if the timer was
    /// due, whatever the draft holds. Returns whether it fired.
    pub async fn on_typing_idle(&mut self) -> bool {
        if !self.typing_timer.fire_if_due() {
            return false;
        }
        debug!("Typing idle for {:?}", self.typing_timer.delay());
        self.signal_typing(false).await;
        true
    }

    async fn signal_typing(&mut self, typing: bool) {
        if !typing {
            self.typing_announced = false;
        }
        if !self.key.is_valid() || !self.transport.is_connected() {
            return;
        }
        let result = if typing {
            self.transport.emit_typing(&self.remote_user_id).await
        } else {
            self.transport.emit_stop_typing(&self.remote_user_id).await
        };
        match result {
            Ok(()) => self.typing_announced = typing,
            Err(e) => warn!("Failed to send typing signal: {}", e),
        }
    }

    // -- send --------------------------------------------------------------

    /// Send the current draft. The draft is cleared up front and restored
    /// exactly if the transport rejects the message.
    pub async fn send(&mut self) -> Result<SendOutcome, ChatError> {
        let content = self.draft.trim().to_string();
        if content.is_empty() || !self.key.is_valid() || !self.transport.is_connected() {
            return Ok(SendOutcome::Skipped);
        }
        check_length(&content)?;

        self.send_op.begin(std::mem::take(&mut self.draft))?;
        self.typing_timer.cancel();
        if self.typing_announced {
            self.signal_typing(false).await;
        }

        match self.transport.send(&self.remote_user_id, &content).await {
            Ok(true) => {
                self.send_op.commit();
                debug!("Sent message to {}", self.remote_user_id);
                Ok(SendOutcome::Sent)
            }
            Ok(false) => {
                warn!("Transport declined message to {}", self.remote_user_id);
                self.restore_draft();
                Err(ChatError::SendRejected)
            }
            Err(e) => {
                warn!("Failed to send message to {}: {}", self.remote_user_id, e);
                self.restore_draft();
                Err(e.into())
            }
        }
    }

    fn restore_draft(&mut self) {
        if let Some(draft) = self.send_op.roll_back() {
            self.draft = draft;
        }
    }

    // -- edit / delete / clear ---------------------------------------------

    /// Replace the content of one of the local user's messages.
    pub async fn edit(
        &mut self,
        message_id: &MessageId,
        content: &str,
    ) -> Result<Propagation, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        check_length(content)?;
        let msg = self.find(message_id)?;
        if !msg.is_from(&self.local_user_id) {
            return Err(ChatError::NotAuthor(message_id.clone()));
        }
        self.ensure_idle()?;

        let previous = self.patches.edit(message_id, content);
        self.mutation_op.begin(MutationRollback::Edit {
            id: message_id.clone(),
            previous,
        })?;
        self.rebuild();

        if let Err(e) = self.api.edit_message(message_id, content).await {
            warn!("Failed to edit message {}: {}", message_id, e);
            self.undo_mutation();
            return Err(e.into());
        }
        self.mutation_op.commit();
        info!("Edited message {}", message_id);

        let broadcast = self
            .transport
            .broadcast_edit(&self.remote_user_id, message_id, content)
            .await;
        Ok(propagation("edit", broadcast))
    }

    /// Delete a message from the conversation.
    pub async fn delete(&mut self, message_id: &MessageId) -> Result<Propagation, ChatError> {
        self.find(message_id)?;
        self.ensure_idle()?;

        self.patches.delete(message_id);
        self.mutation_op.begin(MutationRollback::Delete {
            id: message_id.clone(),
        })?;
        self.rebuild();

        if let Err(e) = self.api.delete_message(message_id).await {
            warn!("Failed to delete message {}: {}", message_id, e);
            self.undo_mutation();
            return Err(e.into());
        }
        self.mutation_op.commit();
        info!("Deleted message {}", message_id);

        let broadcast = self
            .transport
            .broadcast_delete(&self.remote_user_id, message_id)
            .await;
        Ok(propagation("delete", broadcast))
    }

    /// Delete every message in the conversation. Does nothing at all unless
    /// the user confirmed.
    pub async fn clear(&mut self, confirmation: Confirmation) -> Result<ClearOutcome, ChatError> {
        if confirmation == Confirmation::Declined {
            debug!("Clear conversation declined");
            return Ok(ClearOutcome::Declined);
        }
        if !self.key.is_valid() {
            return Err(ChatError::NoConversation);
        }
        self.ensure_idle()?;

        self.mutation_op.begin(MutationRollback::Clear {
            history: self.history.clone(),
            patches: self.patches.clone(),
        })?;
        for msg in &self.view {
            self.patches.delete(&msg.id);
        }
        self.history.clear();
        self.rebuild();

        if let Err(e) = self.api.clear_conversation(&self.remote_user_id).await {
            warn!("Failed to clear conversation with {}: {}", self.remote_user_id, e);
            self.undo_mutation();
            return Err(e.into());
        }
        self.mutation_op.commit();
        info!("Cleared conversation with {}", self.remote_user_id);

        let broadcast = self.transport.broadcast_clear(&self.remote_user_id).await;
        Ok(ClearOutcome::Cleared(propagation("clear", broadcast)))
    }

    fn find(&self, message_id: &MessageId) -> Result<&Message, ChatError> {
        self.view
            .iter()
            .find(|m| &m.id == message_id)
            .ok_or_else(|| ChatError::UnknownMessage(message_id.clone()))
    }

    fn ensure_idle(&self) -> Result<(), ChatError> {
        if self.mutation_op.is_pending() {
            return Err(ChatError::Busy(self.mutation_op.label()));
        }
        Ok(())
    }

    fn undo_mutation(&mut self) {
        match self.mutation_op.roll_back() {
            Some(MutationRollback::Edit { id, previous }) => {
                self.patches.restore_edit(&id, previous);
            }
            Some(MutationRollback::Delete { id }) => self.patches.undelete(&id),
            Some(MutationRollback::Clear { history, patches }) => {
                self.history = history;
                self.patches = patches;
            }
            None => {}
        }
        self.rebuild();
    }

    // -- accessors ---------------------------------------------------------

    pub fn view(&self) -> &[Message] {
        &self.view
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn remote_user_id(&self) -> &str {
        &self.remote_user_id
    }

    pub fn has_conversation(&self) -> bool {
        self.key.is_valid()
    }

    pub fn remote_is_typing(&self) -> bool {
        self.key.is_valid() && self.live.is_typing(&self.remote_user_id)
    }

    pub fn remote_presence(&self) -> Option<&PresenceEntry> {
        if !self.key.is_valid() {
            return None;
        }
        self.live.presence(&self.remote_user_id)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn history_state(&self) -> HistoryState {
        self.history_state
    }

    pub fn remote_profile(&self) -> Option<&UserProfile> {
        self.remote_profile.as_ref()
    }

    pub fn api(&self) -> Arc<dyn ChatApi> {
        Arc::clone(&self.api)
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            local_user_id: self.local_user_id.clone(),
            remote_user_id: self.remote_user_id.clone(),
            remote_profile: self.remote_profile.clone(),
            remote_presence: self.remote_presence().cloned(),
            remote_typing: self.remote_is_typing(),
            connected: self.is_connected(),
            history: self.history_state,
            messages: self.view.clone(),
        }
    }

    /// Withdraw any typing indicator before the view goes away.
    pub async fn shutdown(&mut self) {
        self.typing_timer.cancel();
        if self.typing_announced {
            self.signal_typing(false).await;
        }
    }
}

fn check_length(content: &str) -> Result<(), ChatError> {
    if content.chars().count() > MAX_CONTENT_LEN {
        return Err(ChatError::ContentTooLong {
            max: MAX_CONTENT_LEN,
        });
    }
    Ok(())
}

fn propagation<E: std::fmt::Display>(what: &str, result: Result<(), E>) -> Propagation {
    match result {
        Ok(()) => Propagation::Broadcast,
        Err(e) => {
            warn!("Failed to broadcast {}: {}", what, e);
            Propagation::LocalOnly
        }
    }
}
