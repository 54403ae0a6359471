// Seams between the reconciler and the outside world.
//
// `Transport` is the live socket; `ChatApi` is the request/response API. Both
// are object-safe so the reconciler holds them as `Arc<dyn ...>` and tests
// substitute recording doubles.

use async_trait::async_trait;

use crate::error::{ApiError, TransportError};
use crate::message::{ConversationHistory, MessageId};

#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Send a chat message. `Ok(false)` means the transport declined it
    /// (for example because it is offline).
    async fn send(&self, recipient_id: &str, content: &str) -> Result<bool, TransportError>;

    async fn mark_read(&self, message_id: &MessageId) -> Result<(), TransportError>;

    async fn emit_typing(&self, recipient_id: &str) -> Result<(), TransportError>;

    async fn emit_stop_typing(&self, recipient_id: &str) -> Result<(), TransportError>;

    async fn broadcast_edit(
        &self,
        recipient_id: &str,
        message_id: &MessageId,
        content: &str,
    ) -> Result<(), TransportError>;

    async fn broadcast_delete(
        &self,
        recipient_id: &str,
        message_id: &MessageId,
    ) -> Result<(), TransportError>;

    async fn broadcast_clear(&self, recipient_id: &str) -> Result<(), TransportError>;
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// One page of the conversation with `remote_user_id`, oldest first.
    async fn fetch_history(&self, remote_user_id: &str) -> Result<ConversationHistory, ApiError>;

    async fn edit_message(&self, message_id: &MessageId, content: &str) -> Result<(), ApiError>;

    async fn delete_message(&self, message_id: &MessageId) -> Result<(), ApiError>;

    async fn clear_conversation(&self, remote_user_id: &str) -> Result<(), ApiError>;
}
