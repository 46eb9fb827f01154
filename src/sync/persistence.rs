// Collaborator seams consumed by the engine. The record store, identity
// provider and attachment upload live outside this crate; the engine only
// depends on these narrow interfaces.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Conversation, CurrentUser, Message};

/// Persisted-record CRUD collaborator. Also serves as the durable delivery
/// path: `persist_message` must be idempotent with respect to the message's
/// `client_id`, because the live path may have delivered the message even
/// though its acknowledgment was lost.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Stores a message and returns the server-confirmed representation,
    /// including the server-assigned id and timestamps.
    async fn persist_message(&self, message: &Message) -> anyhow::Result<Message>;

    /// Persists a read cutoff: everything in the conversation up to
    /// `timestamp` counts as read for the current user.
    async fn mark_messages_read_since(
        &self,
        conversation_id: &str,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn list_conversations_for_user(
        &self,
        user_id: &str,
    ) -> anyhow::Result<Vec<Conversation>>;
}

/// Identity lookup collaborator.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> anyhow::Result<CurrentUser>;
}
