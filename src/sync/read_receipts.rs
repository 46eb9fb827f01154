// Read-receipt coordination: batched outgoing receipts when a conversation
// gains focus, and application of inbound receipts to our own messages.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::sync::Arc;

use crate::models::CurrentUser;
use crate::sync::connection::ConnectionManager;
use crate::sync::events::{ReadReceiptPayload, WireEvent};
use crate::sync::persistence::RecordStore;
use crate::sync::store::ConversationStateStore;

pub struct ReadReceiptCoordinator {
    connection: Arc<ConnectionManager>,
    records: Arc<dyn RecordStore>,
    store: Arc<ConversationStateStore>,
}

impl ReadReceiptCoordinator {
    pub fn new(
        connection: Arc<ConnectionManager>,
        records: Arc<dyn RecordStore>,
        store: Arc<ConversationStateStore>,
    ) -> Self {
        ReadReceiptCoordinator {
            connection,
            records,
            store,
        }
    }

    /// Marks everything in `conversation_id` up to `timestamp` as read,
    /// announces it to the other participant in one batched receipt, and
    /// persists the read cutoff. Local state is authoritative; the send and
    /// the persistence call are best-effort and their failures are logged
    /// and swallowed.
    pub async fn mark_read_up_to(
        &self,
        conversation_id: &str,
        timestamp: DateTime<Utc>,
        current_user: &CurrentUser,
    ) {
        let Some((message_ids, receiver_id)) = self
            .store
            .mark_read_up_to(conversation_id, timestamp, &current_user.id)
            .await
        else {
            debug!("No unread messages in {} to mark", conversation_id);
            return;
        };

        let receipt = WireEvent::ReadReceipt(ReadReceiptPayload {
            conversation_id: conversation_id.to_string(),
            sender_id: current_user.id.clone(),
            receiver_id,
            message_ids,
            timestamp,
        });
        if let Err(err) = self.connection.send(&receipt).await {
            debug!(
                "Read receipt for {} not sent ({}), sender will learn on refetch",
                conversation_id, err
            );
        }

        if let Err(err) = self
            .records
            .mark_messages_read_since(conversation_id, timestamp)
            .await
        {
            warn!(
                "Failed to persist read cutoff for {}: {}",
                conversation_id, err
            );
        }
    }

    /// Sends a single-message receipt produced by active-window promotion.
    pub async fn announce(&self, receipt: ReadReceiptPayload) {
        let conversation_id = receipt.conversation_id.clone();
        let timestamp = receipt.timestamp;
        if let Err(err) = self.connection.send(&WireEvent::ReadReceipt(receipt)).await {
            debug!("Read receipt for {} not sent ({})", conversation_id, err);
        }
        if let Err(err) = self
            .records
            .mark_messages_read_since(&conversation_id, timestamp)
            .await
        {
            warn!(
                "Failed to persist read cutoff for {}: {}",
                conversation_id, err
            );
        }
    }

    /// Inbound receipt: the other participant read our messages.
    pub async fn apply_remote(&self, receipt: &ReadReceiptPayload) {
        self.store.apply_read_receipt(receipt).await;
    }
}
