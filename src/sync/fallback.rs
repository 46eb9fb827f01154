// Durable fallback delivery path, used when the live connection is down or
// an acknowledgment timed out.

use log::{info, warn};
use std::sync::Arc;

use crate::models::Message;
use crate::sync::persistence::RecordStore;
use crate::sync::SyncError;

/// One-shot durable delivery through the record store. Idempotency is keyed
/// off the message's `client_id`: the live path may have actually delivered
/// the message even though its acknowledgment was lost, so both the durable
/// call and any later live echo resolve to the same message.
pub struct FallbackSender {
    records: Arc<dyn RecordStore>,
}

impl FallbackSender {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        FallbackSender { records }
    }

    /// Performs the durable call and returns the server-confirmed
    /// representation (server id, timestamps). Does not retry; a failure
    /// here is terminal for the message and requires a user-initiated retry.
    pub async fn send_durable(&self, message: &Message) -> Result<Message, SyncError> {
        info!(
            "Durable fallback delivery for message {}",
            message.client_id
        );
        match self.records.persist_message(message).await {
            Ok(stored) => Ok(stored),
            Err(err) => {
                warn!(
                    "Durable delivery failed for message {}: {}",
                    message.client_id, err
                );
                Err(SyncError::DurableSendFailed(err.to_string()))
            }
        }
    }
}
