// Delivery tracking: one pending acknowledgment per in-flight client id,
// resolved by server confirmations, rejected on timeout.

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as TokioMutex};

use crate::models::DeliveryStatus;
use crate::sync::connection::ConnectionManager;
use crate::sync::events::MessagePayload;
use crate::sync::SyncError;

/// Terminal outcome of a tracked send, as reported by the server.
#[derive(Debug, Clone)]
pub struct AckResult {
    pub status: DeliveryStatus,
    /// Server-assigned id, when the confirming event carried one.
    pub server_id: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

struct PendingAck {
    resolve: oneshot::Sender<AckResult>,
}

/// Gives every outgoing message an at-least-attempted delivery guarantee
/// with bounded latency. Does not retry; on timeout the caller falls back
/// to the durable path.
pub struct DeliveryTracker {
    connection: Arc<ConnectionManager>,
    pending: TokioMutex<HashMap<String, PendingAck>>,
}

impl DeliveryTracker {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        DeliveryTracker {
            connection,
            pending: TokioMutex::new(HashMap::new()),
        }
    }

    /// Sends `payload` on the live connection and waits for a terminal
    /// confirmation matching its `client_id`.
    ///
    /// Errors with `NotConnected`/`CircuitOpen` when the connection is down
    /// at call time, and `AckTimeout` when no confirmation arrives within
    /// `timeout`. At most one pending acknowledgment may exist per client
    /// id; re-sending an unresolved id is refused.
    pub async fn send_with_ack(
        &self,
        payload: MessagePayload,
        timeout: Duration,
    ) -> Result<AckResult, SyncError> {
        let client_id = payload.client_id.clone();

        let ack_rx = {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&client_id) {
                return Err(SyncError::DuplicateClientId(client_id));
            }
            let (resolve, ack_rx) = oneshot::channel();
            pending.insert(client_id.clone(), PendingAck { resolve });
            ack_rx
        };

        let event = payload.into_event();
        if let Err(err) = self.connection.send(&event).await {
            self.pending.lock().await.remove(&client_id);
            return Err(err);
        }
        debug!("Message {} handed to transport, awaiting ack", client_id);

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(ack)) => {
                info!(
                    "Message {} acknowledged with status {:?}",
                    client_id, ack.status
                );
                Ok(ack)
            }
            Ok(Err(_)) => {
                // Resolver side dropped without sending; only happens on
                // teardown, treat it like a lost connection.
                self.pending.lock().await.remove(&client_id);
                Err(SyncError::NotConnected)
            }
            Err(_) => {
                self.pending.lock().await.remove(&client_id);
                debug!("Acknowledgment for {} timed out after {:?}", client_id, timeout);
                Err(SyncError::AckTimeout(timeout))
            }
        }
    }

    /// Resolves the pending acknowledgment for `client_id`, if one exists.
    /// Returns false when no entry is pending, which is normal for duplicate
    /// echoes and for confirmations arriving after a timeout already handed
    /// the message to the fallback path.
    pub async fn resolve_ack(&self, client_id: &str, ack: AckResult) -> bool {
        let entry = self.pending.lock().await.remove(client_id);
        match entry {
            Some(pending) => {
                let _ = pending.resolve.send(ack);
                true
            }
            None => {
                debug!(
                    "Confirmation for {} has no pending entry (late or duplicate)",
                    client_id
                );
                false
            }
        }
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
