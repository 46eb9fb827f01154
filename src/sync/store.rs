// The merged, de-duplicated, per-conversation message state that all other
// components read and mutate. Single source of truth for the UI layer.
//
// Messages are indexed by client id (and by server id once one is assigned)
// with explicit upsert semantics, so de-duplication of echoed events is a
// map lookup rather than a list scan.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex as TokioMutex};

use crate::models::{Conversation, CurrentUser, DeliveryStatus, Message, Participant, Role};
use crate::sync::delivery::AckResult;
use crate::sync::events::{
    DeliveryStatusPayload, MessagePayload, PersistenceOutcome, PersistenceStatusPayload,
    ReadReceiptPayload,
};
use crate::sync::{SyncError, UiEvent};

struct ConversationEntry {
    id: String,
    participants: Vec<Participant>,
    /// Client ids in insertion order; immutable once established.
    order: Vec<String>,
    by_client_id: HashMap<String, Message>,
    is_unread: bool,
}

impl ConversationEntry {
    fn role_of(&self, user_id: &str) -> Option<Role> {
        self.participants
            .iter()
            .find(|p| p.user_id == user_id)
            .map(|p| p.role)
    }

    fn other_participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id != user_id)
    }

    fn has_unread_from_others(&self, user_id: &str) -> bool {
        self.by_client_id
            .values()
            .any(|m| m.sender_id != user_id && !m.is_read)
    }
}

#[derive(Default)]
struct StoreInner {
    conversations: HashMap<String, ConversationEntry>,
    conversation_order: Vec<String>,
    /// client id -> owning conversation id.
    client_index: HashMap<String, String>,
    /// server id -> (conversation id, client id).
    server_index: HashMap<String, (String, String)>,
    selected: Option<String>,
    unread_host: u32,
    unread_tenant: u32,
}

pub struct ConversationStateStore {
    inner: TokioMutex<StoreInner>,
    ui_tx: mpsc::Sender<UiEvent>,
}

impl ConversationStateStore {
    pub fn new(ui_tx: mpsc::Sender<UiEvent>) -> Self {
        ConversationStateStore {
            inner: TokioMutex::new(StoreInner::default()),
            ui_tx,
        }
    }

    fn notify(&self, event: UiEvent) {
        if self.ui_tx.try_send(event).is_err() {
            debug!("UI channel full or closed, dropping update");
        }
    }

    /// Loads the initial conversation list from the record store collaborator.
    pub async fn seed(&self, conversations: Vec<Conversation>) {
        let mut inner = self.inner.lock().await;
        for conversation in conversations {
            let mut entry = ConversationEntry {
                id: conversation.id.clone(),
                participants: conversation.participants,
                order: Vec::new(),
                by_client_id: HashMap::new(),
                is_unread: conversation.is_unread,
            };
            for message in conversation.messages {
                inner
                    .client_index
                    .insert(message.client_id.clone(), conversation.id.clone());
                if let Some(id) = &message.id {
                    inner.server_index.insert(
                        id.clone(),
                        (conversation.id.clone(), message.client_id.clone()),
                    );
                }
                entry.order.push(message.client_id.clone());
                entry.by_client_id.insert(message.client_id.clone(), message);
            }
            inner.conversation_order.push(conversation.id.clone());
            inner.conversations.insert(conversation.id, entry);
        }
    }

    pub async fn selected_conversation(&self) -> Option<String> {
        self.inner.lock().await.selected.clone()
    }

    /// Focuses a conversation and resets the unread counter for the current
    /// user's role in it. Marking its messages read is the read-receipt
    /// coordinator's job, driven by the caller.
    pub async fn select_conversation(
        &self,
        conversation_id: &str,
        current_user: &CurrentUser,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        let role = inner
            .conversations
            .get(conversation_id)
            .ok_or_else(|| SyncError::UnknownConversation(conversation_id.to_string()))?
            .role_of(&current_user.id);

        inner.selected = Some(conversation_id.to_string());
        match role {
            Some(Role::Host) => inner.unread_host = 0,
            Some(Role::Tenant) => inner.unread_tenant = 0,
            None => warn!(
                "Current user {} is not a participant of {}",
                current_user.id, conversation_id
            ),
        }
        let counts = UiEvent::UnreadCountsChanged {
            host: inner.unread_host,
            tenant: inner.unread_tenant,
        };
        drop(inner);
        self.notify(counts);
        Ok(())
    }

    /// Receiver of a new outgoing message in `conversation_id`: the single
    /// other participant.
    pub async fn sending_context(
        &self,
        conversation_id: &str,
        current_user_id: &str,
    ) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .conversations
            .get(conversation_id)?
            .other_participant(current_user_id)
            .map(|p| p.user_id.clone())
    }

    /// Inserts an optimistic message at the tail of its conversation.
    pub async fn insert_optimistic(&self, message: Message) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        if inner.client_index.contains_key(&message.client_id) {
            return Err(SyncError::DuplicateClientId(message.client_id));
        }
        let conversation_id = message.conversation_id.clone();
        let entry = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| SyncError::UnknownConversation(conversation_id.clone()))?;

        entry.order.push(message.client_id.clone());
        entry
            .by_client_id
            .insert(message.client_id.clone(), message.clone());
        inner
            .client_index
            .insert(message.client_id.clone(), conversation_id.clone());

        drop(inner);
        self.notify(UiEvent::MessageUpserted {
            conversation_id,
            message,
        });
        Ok(())
    }

    /// Applies a terminal acknowledgment (live ack or server echo) to the
    /// message it confirms. Idempotent: replays and late confirmations never
    /// downgrade a status or resurrect a failed message.
    pub async fn apply_ack(&self, client_id: &str, ack: &AckResult) {
        let mut inner = self.inner.lock().await;
        let Some(conversation_id) = inner.client_index.get(client_id).cloned() else {
            debug!("Ack for unknown client id {}", client_id);
            return;
        };
        let mut index_update = None;
        let updated = {
            let Some(message) = inner
                .conversations
                .get_mut(&conversation_id)
                .and_then(|e| e.by_client_id.get_mut(client_id))
            else {
                return;
            };

            message.pending = false;
            if message.delivery_status.can_advance_to(ack.status) {
                message.delivery_status = ack.status;
            }
            if message.id.is_none() {
                if let Some(server_id) = &ack.server_id {
                    message.id = Some(server_id.clone());
                    index_update = Some(server_id.clone());
                }
            }
            if ack.delivered_at.is_some() {
                message.delivered_at = ack.delivered_at;
            }
            message.updated_at = Some(Utc::now());
            message.clone()
        };
        if let Some(server_id) = index_update {
            inner
                .server_index
                .insert(server_id, (conversation_id.clone(), client_id.to_string()));
        }
        drop(inner);
        self.notify(UiEvent::MessageUpserted {
            conversation_id,
            message: updated,
        });
    }

    /// Applies the server-confirmed representation returned by the durable
    /// fallback path.
    pub async fn apply_durable_result(&self, client_id: &str, stored: &Message) {
        self.apply_ack(
            client_id,
            &AckResult {
                status: DeliveryStatus::Delivered,
                server_id: stored.id.clone(),
                delivered_at: stored.delivered_at.or(Some(Utc::now())),
            },
        )
        .await;
    }

    /// Terminal failure: both delivery tiers exhausted. The message stays in
    /// the list so the user can see it and retry manually. A message that
    /// was meanwhile confirmed delivered (late echo) is left alone.
    pub async fn mark_failed(&self, client_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(conversation_id) = inner.client_index.get(client_id).cloned() else {
            return;
        };
        let updated = {
            let Some(message) = inner
                .conversations
                .get_mut(&conversation_id)
                .and_then(|e| e.by_client_id.get_mut(client_id))
            else {
                return;
            };
            if matches!(
                message.delivery_status,
                DeliveryStatus::Delivered | DeliveryStatus::Read
            ) {
                debug!(
                    "Not failing {}: already confirmed {:?}",
                    client_id, message.delivery_status
                );
                return;
            }
            message.delivery_status = DeliveryStatus::Failed;
            message.pending = false;
            message.updated_at = Some(Utc::now());
            message.clone()
        };
        drop(inner);
        self.notify(UiEvent::MessageUpserted {
            conversation_id,
            message: updated,
        });
    }

    /// Puts a failed message back into the sending state for a manual retry
    /// and returns it for re-delivery.
    pub async fn reset_for_retry(&self, client_id: &str) -> Result<Message, SyncError> {
        let mut inner = self.inner.lock().await;
        let conversation_id = inner
            .client_index
            .get(client_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownMessage(client_id.to_string()))?;
        let updated = {
            let message = inner
                .conversations
                .get_mut(&conversation_id)
                .and_then(|e| e.by_client_id.get_mut(client_id))
                .ok_or_else(|| SyncError::UnknownMessage(client_id.to_string()))?;
            if message.delivery_status != DeliveryStatus::Failed {
                return Err(SyncError::NotRetryable(client_id.to_string()));
            }
            message.delivery_status = DeliveryStatus::Sending;
            message.pending = true;
            message.updated_at = Some(Utc::now());
            message.clone()
        };
        drop(inner);
        self.notify(UiEvent::MessageUpserted {
            conversation_id,
            message: updated.clone(),
        });
        Ok(updated)
    }

    /// Applies an inbound `delivery_status` event directly to message state.
    /// This also covers acknowledgments whose pending entry is gone (the
    /// send already timed out and went to fallback): the status still lands
    /// unless the message reached a terminal state from that fallback.
    pub async fn apply_delivery_status(&self, payload: &DeliveryStatusPayload) {
        match payload.status {
            DeliveryStatus::Failed => self.mark_failed(&payload.client_id).await,
            status => {
                self.apply_ack(
                    &payload.client_id,
                    &AckResult {
                        status,
                        server_id: None,
                        delivered_at: Some(payload.timestamp),
                    },
                )
                .await
            }
        }
    }

    /// Applies an inbound `persistence_status` event. A `saved` confirmation
    /// is informational; a `failed` one fails the message unless the live
    /// path already confirmed delivery.
    pub async fn apply_persistence_status(&self, payload: &PersistenceStatusPayload) {
        match payload.status {
            PersistenceOutcome::Saved => {
                debug!("Message {} persisted by backend", payload.client_id);
            }
            PersistenceOutcome::Failed => {
                warn!("Backend failed to persist message {}", payload.client_id);
                self.mark_failed(&payload.client_id).await;
            }
        }
    }

    /// Merges an inbound message from another user. Returns a receipt payload
    /// when the message landed in the focused conversation and was promoted
    /// straight to read (active-window semantics).
    pub async fn receive_inbound_message(
        &self,
        payload: &MessagePayload,
        current_user: &CurrentUser,
    ) -> Option<ReadReceiptPayload> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        // De-duplication: an echo of a message we already hold updates the
        // existing entry instead of appending.
        if inner.client_index.contains_key(&payload.client_id) {
            drop(inner);
            self.apply_ack(
                &payload.client_id,
                &AckResult {
                    status: payload.delivery_status.unwrap_or(DeliveryStatus::Delivered),
                    server_id: payload.id.clone(),
                    delivered_at: payload.delivered_at.or(payload.confirmed_delivery_at),
                },
            )
            .await;
            return None;
        }
        if let Some(id) = &payload.id {
            if inner.server_index.contains_key(id) {
                debug!("Duplicate inbound message with server id {}", id);
                return None;
            }
        }

        let is_active = inner.selected.as_deref() == Some(payload.conversation_id.as_str());
        let Some(entry) = inner.conversations.get_mut(&payload.conversation_id) else {
            warn!(
                "Inbound message for unknown conversation {}",
                payload.conversation_id
            );
            return None;
        };

        let from_other_participant = entry
            .other_participant(&current_user.id)
            .map(|p| p.user_id == payload.sender_id)
            .unwrap_or(false);

        let mut message = Message {
            id: payload.id.clone(),
            client_id: payload.client_id.clone(),
            conversation_id: payload.conversation_id.clone(),
            sender_id: payload.sender_id.clone(),
            receiver_id: current_user.id.clone(),
            content: payload.content.clone(),
            attachment: payload.attachment(),
            created_at: payload.timestamp,
            updated_at: None,
            delivered_at: payload.delivered_at,
            delivery_status: DeliveryStatus::Delivered,
            is_read: false,
            pending: false,
        };

        let mut receipt = None;
        if is_active && from_other_participant {
            // The user is looking at this conversation right now: promote to
            // read immediately and answer with a single-message receipt.
            message.is_read = true;
            message.delivery_status = DeliveryStatus::Read;
            message.updated_at = Some(now);
            if let Some(id) = &message.id {
                receipt = Some(ReadReceiptPayload {
                    conversation_id: payload.conversation_id.clone(),
                    sender_id: current_user.id.clone(),
                    receiver_id: payload.sender_id.clone(),
                    message_ids: vec![id.clone()],
                    timestamp: now,
                });
            }
        }

        let unread = !message.is_read;
        let role = entry.role_of(&current_user.id);
        entry.order.push(message.client_id.clone());
        entry
            .by_client_id
            .insert(message.client_id.clone(), message.clone());
        if unread {
            entry.is_unread = true;
        }

        inner
            .client_index
            .insert(message.client_id.clone(), payload.conversation_id.clone());
        if let Some(id) = &message.id {
            inner.server_index.insert(
                id.clone(),
                (payload.conversation_id.clone(), message.client_id.clone()),
            );
        }

        let mut counts = None;
        if unread {
            match role {
                Some(Role::Host) => inner.unread_host += 1,
                Some(Role::Tenant) => inner.unread_tenant += 1,
                None => {}
            }
            counts = Some(UiEvent::UnreadCountsChanged {
                host: inner.unread_host,
                tenant: inner.unread_tenant,
            });
        }

        drop(inner);
        self.notify(UiEvent::MessageUpserted {
            conversation_id: payload.conversation_id.clone(),
            message,
        });
        if let Some(counts) = counts {
            self.notify(counts);
        }
        receipt
    }

    /// Marks every unread message from other participants up to `timestamp`
    /// as read. Returns the affected server ids and the receipt recipient,
    /// or None when there was nothing to mark.
    pub async fn mark_read_up_to(
        &self,
        conversation_id: &str,
        timestamp: DateTime<Utc>,
        current_user_id: &str,
    ) -> Option<(Vec<String>, String)> {
        let mut inner = self.inner.lock().await;
        let entry = inner.conversations.get_mut(conversation_id)?;

        let mut message_ids = Vec::new();
        for client_id in &entry.order {
            let Some(message) = entry.by_client_id.get_mut(client_id) else {
                continue;
            };
            if message.sender_id == current_user_id
                || message.is_read
                || message.created_at > timestamp
            {
                continue;
            }
            // Only server-persisted messages can be referenced in a receipt.
            let Some(id) = message.id.clone() else { continue };
            message.is_read = true;
            if message.delivery_status.can_advance_to(DeliveryStatus::Read) {
                message.delivery_status = DeliveryStatus::Read;
            }
            message.updated_at = Some(timestamp);
            message_ids.push(id);
        }

        if message_ids.is_empty() {
            return None;
        }

        entry.is_unread = entry.has_unread_from_others(current_user_id);
        let receiver_id = entry
            .other_participant(current_user_id)
            .map(|p| p.user_id.clone())?;

        drop(inner);
        self.notify(UiEvent::ConversationMarkedRead {
            conversation_id: conversation_id.to_string(),
            message_ids: message_ids.clone(),
        });
        Some((message_ids, receiver_id))
    }

    /// Applies an inbound read receipt: the other participant saw the named
    /// messages. Never moves a message backward; replaying an event against
    /// already-read messages is a no-op.
    pub async fn apply_read_receipt(&self, receipt: &ReadReceiptPayload) {
        let mut inner = self.inner.lock().await;

        let client_ids: Vec<String> = receipt
            .message_ids
            .iter()
            .filter_map(|id| {
                inner
                    .server_index
                    .get(id)
                    .filter(|(conversation, _)| conversation == &receipt.conversation_id)
                    .map(|(_, client_id)| client_id.clone())
            })
            .collect();

        let Some(entry) = inner.conversations.get_mut(&receipt.conversation_id) else {
            debug!(
                "Read receipt for unknown conversation {}",
                receipt.conversation_id
            );
            return;
        };

        let mut updated = Vec::new();
        for client_id in client_ids {
            let Some(message) = entry.by_client_id.get_mut(&client_id) else {
                continue;
            };
            if !message.delivery_status.can_advance_to(DeliveryStatus::Read) {
                continue;
            }
            message.delivery_status = DeliveryStatus::Read;
            message.is_read = true;
            message.updated_at = Some(receipt.timestamp);
            message.pending = false;
            updated.push(message.clone());
        }

        drop(inner);
        for message in updated {
            self.notify(UiEvent::MessageUpserted {
                conversation_id: receipt.conversation_id.clone(),
                message,
            });
        }
    }

    /// Snapshot of all conversations with their messages in insertion order.
    pub async fn conversations(&self) -> Vec<Conversation> {
        let inner = self.inner.lock().await;
        inner
            .conversation_order
            .iter()
            .filter_map(|id| inner.conversations.get(id))
            .map(|entry| Conversation {
                id: entry.id.clone(),
                participants: entry.participants.clone(),
                messages: entry
                    .order
                    .iter()
                    .filter_map(|cid| entry.by_client_id.get(cid).cloned())
                    .collect(),
                is_unread: entry.is_unread,
            })
            .collect()
    }

    pub async fn message(&self, client_id: &str) -> Option<Message> {
        let inner = self.inner.lock().await;
        let conversation_id = inner.client_index.get(client_id)?;
        inner
            .conversations
            .get(conversation_id)?
            .by_client_id
            .get(client_id)
            .cloned()
    }

    /// Unread counters for the role tabs: (host, tenant).
    pub async fn unread_counts(&self) -> (u32, u32) {
        let inner = self.inner.lock().await;
        (inner.unread_host, inner.unread_tenant)
    }
}
