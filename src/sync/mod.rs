// Real-time conversation synchronization engine.
//
// `MessagingClient` is the single entry point: it owns the connection, the
// delivery tiers, the typing and read-receipt coordinators and the shared
// conversation state, and surfaces everything the UI needs through one
// `UiEvent` channel.

pub mod connection;
pub mod delivery;
pub mod events;
pub mod fallback;
pub mod persistence;
pub mod read_receipts;
pub mod store;
pub mod typing;
pub mod ws_transport;

use anyhow::Context;
use chrono::Utc;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::models::{Attachment, Conversation, CurrentUser, DeliveryStatus, Message};
use connection::{ConnectionManager, ConnectionStatus, Transport};
use delivery::{AckResult, DeliveryTracker};
use events::WireEvent;
use fallback::FallbackSender;
use persistence::{IdentityProvider, RecordStore};
use read_receipts::ReadReceiptCoordinator;
use store::ConversationStateStore;
use typing::TypingCoordinator;

/// Errors surfaced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not connected to the messaging backend")]
    NotConnected,
    #[error("circuit breaker is open, manual retry required")]
    CircuitOpen,
    #[error("no acknowledgment within {0:?}")]
    AckTimeout(Duration),
    #[error("durable delivery failed: {0}")]
    DurableSendFailed(String),
    #[error("a send for client id {0} is already pending")]
    DuplicateClientId(String),
    #[error("unknown conversation {0}")]
    UnknownConversation(String),
    #[error("unknown message {0}")]
    UnknownMessage(String),
    #[error("message {0} is not in a retryable state")]
    NotRetryable(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// State changes pushed to the UI layer. Consumed from the receiver half
/// returned by [`MessagingClient::new`].
#[derive(Debug, Clone)]
pub enum UiEvent {
    MessageUpserted {
        conversation_id: String,
        message: Message,
    },
    TypingChanged {
        conversation_id: String,
        sender_id: String,
        is_typing: bool,
    },
    UnreadCountsChanged {
        host: u32,
        tenant: u32,
    },
    ConversationMarkedRead {
        conversation_id: String,
        message_ids: Vec<String>,
    },
    ConnectionStatusChanged(ConnectionStatus),
}

/// Client facade for the conversation sync engine.
///
/// Construction resolves the current user, seeds the conversation state from
/// the record store, opens the live connection in the background and starts
/// the event dispatcher. All methods are cancel-safe and callable from any
/// task.
pub struct MessagingClient {
    config: SyncConfig,
    user: CurrentUser,
    connection: Arc<ConnectionManager>,
    tracker: Arc<DeliveryTracker>,
    fallback: Arc<FallbackSender>,
    typing: Arc<TypingCoordinator>,
    receipts: Arc<ReadReceiptCoordinator>,
    store: Arc<ConversationStateStore>,
}

impl MessagingClient {
    pub async fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        records: Arc<dyn RecordStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> anyhow::Result<(Self, mpsc::Receiver<UiEvent>)> {
        let user = identity
            .current_user()
            .await
            .context("resolving current user")?;
        let (ui_tx, ui_rx) = mpsc::channel(256);

        let store = Arc::new(ConversationStateStore::new(ui_tx.clone()));
        let conversations = records
            .list_conversations_for_user(&user.id)
            .await
            .context("loading conversations")?;
        store.seed(conversations).await;

        let (connection, event_rx) = ConnectionManager::new(transport, config.clone());
        let connection = Arc::new(connection);
        let tracker = Arc::new(DeliveryTracker::new(connection.clone()));
        let fallback = Arc::new(FallbackSender::new(records.clone()));
        let typing = Arc::new(TypingCoordinator::new(
            connection.clone(),
            config.clone(),
            ui_tx.clone(),
        ));
        let receipts = Arc::new(ReadReceiptCoordinator::new(
            connection.clone(),
            records,
            store.clone(),
        ));

        connection.connect(&user.id).await;

        tokio::spawn(dispatch_loop(
            event_rx,
            user.clone(),
            store.clone(),
            tracker.clone(),
            typing.clone(),
            receipts.clone(),
        ));
        tokio::spawn(forward_status(connection.subscribe_status(), ui_tx));

        Ok((
            MessagingClient {
                config,
                user,
                connection,
                tracker,
                fallback,
                typing,
                receipts,
                store,
            },
            ui_rx,
        ))
    }

    pub fn current_user(&self) -> &CurrentUser {
        &self.user
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Resets the circuit breaker and reconnects. The only way back onto the
    /// live path once the breaker has opened.
    pub async fn retry_connection(&self) {
        self.connection.retry_connection().await;
    }

    /// Sends a new message in `conversation_id`, optimistically inserted
    /// before any network activity. Returns the message's client id once the
    /// insert landed; delivery runs on a detached task and its outcome
    /// arrives as `MessageUpserted` events.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        attachment: Option<Attachment>,
    ) -> Result<String, SyncError> {
        let receiver_id = self
            .store
            .sending_context(conversation_id, &self.user.id)
            .await
            .ok_or_else(|| SyncError::UnknownConversation(conversation_id.to_string()))?;

        let message = Message {
            id: None,
            client_id: format!("msg_{}", Uuid::new_v4()),
            conversation_id: conversation_id.to_string(),
            sender_id: self.user.id.clone(),
            receiver_id,
            content: content.to_string(),
            attachment,
            created_at: Utc::now(),
            updated_at: None,
            delivered_at: None,
            delivery_status: DeliveryStatus::Sending,
            is_read: false,
            pending: true,
        };
        let client_id = message.client_id.clone();

        self.store.insert_optimistic(message.clone()).await?;
        self.spawn_delivery(message);
        Ok(client_id)
    }

    /// Puts a failed message back on the delivery pipeline. Only messages in
    /// the failed state are retryable.
    pub async fn retry_failed_message(&self, client_id: &str) -> Result<(), SyncError> {
        let message = self.store.reset_for_retry(client_id).await?;
        self.spawn_delivery(message);
        Ok(())
    }

    /// Runs the delivery pipeline on a detached task owned by the engine, so
    /// an in-flight send always reaches a terminal status in the store even
    /// when no caller is left observing it.
    fn spawn_delivery(&self, message: Message) {
        let tracker = self.tracker.clone();
        let fallback = self.fallback.clone();
        let store = self.store.clone();
        let ack_timeout = self.config.ack_timeout();
        let client_id = message.client_id.clone();
        tokio::spawn(async move {
            if let Err(err) = deliver(tracker, fallback, store, ack_timeout, message).await {
                warn!("Delivery of {} failed terminally: {}", client_id, err);
            }
        });
    }

    /// Focuses a conversation: resets its unread counter and marks (and
    /// announces) everything received so far as read.
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.store
            .select_conversation(conversation_id, &self.user)
            .await?;
        self.receipts
            .mark_read_up_to(conversation_id, Utc::now(), &self.user)
            .await;
        Ok(())
    }

    /// Local typing signal for the composer of `conversation_id`.
    pub async fn set_typing(&self, conversation_id: &str, is_typing: bool) {
        let Some(receiver_id) = self
            .store
            .sending_context(conversation_id, &self.user.id)
            .await
        else {
            warn!("Typing signal for unknown conversation {}", conversation_id);
            return;
        };
        self.typing
            .notify_local(conversation_id, &self.user.id, &receiver_id, is_typing)
            .await;
    }

    /// Whether `sender_id` is currently typing in `conversation_id`.
    pub async fn is_typing(&self, conversation_id: &str, sender_id: &str) -> bool {
        self.typing.is_typing(conversation_id, sender_id).await
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.store.conversations().await
    }

    pub async fn message(&self, client_id: &str) -> Option<Message> {
        self.store.message(client_id).await
    }

    /// Unread counters for the role tabs: (host, tenant).
    pub async fn unread_counts(&self) -> (u32, u32) {
        self.store.unread_counts().await
    }
}

/// Two-tier delivery: live send awaiting acknowledgment, then the durable
/// fallback when the live path is down or silent. Failure of both tiers
/// marks the message failed; nothing retries silently.
async fn deliver(
    tracker: Arc<DeliveryTracker>,
    fallback: Arc<FallbackSender>,
    store: Arc<ConversationStateStore>,
    ack_timeout: Duration,
    message: Message,
) -> Result<(), SyncError> {
    let payload = events::MessagePayload::from_message(&message);
    match tracker.send_with_ack(payload, ack_timeout).await {
        Ok(ack) if ack.status != DeliveryStatus::Failed => {
            store.apply_ack(&message.client_id, &ack).await;
            Ok(())
        }
        Ok(_)
        | Err(SyncError::NotConnected)
        | Err(SyncError::AckTimeout(_))
        | Err(SyncError::CircuitOpen) => match fallback.send_durable(&message).await {
            Ok(stored) => {
                store.apply_durable_result(&message.client_id, &stored).await;
                Ok(())
            }
            Err(err) => {
                store.mark_failed(&message.client_id).await;
                Err(err)
            }
        },
        Err(err) => {
            store.mark_failed(&message.client_id).await;
            Err(err)
        }
    }
}

/// Routes each inbound event to exactly one coordinator. Runs until the
/// connection manager drops the event channel.
async fn dispatch_loop(
    mut event_rx: mpsc::Receiver<WireEvent>,
    user: CurrentUser,
    store: Arc<ConversationStateStore>,
    tracker: Arc<DeliveryTracker>,
    typing: Arc<TypingCoordinator>,
    receipts: Arc<ReadReceiptCoordinator>,
) {
    while let Some(event) = event_rx.recv().await {
        match event {
            WireEvent::Message(payload) | WireEvent::File(payload) => {
                if payload.sender_id == user.id {
                    // Server echo of our own message doubles as an ack.
                    let status = match payload.delivery_status {
                        Some(status) if status != DeliveryStatus::Sending => status,
                        _ => DeliveryStatus::Delivered,
                    };
                    let ack = AckResult {
                        status,
                        server_id: payload.id.clone(),
                        delivered_at: payload.delivered_at.or(payload.confirmed_delivery_at),
                    };
                    tracker.resolve_ack(&payload.client_id, ack.clone()).await;
                    store.apply_ack(&payload.client_id, &ack).await;
                } else if let Some(receipt) = store.receive_inbound_message(&payload, &user).await
                {
                    receipts.announce(receipt).await;
                }
            }
            WireEvent::Typing(payload) => typing.apply_remote(payload, &user.id).await,
            WireEvent::ReadReceipt(payload) => receipts.apply_remote(&payload).await,
            WireEvent::DeliveryStatus(payload) => {
                let resolved = tracker
                    .resolve_ack(
                        &payload.client_id,
                        AckResult {
                            status: payload.status,
                            server_id: None,
                            delivered_at: Some(payload.timestamp),
                        },
                    )
                    .await;
                // A failure consumed by a pending send is handled there (the
                // sender falls back); applying it here too would pin the
                // message failed before the fallback finishes.
                if !(resolved && payload.status == DeliveryStatus::Failed) {
                    store.apply_delivery_status(&payload).await;
                }
            }
            WireEvent::PersistenceStatus(payload) => store.apply_persistence_status(&payload).await,
            WireEvent::Ping(payload) => {
                debug!("Heartbeat echo, server time {:?}", payload.server_time);
            }
        }
    }
    debug!("Event channel closed, dispatcher exiting");
}

/// Mirrors connection status changes onto the UI channel.
async fn forward_status(
    mut status_rx: tokio::sync::watch::Receiver<ConnectionStatus>,
    ui_tx: mpsc::Sender<UiEvent>,
) {
    loop {
        let status = *status_rx.borrow_and_update();
        if ui_tx
            .send(UiEvent::ConnectionStatusChanged(status))
            .await
            .is_err()
        {
            break;
        }
        if status_rx.changed().await.is_err() {
            break;
        }
    }
}
