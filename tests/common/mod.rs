// Common test utilities for integration tests
// Scriptable fakes for the transport and the backend collaborators, plus
// helpers to build a client wired entirely to in-memory state.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Once;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::LevelFilter;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::time::timeout;

use convosync::config::SyncConfig;
use convosync::models::{
    Conversation, CurrentUser, DeliveryStatus, Message, Participant, Role,
};
use convosync::sync::connection::{ConnectionStatus, Transport, TransportSink, TransportStream};
use convosync::sync::persistence::{IdentityProvider, RecordStore};
use convosync::{MessagingClient, SyncError, UiEvent};

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// Config with timers short enough for tests to exercise timeouts and
/// backoff without real-world waits.
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.ack_timeout_ms = 200;
    config.initial_delay_ms = 10;
    config.max_delay_ms = 50;
    config.heartbeat_interval_ms = 10_000;
    config.heartbeat_timeout_ms = 60_000;
    config.typing_stop_delay_ms = 100;
    config.typing_expiry_ms = 200;
    config
}

type InboundFrame = Option<String>;

struct FakeTransportInner {
    /// Number of connect attempts left to reject.
    fail_connects: AtomicU32,
    /// When set, message/file frames are answered with a synthetic
    /// `delivery_status: delivered` event, like the real backend relay.
    auto_ack: AtomicBool,
    connect_count: AtomicU32,
    sent: TokioMutex<Vec<String>>,
    link: TokioMutex<Option<mpsc::Sender<InboundFrame>>>,
}

/// In-memory transport. One live link at a time; the test drives inbound
/// traffic with `push_event` and kills the link with `drop_link`.
pub struct FakeTransport {
    inner: Arc<FakeTransportInner>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeTransport {
            inner: Arc::new(FakeTransportInner {
                fail_connects: AtomicU32::new(0),
                auto_ack: AtomicBool::new(false),
                connect_count: AtomicU32::new(0),
                sent: TokioMutex::new(Vec::new()),
                link: TokioMutex::new(None),
            }),
        })
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.inner.auto_ack.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.inner.fail_connects.store(count, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.inner.connect_count.load(Ordering::SeqCst)
    }

    /// Frames written by the client, oldest first.
    pub async fn sent_frames(&self) -> Vec<String> {
        self.inner.sent.lock().await.clone()
    }

    /// Injects an inbound frame on the current link.
    pub async fn push_frame(&self, frame: String) {
        let guard = self.inner.link.lock().await;
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(Some(frame)).await;
        }
    }

    /// Kills the current link; the client sees a peer close.
    pub async fn drop_link(&self) {
        let mut guard = self.inner.link.lock().await;
        if let Some(tx) = guard.take() {
            let _ = tx.send(None).await;
        }
    }
}

struct FakeSink {
    inner: Arc<FakeTransportInner>,
    inbound_tx: mpsc::Sender<InboundFrame>,
}

#[async_trait]
impl TransportSink for FakeSink {
    async fn send(&mut self, frame: String) -> Result<(), SyncError> {
        self.inner.sent.lock().await.push(frame.clone());
        if self.inner.auto_ack.load(Ordering::SeqCst) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&frame) {
                let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
                if kind == "message" || kind == "file" {
                    if let Some(client_id) = value.get("clientId").and_then(|c| c.as_str()) {
                        let ack = serde_json::json!({
                            "type": "delivery_status",
                            "clientId": client_id,
                            "status": "delivered",
                            "timestamp": Utc::now().to_rfc3339(),
                        });
                        let _ = self.inbound_tx.send(Some(ack.to_string())).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

struct FakeStream {
    inbound_rx: mpsc::Receiver<InboundFrame>,
}

#[async_trait]
impl TransportStream for FakeStream {
    async fn next_frame(&mut self) -> Option<String> {
        match self.inbound_rx.recv().await {
            Some(Some(frame)) => Some(frame),
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        _user_id: &str,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), SyncError> {
        self.inner.connect_count.fetch_add(1, Ordering::SeqCst);
        let remaining = self.inner.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::Transport("connection refused".to_string()));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        *self.inner.link.lock().await = Some(inbound_tx.clone());
        Ok((
            Box::new(FakeSink {
                inner: self.inner.clone(),
                inbound_tx,
            }),
            Box::new(FakeStream { inbound_rx }),
        ))
    }
}

struct FakeRecordStoreInner {
    conversations: Vec<Conversation>,
    /// client id -> assigned server id, for idempotent persistence.
    assigned: std::collections::HashMap<String, String>,
    next_id: u32,
    read_calls: Vec<(String, DateTime<Utc>)>,
}

/// In-memory stand-in for the REST backend.
pub struct FakeRecordStore {
    fail_persist: AtomicBool,
    inner: TokioMutex<FakeRecordStoreInner>,
}

impl FakeRecordStore {
    pub fn new(conversations: Vec<Conversation>) -> Arc<Self> {
        Arc::new(FakeRecordStore {
            fail_persist: AtomicBool::new(false),
            inner: TokioMutex::new(FakeRecordStoreInner {
                conversations,
                assigned: std::collections::HashMap::new(),
                next_id: 0,
                read_calls: Vec::new(),
            }),
        })
    }

    pub fn set_fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    pub async fn persisted_count(&self) -> usize {
        self.inner.lock().await.assigned.len()
    }

    pub async fn read_calls(&self) -> Vec<(String, DateTime<Utc>)> {
        self.inner.lock().await.read_calls.clone()
    }
}

#[async_trait]
impl RecordStore for FakeRecordStore {
    async fn persist_message(&self, message: &Message) -> Result<Message> {
        if self.fail_persist.load(Ordering::SeqCst) {
            bail!("record store unavailable");
        }
        let mut inner = self.inner.lock().await;
        let server_id = match inner.assigned.get(&message.client_id) {
            Some(existing) => existing.clone(),
            None => {
                inner.next_id += 1;
                let id = format!("srv_{}", inner.next_id);
                inner
                    .assigned
                    .insert(message.client_id.clone(), id.clone());
                id
            }
        };
        let mut stored = message.clone();
        stored.id = Some(server_id);
        stored.delivery_status = DeliveryStatus::Delivered;
        stored.delivered_at = Some(Utc::now());
        stored.pending = false;
        Ok(stored)
    }

    async fn mark_messages_read_since(
        &self,
        conversation_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .read_calls
            .push((conversation_id.to_string(), timestamp));
        Ok(())
    }

    async fn list_conversations_for_user(&self, _user_id: &str) -> Result<Vec<Conversation>> {
        Ok(self.inner.lock().await.conversations.clone())
    }
}

pub struct FakeIdentity {
    user: CurrentUser,
}

impl FakeIdentity {
    pub fn new(user: CurrentUser) -> Arc<Self> {
        Arc::new(FakeIdentity { user })
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn current_user(&self) -> Result<CurrentUser> {
        Ok(self.user.clone())
    }
}

pub fn host_user() -> CurrentUser {
    CurrentUser {
        id: "user_a".to_string(),
        display_name: "Alice Host".to_string(),
        image_url: None,
        role: Role::Host,
    }
}

/// One host/tenant conversation between user_a and user_b, empty.
pub fn conversation_fixture() -> Conversation {
    Conversation {
        id: "conv_1".to_string(),
        participants: vec![
            Participant {
                user_id: "user_a".to_string(),
                role: Role::Host,
            },
            Participant {
                user_id: "user_b".to_string(),
                role: Role::Tenant,
            },
        ],
        messages: Vec::new(),
        is_unread: false,
    }
}

/// JSON frame for an inbound message from user_b in conv_1.
pub fn inbound_message_frame(client_id: &str, server_id: &str, content: &str) -> String {
    serde_json::json!({
        "type": "message",
        "id": server_id,
        "clientId": client_id,
        "conversationId": "conv_1",
        "senderId": "user_b",
        "receiverId": "user_a",
        "content": content,
        "timestamp": Utc::now().to_rfc3339(),
    })
    .to_string()
}

pub fn typing_frame(is_typing: bool) -> String {
    serde_json::json!({
        "type": "typing",
        "conversationId": "conv_1",
        "senderId": "user_b",
        "receiverId": "user_a",
        "isTyping": is_typing,
        "timestamp": Utc::now().to_rfc3339(),
    })
    .to_string()
}

/// Builds a client over the given fakes and waits for the live connection.
pub async fn connected_client(
    transport: Arc<FakeTransport>,
    records: Arc<FakeRecordStore>,
) -> (MessagingClient, mpsc::Receiver<UiEvent>) {
    let (client, ui_rx) = MessagingClient::new(
        test_config(),
        transport,
        records,
        FakeIdentity::new(host_user()),
    )
    .await
    .expect("client construction");
    wait_for_status(&client, ConnectionStatus::Connected).await;
    (client, ui_rx)
}

/// Polls until the client reports `status` or panics after two seconds.
pub async fn wait_for_status(client: &MessagingClient, status: ConnectionStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while client.connection_status() != status {
        if tokio::time::Instant::now() > deadline {
            panic!(
                "Connection never reached {:?}, still {:?}",
                status,
                client.connection_status()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Polls until the message reaches `status` or panics after two seconds.
pub async fn wait_for_message_status(
    client: &MessagingClient,
    client_id: &str,
    status: DeliveryStatus,
) -> Message {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(message) = client.message(client_id).await {
            if message.delivery_status == status {
                return message;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("Message {} never reached {:?}", client_id, status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receives UI events until one satisfies `pred`, or panics after the
/// timeout. Events that do not match are discarded.
pub async fn expect_ui_event<F>(
    ui_rx: &mut mpsc::Receiver<UiEvent>,
    mut pred: F,
    label: &str,
) -> UiEvent
where
    F: FnMut(&UiEvent) -> bool,
{
    let wait = timeout(Duration::from_secs(2), async {
        loop {
            match ui_rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("UI channel closed waiting for {}", label),
            }
        }
    });
    match wait.await {
        Ok(event) => event,
        Err(_) => panic!("Timed out waiting for {}", label),
    }
}
