// Typing-presence coordination, both directions. Purely in-memory and
// best-effort: outgoing signals carry no delivery guarantee, and remote
// state expires on a local timer so a lost stop event cannot wedge the
// indicator.

use chrono::Utc;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::models::TypingState;
use crate::sync::connection::ConnectionManager;
use crate::sync::events::{TypingPayload, WireEvent};
use crate::sync::UiEvent;

struct RemoteTyping {
    state: TypingState,
    expiry: Option<JoinHandle<()>>,
}

struct LocalTyping {
    active: bool,
    stop_timer: Option<JoinHandle<()>>,
}

pub struct TypingCoordinator {
    connection: Arc<ConnectionManager>,
    config: SyncConfig,
    remote: Arc<TokioMutex<HashMap<(String, String), RemoteTyping>>>,
    local: Arc<TokioMutex<HashMap<String, LocalTyping>>>,
    ui_tx: mpsc::Sender<UiEvent>,
}

/// Fire-and-forget send of a typing signal; failures are swallowed.
async fn send_typing_event(
    connection: &ConnectionManager,
    conversation_id: &str,
    sender_id: &str,
    receiver_id: &str,
    is_typing: bool,
) {
    let event = WireEvent::Typing(TypingPayload {
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        receiver_id: receiver_id.to_string(),
        is_typing,
        timestamp: Utc::now(),
    });
    if let Err(err) = connection.send(&event).await {
        debug!("Typing signal not sent ({}), dropping", err);
    }
}

impl TypingCoordinator {
    pub fn new(
        connection: Arc<ConnectionManager>,
        config: SyncConfig,
        ui_tx: mpsc::Sender<UiEvent>,
    ) -> Self {
        TypingCoordinator {
            connection,
            config,
            remote: Arc::new(TokioMutex::new(HashMap::new())),
            local: Arc::new(TokioMutex::new(HashMap::new())),
            ui_tx,
        }
    }

    /// Local keystroke signal. Throttled: `true` goes out once at signal
    /// start, then a trailing timer emits the stop automatically after
    /// silence. An explicit `false` stops immediately.
    pub async fn notify_local(
        &self,
        conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
        is_typing: bool,
    ) {
        let mut local = self.local.lock().await;
        let entry = local
            .entry(conversation_id.to_string())
            .or_insert(LocalTyping {
                active: false,
                stop_timer: None,
            });

        if let Some(timer) = entry.stop_timer.take() {
            timer.abort();
        }

        if is_typing {
            if !entry.active {
                entry.active = true;
                send_typing_event(&self.connection, conversation_id, sender_id, receiver_id, true)
                    .await;
            }

            let local_map = self.local.clone();
            let connection = self.connection.clone();
            let conversation = conversation_id.to_string();
            let sender = sender_id.to_string();
            let receiver = receiver_id.to_string();
            let delay = self.config.typing_stop_delay();
            entry.stop_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut local = local_map.lock().await;
                if let Some(entry) = local.get_mut(&conversation) {
                    // Guarded no-op if an explicit stop already went out.
                    if entry.active {
                        entry.active = false;
                        entry.stop_timer = None;
                        send_typing_event(&connection, &conversation, &sender, &receiver, false)
                            .await;
                    }
                }
            }));
        } else if entry.active {
            entry.active = false;
            send_typing_event(&self.connection, conversation_id, sender_id, receiver_id, false)
                .await;
        }
    }

    /// Applies an inbound typing event. Every `true` restarts the per-key
    /// expiry timer (cleared and restarted, not stacked); when it fires, the
    /// state is forced to `false` even without an explicit stop from the
    /// sender.
    pub async fn apply_remote(&self, payload: TypingPayload, current_user_id: &str) {
        if payload.sender_id == current_user_id {
            return;
        }

        let key = (
            payload.conversation_id.clone(),
            payload.sender_id.clone(),
        );
        let mut remote = self.remote.lock().await;

        if let Some(previous) = remote.get_mut(&key) {
            if let Some(expiry) = previous.expiry.take() {
                expiry.abort();
            }
        }

        let expiry = if payload.is_typing {
            let remote_map = self.remote.clone();
            let ui_tx = self.ui_tx.clone();
            let expire_key = key.clone();
            let window = self.config.typing_expiry();
            Some(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let mut remote = remote_map.lock().await;
                if let Some(entry) = remote.get_mut(&expire_key) {
                    if entry.state.is_typing {
                        debug!(
                            "Typing state for {}:{} expired without a stop event",
                            expire_key.0, expire_key.1
                        );
                        entry.state.is_typing = false;
                        entry.state.timestamp = Utc::now();
                        entry.expiry = None;
                        let _ = ui_tx.try_send(UiEvent::TypingChanged {
                            conversation_id: expire_key.0.clone(),
                            sender_id: expire_key.1.clone(),
                            is_typing: false,
                        });
                    }
                }
            }))
        } else {
            None
        };

        remote.insert(
            key.clone(),
            RemoteTyping {
                state: TypingState {
                    is_typing: payload.is_typing,
                    timestamp: payload.timestamp,
                },
                expiry,
            },
        );

        let _ = self.ui_tx.try_send(UiEvent::TypingChanged {
            conversation_id: key.0,
            sender_id: key.1,
            is_typing: payload.is_typing,
        });
    }

    pub async fn is_typing(&self, conversation_id: &str, sender_id: &str) -> bool {
        let remote = self.remote.lock().await;
        remote
            .get(&(conversation_id.to_string(), sender_id.to_string()))
            .map(|entry| entry.state.is_typing)
            .unwrap_or(false)
    }
}
