// Connection management for the sync engine.
// Owns the single logical connection to the messaging backend and hides
// reconnect, backoff, circuit-breaker and heartbeat mechanics from callers.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::sync::events::{PingPayload, WireEvent};
use crate::sync::SyncError;

/// Write half of an established connection.
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, frame: String) -> Result<(), SyncError>;
    async fn close(&mut self);
}

/// Read half of an established connection. `next_frame` returning `None`
/// means the connection is gone, for whatever reason.
#[async_trait]
pub trait TransportStream: Send {
    async fn next_frame(&mut self) -> Option<String>;
}

/// Dialer for the live transport. Injected at construction so tests can
/// substitute a scriptable fake for the real WebSocket.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        user_id: &str,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), SyncError>;
}

/// Connection status as surfaced to subscribers (UI banner, failover logic).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    CircuitOpen,
}

/// Internal connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    CircuitOpen,
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnInput {
    AttemptStarted,
    Opened,
    Closed,
    /// A full connect cycle (all retries) was exhausted without success.
    CycleFailed,
    ManualRetry,
}

/// Reducer-style state machine: current state plus a consecutive-failure
/// counter for the circuit breaker. All transitions go through `apply`.
#[derive(Debug)]
pub struct ConnStateMachine {
    state: ConnState,
    failure_count: u32,
    max_failures: u32,
}

impl ConnStateMachine {
    pub fn new(max_failures: u32) -> Self {
        ConnStateMachine {
            state: ConnState::Disconnected,
            failure_count: 0,
            max_failures,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn apply(&mut self, input: ConnInput) -> ConnState {
        self.state = match (self.state, input) {
            // A retry while the connection is alive (or being dialed) must
            // not tear it down; the request is simply redundant.
            (ConnState::Connected, ConnInput::ManualRetry) => ConnState::Connected,
            (ConnState::Connecting, ConnInput::ManualRetry) => ConnState::Connecting,
            (_, ConnInput::ManualRetry) => {
                self.failure_count = 0;
                ConnState::Disconnected
            }
            // Once the circuit is open, only a manual retry moves us out.
            (ConnState::CircuitOpen, _) => ConnState::CircuitOpen,
            (_, ConnInput::AttemptStarted) => ConnState::Connecting,
            (_, ConnInput::Opened) => {
                self.failure_count = 0;
                ConnState::Connected
            }
            (_, ConnInput::Closed) => ConnState::Disconnected,
            (_, ConnInput::CycleFailed) => {
                self.failure_count += 1;
                if self.failure_count >= self.max_failures {
                    ConnState::CircuitOpen
                } else {
                    ConnState::Disconnected
                }
            }
        };
        self.state
    }
}

fn status_of(state: ConnState) -> ConnectionStatus {
    match state {
        ConnState::Connected => ConnectionStatus::Connected,
        ConnState::CircuitOpen => ConnectionStatus::CircuitOpen,
        ConnState::Disconnected | ConnState::Connecting => ConnectionStatus::Reconnecting,
    }
}

/// Exponential backoff with jitter, bounded by the configured maximum.
fn backoff_delay(config: &SyncConfig, attempt: u32) -> Duration {
    let base = config.initial_delay().as_millis() as f64 * 1.5_f64.powi(attempt as i32 - 1);
    let capped = base.min(config.max_delay().as_millis() as f64);
    let jitter = capped * rand::thread_rng().gen_range(0.0..0.3);
    Duration::from_millis((capped + jitter) as u64)
}

/// Maintains one logical connection per client session. All other components
/// reach the network through `send`; inbound frames are decoded and handed
/// to the single dispatcher receiver returned by `new`.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    machine: TokioMutex<ConnStateMachine>,
    event_tx: mpsc::Sender<WireEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    // Kept so the watch channel stays alive with zero external subscribers.
    _status_rx: watch::Receiver<ConnectionStatus>,
    outbound: TokioMutex<Option<mpsc::Sender<String>>>,
    user_id: TokioMutex<Option<String>>,
    running: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: SyncConfig,
    ) -> (Self, mpsc::Receiver<WireEvent>) {
        let (event_tx, event_rx) = mpsc::channel(100);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Reconnecting);
        let max_failures = config.max_failures;

        (
            ConnectionManager {
                transport,
                config,
                machine: TokioMutex::new(ConnStateMachine::new(max_failures)),
                event_tx,
                status_tx,
                _status_rx: status_rx,
                outbound: TokioMutex::new(None),
                user_id: TokioMutex::new(None),
                running: AtomicBool::new(false),
            },
            event_rx,
        )
    }

    /// Subscribe to connection status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub async fn state(&self) -> ConnState {
        self.machine.lock().await.state()
    }

    async fn apply(&self, input: ConnInput) -> ConnState {
        let next = {
            let mut machine = self.machine.lock().await;
            machine.apply(input)
        };
        self.status_tx.send_replace(status_of(next));
        next
    }

    /// Opens the connection for `user_id` and keeps it alive in the
    /// background until the circuit opens. Returns immediately; observe
    /// progress through `subscribe_status`.
    pub async fn connect(self: &Arc<Self>, user_id: &str) {
        *self.user_id.lock().await = Some(user_id.to_string());
        self.spawn_run().await;
    }

    /// Resets the circuit breaker and resumes connection attempts now.
    pub async fn retry_connection(self: &Arc<Self>) {
        info!("Manual connection retry requested");
        self.apply(ConnInput::ManualRetry).await;
        self.spawn_run().await;
    }

    async fn spawn_run(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Connection loop already running");
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let user_id = manager.user_id.lock().await.clone();
                if let Some(user_id) = user_id {
                    manager.run(&user_id).await;
                } else {
                    warn!("Connection loop started without a user id");
                }
                manager.running.store(false, Ordering::SeqCst);
                // A manual retry may have reset the breaker while this loop
                // was winding down and found the running flag still set.
                // Take over its spawn instead of leaving no loop at all.
                if manager.state().await == ConnState::Disconnected
                    && !manager.running.swap(true, Ordering::SeqCst)
                {
                    continue;
                }
                break;
            }
        });
    }

    /// Supervision loop: connect, drive the session until it dies, repeat.
    /// Exits only when the circuit breaker opens.
    async fn run(&self, user_id: &str) {
        loop {
            match self.establish(user_id).await {
                Some((sink, stream)) => {
                    self.apply(ConnInput::Opened).await;
                    info!("Connected to messaging backend as {}", user_id);
                    self.drive_session(sink, stream).await;
                    if self.apply(ConnInput::Closed).await == ConnState::CircuitOpen {
                        return;
                    }
                    warn!("Connection lost, scheduling reconnect");
                }
                None => {
                    let state = self.apply(ConnInput::CycleFailed).await;
                    if state == ConnState::CircuitOpen {
                        warn!(
                            "Circuit breaker open after {} consecutive failed connect cycles; manual retry required",
                            self.machine.lock().await.failure_count()
                        );
                        return;
                    }
                }
            }
        }
    }

    /// One connect cycle: up to `max_retries` attempts with growing backoff.
    async fn establish(
        &self,
        user_id: &str,
    ) -> Option<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        for attempt in 0..self.config.max_retries {
            if self.state().await == ConnState::CircuitOpen {
                return None;
            }
            if attempt > 0 {
                let delay = backoff_delay(&self.config, attempt);
                debug!(
                    "Reconnect attempt {}/{} in {:?}",
                    attempt + 1,
                    self.config.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            self.apply(ConnInput::AttemptStarted).await;
            match self.transport.connect(user_id).await {
                Ok(link) => return Some(link),
                Err(err) => warn!(
                    "Connection attempt {}/{} failed: {}",
                    attempt + 1,
                    self.config.max_retries,
                    err
                ),
            }
        }
        None
    }

    /// Pumps a live session: forwards inbound frames to the dispatcher,
    /// drains the outbound queue through a writer task, and enforces the
    /// heartbeat. Returns when the session is dead for any reason.
    async fn drive_session(
        &self,
        sink: Box<dyn TransportSink>,
        mut stream: Box<dyn TransportStream>,
    ) {
        let (out_tx, out_rx) = mpsc::channel::<String>(64);
        *self.outbound.lock().await = Some(out_tx.clone());

        let mut writer = tokio::spawn(write_loop(sink, out_rx));
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        // The immediate first tick doubles as the initial ping.
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                frame = stream.next_frame() => match frame {
                    Some(raw) => {
                        last_inbound = Instant::now();
                        if let Some(event) = WireEvent::decode(&raw) {
                            if self.event_tx.send(event).await.is_err() {
                                warn!("Event dispatcher gone, closing connection");
                                break;
                            }
                        }
                    }
                    None => {
                        warn!("Connection closed by peer");
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() >= self.config.heartbeat_timeout() {
                        warn!(
                            "No inbound traffic for {:?}, treating connection as dead",
                            self.config.heartbeat_timeout()
                        );
                        break;
                    }
                    let ping = WireEvent::Ping(PingPayload {
                        timestamp: Utc::now().timestamp_millis(),
                        server_time: None,
                    });
                    match ping.encode() {
                        Ok(frame) => {
                            let _ = out_tx.try_send(frame);
                        }
                        Err(err) => error!("Failed to encode heartbeat ping: {}", err),
                    }
                },
                _ = &mut writer => {
                    warn!("Transport writer stopped, closing connection");
                    break;
                }
            }
        }

        *self.outbound.lock().await = None;
        drop(out_tx);
        writer.abort();
    }

    /// Serializes and queues an event on the live connection. Fails
    /// synchronously with `NotConnected` (or `CircuitOpen`) when there is no
    /// usable connection; never blocks the caller.
    pub async fn send(&self, event: &WireEvent) -> Result<(), SyncError> {
        match self.state().await {
            ConnState::Connected => {}
            ConnState::CircuitOpen => return Err(SyncError::CircuitOpen),
            _ => return Err(SyncError::NotConnected),
        }

        let frame = event.encode()?;
        let guard = self.outbound.lock().await;
        let tx = guard.as_ref().ok_or(SyncError::NotConnected)?;
        tx.try_send(frame).map_err(|_| SyncError::NotConnected)
    }
}

/// Writer task owning the sink half; exits on the first write failure or
/// when the outbound queue closes.
async fn write_loop(mut sink: Box<dyn TransportSink>, mut out_rx: mpsc::Receiver<String>) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(err) = sink.send(frame).await {
            warn!("Transport write failed: {}", err);
            break;
        }
    }
    sink.close().await;
}
