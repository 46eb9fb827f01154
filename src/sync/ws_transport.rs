// WebSocket transport backing the live connection in production.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::sync::connection::{Transport, TransportSink, TransportStream};
use crate::sync::SyncError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the messaging backend over WebSocket, identifying the session by
/// user id in the query string.
pub struct WebSocketTransport {
    base_url: String,
}

impl WebSocketTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        WebSocketTransport {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        user_id: &str,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), SyncError> {
        let url = format!("{}?userId={}&client=rust", self.base_url, user_id);
        debug!("Dialing {}", self.base_url);

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;

        let (sink, stream) = stream.split();
        Ok((
            Box::new(WebSocketSink { sink }),
            Box::new(WebSocketReader { stream }),
        ))
    }
}

struct WebSocketSink {
    sink: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl TransportSink for WebSocketSink {
    async fn send(&mut self, frame: String) -> Result<(), SyncError> {
        self.sink
            .send(WsMessage::Text(frame))
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

struct WebSocketReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportStream for WebSocketReader {
    async fn next_frame(&mut self) -> Option<String> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(text),
                // Protocol-level ping/pong is handled by tungstenite; the
                // engine heartbeat travels as an application frame.
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Binary(_))) => {
                    debug!("Ignoring unexpected binary frame");
                    continue;
                }
                Some(Ok(WsMessage::Frame(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => return None,
                Some(Err(err)) => {
                    warn!("WebSocket read error: {}", err);
                    return None;
                }
            }
        }
    }
}
