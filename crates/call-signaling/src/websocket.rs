use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use crate::envelope::{RelayRequest, UserId};
use crate::error::TransportError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::{Inbound, RelayContext, SignalingTransport, TransportEvent};

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub url: String,
    pub heartbeat: Duration,
    pub join_timeout: Duration,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: DEFAULT_HEARTBEAT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

struct Link {
    context: RelayContext,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    tasks: Vec<JoinHandle<()>>,
    alive: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl Link {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn shutdown(mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

type JoinOutcome = Result<UserId, String>;

/// Signaling over a websocket to the call relay.
pub struct WebSocketTransport {
    config: WebSocketConfig,
    inbound: Inbound,
    link: AsyncMutex<Option<Link>>,
    current: parking_lot::Mutex<Option<(UserId, Arc<AtomicBool>)>>,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            inbound: Inbound::new(),
            link: AsyncMutex::new(None),
            current: parking_lot::Mutex::new(None),
        }
    }

    async fn open(&self, context: &RelayContext) -> Result<Link, TransportError> {
        let websocket_url = relay_websocket_url(&self.config.url)?;
        let connecting = connect_async(websocket_url.as_str());
        let (ws_stream, _) = tokio::time::timeout(self.config.join_timeout, connecting)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "signaling",
            url = %websocket_url,
            "relay websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (join_tx, join_rx) = oneshot::channel::<JoinOutcome>();
        let alive = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        let writer_alive = Arc::clone(&alive);
        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "signaling", "failed to encode relay message: {err}");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    writer_alive.store(false, Ordering::SeqCst);
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let inbound_tx = self.inbound.sender();
        let reader_alive = Arc::clone(&alive);
        let reader_closing = Arc::clone(&closing);
        let reader_handle = tokio::spawn(async move {
            let mut join_tx = Some(join_tx);
            let reason = loop {
                let text = match ws_read.next().await {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_))) | None => break "relay closed the connection".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "signaling", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "signaling", "relay websocket error: {err}");
                            }
                        }
                        break err.to_string();
                    }
                };
                tracing::trace!(target = "signaling", event = "ws_in", len = text.len());
                let message = match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(target = "signaling", "undecodable relay message: {err}");
                        continue;
                    }
                };
                match message {
                    ServerMessage::Joined { user_id } => {
                        if let Some(tx) = join_tx.take() {
                            let _ = tx.send(Ok(user_id));
                        }
                    }
                    ServerMessage::JoinError { reason } => {
                        if let Some(tx) = join_tx.take() {
                            let _ = tx.send(Err(reason));
                        }
                    }
                    ServerMessage::Signal { envelope } => {
                        tracing::debug!(
                            target = "signaling",
                            kind = ?envelope.signal_type(),
                            room = %envelope.room_id,
                            sender = %envelope.sender_id,
                            "envelope received"
                        );
                        if inbound_tx.send(TransportEvent::Envelope(envelope)).is_err() {
                            tracing::debug!(target = "signaling", "inbound consumer gone");
                        }
                    }
                    ServerMessage::Pong => {
                        tracing::trace!(target = "signaling", "pong");
                    }
                    ServerMessage::Error {
                        room_id: Some(room_id),
                        message,
                    } => {
                        tracing::debug!(
                            target = "signaling",
                            room = %room_id,
                            "relay refused envelope: {message}"
                        );
                        let refused = TransportEvent::Refused {
                            room_id,
                            reason: message,
                        };
                        if inbound_tx.send(refused).is_err() {
                            tracing::debug!(target = "signaling", "inbound consumer gone");
                        }
                    }
                    ServerMessage::Error {
                        room_id: None,
                        message,
                    } => {
                        tracing::warn!(target = "signaling", "relay reported error: {message}");
                    }
                }
            };
            reader_alive.store(false, Ordering::SeqCst);
            if !reader_closing.load(Ordering::SeqCst) {
                let _ = inbound_tx.send(TransportEvent::Lost { reason });
            }
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat = self.config.heartbeat;
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let link = Link {
            context: context.clone(),
            send_tx,
            tasks: vec![writer_handle, reader_handle, heartbeat_handle],
            alive,
            closing,
        };

        let join = ClientMessage::Join {
            user_id: context.user_id,
            token: context.token.clone(),
        };
        if link.send_tx.send(join).is_err() {
            link.shutdown();
            return Err(TransportError::ChannelClosed);
        }
        tracing::debug!(target = "signaling", user = %context.user_id, "sent relay join");

        match tokio::time::timeout(self.config.join_timeout, join_rx).await {
            Ok(Ok(Ok(user_id))) => {
                tracing::debug!(target = "signaling", user = %user_id, "joined relay");
                Ok(link)
            }
            Ok(Ok(Err(reason))) => {
                link.shutdown();
                Err(TransportError::JoinRejected(reason))
            }
            Ok(Err(_)) => {
                tracing::warn!(target = "signaling", "relay join channel dropped");
                link.shutdown();
                Err(TransportError::ChannelClosed)
            }
            Err(_) => {
                link.shutdown();
                Err(TransportError::Timeout)
            }
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn connect(&self, context: &RelayContext) -> Result<(), TransportError> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref() {
            if link.context == *context && link.is_alive() {
                return Ok(());
            }
        }
        if let Some(previous) = guard.take() {
            tracing::debug!(
                target = "signaling",
                user = %previous.context.user_id,
                "replacing relay connection"
            );
            previous.shutdown();
            *self.current.lock() = None;
        }
        let link = self.open(context).await?;
        *self.current.lock() = Some((context.user_id, Arc::clone(&link.alive)));
        *guard = Some(link);
        Ok(())
    }

    async fn send(&self, request: RelayRequest) -> Result<(), TransportError> {
        let guard = self.link.lock().await;
        let link = guard
            .as_ref()
            .filter(|link| link.is_alive())
            .ok_or(TransportError::NotConnected)?;
        link.send_tx
            .send(ClientMessage::Signal { envelope: request })
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        self.inbound.take()
    }

    async fn disconnect(&self) {
        if let Some(link) = self.link.lock().await.take() {
            tracing::debug!(target = "signaling", user = %link.context.user_id, "leaving relay");
            link.shutdown();
        }
        *self.current.lock() = None;
    }

    fn is_connected(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|(_, alive)| alive.load(Ordering::SeqCst))
    }

    fn local_user(&self) -> Option<UserId> {
        self.current.lock().as_ref().map(|(user, _)| *user)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.shutdown();
        }
    }
}

/// Maps a relay base url to its websocket endpoint. `http(s)` becomes
/// `ws(s)` and an empty path becomes `/ws`.
pub fn relay_websocket_url(base: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(base)
        .map_err(|err| TransportError::Setup(format!("invalid relay url {base}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported relay url scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Setup("invalid websocket scheme".into()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_urls_map_to_websocket_endpoint() {
        let url = relay_websocket_url("http://127.0.0.1:8080").expect("url");
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/ws");
        let url = relay_websocket_url("https://relay.example.com/").expect("url");
        assert_eq!(url.as_str(), "wss://relay.example.com/ws");
    }

    #[test]
    fn explicit_paths_are_kept() {
        let url = relay_websocket_url("ws://localhost:9000/signal").expect("url");
        assert_eq!(url.as_str(), "ws://localhost:9000/signal");
    }

    #[test]
    fn unknown_schemes_are_rejected() {
        assert!(matches!(
            relay_websocket_url("ftp://relay"),
            Err(TransportError::Setup(_))
        ));
    }

    #[tokio::test]
    async fn send_before_connect_is_not_connected() {
        let transport = WebSocketTransport::new(WebSocketConfig::new("ws://127.0.0.1:1"));
        let request = RelayRequest::new(crate::envelope::RoomId(1), crate::envelope::Signal::Hangup);
        assert!(matches!(
            transport.send(request).await,
            Err(TransportError::NotConnected)
        ));
        assert!(!transport.is_connected());
        transport.disconnect().await;
    }
}
