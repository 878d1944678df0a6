use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use call_signaling::{
    ClientMessage, Delivery, RelayRequest, RoomDirectory, RouteError, ServerMessage, UserId,
    verify_token,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;

/// One joined websocket.
struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_heartbeat: Arc<Mutex<Instant>>,
    /// Fired when the relay drops this connection on its own.
    kick: Arc<Notify>,
}

/// Relay state shared by every connection.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    users: DashMap<UserId, Connection>,
    rooms: Mutex<RoomDirectory>,
    secret: Option<Vec<u8>>,
    next_connection: AtomicU64,
    heartbeat_timeout: Duration,
}

impl RelayState {
    /// Must be called inside a Tokio runtime; starts the heartbeat monitor.
    pub fn new(config: &RelayConfig) -> Self {
        let state = Self {
            inner: Arc::new(RelayInner {
                users: DashMap::new(),
                rooms: Mutex::new(RoomDirectory::new()),
                secret: config.secret.as_ref().map(|secret| secret.as_bytes().to_vec()),
                next_connection: AtomicU64::new(1),
                heartbeat_timeout: config.heartbeat_timeout(),
            }),
        };

        let monitor = state.clone();
        tokio::spawn(async move {
            monitor.monitor_heartbeats().await;
        });

        state
    }

    pub fn connected_users(&self) -> usize {
        self.inner.users.len()
    }

    pub fn active_rooms(&self) -> usize {
        self.inner.rooms.lock().len()
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.inner.users.contains_key(&user)
    }

    async fn monitor_heartbeats(&self) {
        let timeout = self.inner.heartbeat_timeout;
        let mut interval = tokio::time::interval((timeout / 3).max(Duration::from_secs(1)));

        loop {
            interval.tick().await;

            let stale: Vec<(UserId, u64)> = self
                .inner
                .users
                .iter()
                .filter(|entry| entry.last_heartbeat.lock().elapsed() > timeout)
                .map(|entry| (*entry.key(), entry.id))
                .collect();

            for (user, connection) in stale {
                info!(user = %user, "dropping relay connection after heartbeat timeout");
                if let Some((_, removed)) = self
                    .inner
                    .users
                    .remove_if(&user, |_, current| current.id == connection)
                {
                    removed.kick.notify_one();
                    self.inner.rooms.lock().release_user(user);
                }
            }
        }
    }

    fn next_connection_id(&self) -> u64 {
        self.inner.next_connection.fetch_add(1, Ordering::SeqCst)
    }

    fn join(
        &self,
        user: UserId,
        token: Option<&str>,
        connection: Connection,
    ) -> Result<(), String> {
        if let Some(secret) = &self.inner.secret {
            verify_token(secret, user, token).map_err(|err| err.to_string())?;
        }
        if let Some(previous) = self.inner.users.insert(user, connection) {
            debug!(user = %user, "new connection supersedes the previous one");
            previous.kick.notify_one();
        }
        Ok(())
    }

    fn leave(&self, user: UserId, connection: u64) {
        let removed = self
            .inner
            .users
            .remove_if(&user, |_, current| current.id == connection);
        if removed.is_some() {
            let released = self.inner.rooms.lock().release_user(user);
            debug!(user = %user, rooms = released.len(), "user left relay");
        }
    }

    fn touch(&self, user: UserId) {
        if let Some(connection) = self.inner.users.get(&user) {
            *connection.last_heartbeat.lock() = Instant::now();
        }
    }

    /// Stamps and forwards `request`. Routing failures go back to the
    /// sender as an error message.
    fn relay(&self, sender: UserId, request: RelayRequest) -> Result<(), RouteError> {
        let room = request.room_id;
        let delivery = self.inner.rooms.lock().route(sender, request)?;
        if self.forward(&delivery) {
            return Ok(());
        }
        match delivery.unavailable_reply() {
            Some(reply) => {
                debug!(
                    sender = %sender,
                    target = %delivery.recipient,
                    "invite target offline"
                );
                self.inner.rooms.lock().release(room);
                self.forward(&reply);
            }
            None => debug!(
                recipient = %delivery.recipient,
                kind = ?delivery.envelope.signal_type(),
                "recipient offline, envelope dropped"
            ),
        }
        Ok(())
    }

    fn forward(&self, delivery: &Delivery) -> bool {
        match self.inner.users.get(&delivery.recipient) {
            Some(connection) => connection
                .tx
                .send(ServerMessage::Signal {
                    envelope: delivery.envelope.clone(),
                })
                .is_ok(),
            None => false,
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct Session {
    id: u64,
    user: Option<UserId>,
    tx: mpsc::UnboundedSender<ServerMessage>,
    kick: Arc<Notify>,
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut session = Session {
        id: state.next_connection_id(),
        user: None,
        tx,
        kick: Arc::new(Notify::new()),
    };

    let connection_id = session.id;
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!("failed to encode relay message: {err}"),
            }
        }
        let _ = sender.close().await;
        debug!(connection = connection_id, "writer task ended");
    });

    debug!(connection = session.id, "websocket connected");

    loop {
        let kick = Arc::clone(&session.kick);
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = kick.notified() => {
                debug!(connection = session.id, "connection dropped by relay");
                break;
            }
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!(connection = session.id, "websocket error: {err}");
                break;
            }
            None => break,
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(connection = session.id, "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => handle_client_message(&state, &mut session, message),
            Err(err) => {
                warn!(connection = session.id, "failed to parse client message: {err}");
                let _ = session.tx.send(ServerMessage::Error {
                    room_id: None,
                    message: format!("invalid message format: {err}"),
                });
            }
        }
    }

    if let Some(user) = session.user {
        state.leave(user, session.id);
    }
    drop(session);
    let _ = writer.await;
}

fn handle_client_message(state: &RelayState, session: &mut Session, message: ClientMessage) {
    match message {
        ClientMessage::Join { user_id, token } => {
            if let Some(current) = session.user {
                let reply = if current == user_id {
                    ServerMessage::Joined { user_id }
                } else {
                    ServerMessage::JoinError {
                        reason: format!("connection already joined as {current}"),
                    }
                };
                let _ = session.tx.send(reply);
                return;
            }
            let connection = Connection {
                id: session.id,
                tx: session.tx.clone(),
                last_heartbeat: Arc::new(Mutex::new(Instant::now())),
                kick: Arc::clone(&session.kick),
            };
            match state.join(user_id, token.as_deref(), connection) {
                Ok(()) => {
                    info!(user = %user_id, connection = session.id, "user joined relay");
                    session.user = Some(user_id);
                    let _ = session.tx.send(ServerMessage::Joined { user_id });
                }
                Err(reason) => {
                    warn!(user = %user_id, "join rejected: {reason}");
                    let _ = session.tx.send(ServerMessage::JoinError { reason });
                }
            }
        }
        ClientMessage::Signal { envelope } => {
            let Some(user) = session.user else {
                let _ = session.tx.send(ServerMessage::Error {
                    room_id: Some(envelope.room_id),
                    message: "join before sending signals".to_string(),
                });
                return;
            };
            state.touch(user);
            let room_id = envelope.room_id;
            if let Err(err) = state.relay(user, envelope) {
                debug!(user = %user, room = %room_id, "relay refused envelope: {err}");
                let _ = session.tx.send(ServerMessage::Error {
                    room_id: Some(room_id),
                    message: err.to_string(),
                });
            }
        }
        ClientMessage::Ping => {
            if let Some(user) = session.user {
                state.touch(user);
            }
            let _ = session.tx.send(ServerMessage::Pong);
        }
    }
}
