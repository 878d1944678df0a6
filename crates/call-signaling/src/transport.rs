use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::envelope::{Envelope, RelayRequest, RoomId, UserId};
use crate::error::TransportError;

/// Identity a client presents to the relay when it joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayContext {
    pub user_id: UserId,
    pub token: Option<String>,
}

impl RelayContext {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Envelope(Envelope),
    /// The relay could not route something this client sent into `room_id`.
    Refused { room_id: RoomId, reason: String },
    /// The channel dropped without a local `disconnect()`.
    Lost { reason: String },
}

/// A persistent, relay-backed signaling channel.
///
/// Inbound events are handed to a single consumer in arrival order. The
/// transport never retries, reorders or de-duplicates on its own.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Joins the relay as `context.user_id`. Calling it again with the same
    /// context while connected is a no-op.
    async fn connect(&self, context: &RelayContext) -> Result<(), TransportError>;

    /// One delivery attempt for `request`.
    async fn send(&self, request: RelayRequest) -> Result<(), TransportError>;

    /// Takes the inbound event stream. Only the first call succeeds.
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn local_user(&self) -> Option<UserId>;
}

/// Inbound channel whose receiver can be claimed exactly once.
pub(crate) struct Inbound {
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl Inbound {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.tx.clone()
    }

    pub(crate) fn take(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        self.rx.lock().take().ok_or(TransportError::AlreadySubscribed)
    }
}
