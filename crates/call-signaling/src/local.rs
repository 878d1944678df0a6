//! In-process relay for tests and embedding. Routing follows the same
//! [`RoomDirectory`] rules as the websocket relay.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::auth::verify_token;
use crate::envelope::{RelayRequest, UserId};
use crate::error::TransportError;
use crate::relay::{Delivery, RoomDirectory};
use crate::transport::{Inbound, RelayContext, SignalingTransport, TransportEvent};

#[derive(Default)]
struct RelayInner {
    peers: Mutex<HashMap<UserId, mpsc::UnboundedSender<TransportEvent>>>,
    rooms: Mutex<RoomDirectory>,
    secret: Option<Vec<u8>>,
}

#[derive(Clone, Default)]
pub struct LocalRelay {
    inner: Arc<RelayInner>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A relay that only admits joins carrying a token minted with `secret`.
    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                secret: Some(secret.into()),
                ..Default::default()
            }),
        }
    }

    pub fn transport(&self) -> LocalTransport {
        LocalTransport {
            relay: self.clone(),
            inbound: Inbound::new(),
            user: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        }
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.inner.peers.lock().contains_key(&user)
    }

    /// Severs `user` as if their connection dropped.
    pub fn drop_user(&self, user: UserId) {
        let removed = self.inner.peers.lock().remove(&user);
        self.inner.rooms.lock().release_user(user);
        if let Some(tx) = removed {
            let _ = tx.send(TransportEvent::Lost {
                reason: "connection dropped by relay".into(),
            });
        }
    }

    fn attach(
        &self,
        context: &RelayContext,
        tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        if let Some(secret) = &self.inner.secret {
            verify_token(secret, context.user_id, context.token.as_deref())
                .map_err(|err| TransportError::JoinRejected(err.to_string()))?;
        }
        let replaced = self.inner.peers.lock().insert(context.user_id, tx);
        if replaced.is_some() {
            tracing::debug!(
                target = "signaling",
                user = %context.user_id,
                "local relay replaced existing connection"
            );
        }
        Ok(())
    }

    fn detach(&self, user: UserId, tx: &mpsc::UnboundedSender<TransportEvent>) {
        let mut peers = self.inner.peers.lock();
        if peers.get(&user).is_some_and(|current| current.same_channel(tx)) {
            peers.remove(&user);
            drop(peers);
            self.inner.rooms.lock().release_user(user);
        }
    }

    fn is_attached(&self, user: UserId, tx: &mpsc::UnboundedSender<TransportEvent>) -> bool {
        self.inner
            .peers
            .lock()
            .get(&user)
            .is_some_and(|current| current.same_channel(tx))
    }

    fn deliver(&self, sender: UserId, request: RelayRequest) {
        let room_id = request.room_id;
        let routed = self.inner.rooms.lock().route(sender, request);
        let delivery = match routed {
            Ok(delivery) => delivery,
            Err(err) => {
                tracing::debug!(target = "signaling", user = %sender, "local relay refused envelope: {err}");
                if let Some(tx) = self.inner.peers.lock().get(&sender) {
                    let _ = tx.send(TransportEvent::Refused {
                        room_id,
                        reason: err.to_string(),
                    });
                }
                return;
            }
        };
        if self.forward(&delivery) {
            return;
        }
        match delivery.unavailable_reply() {
            Some(reply) => {
                self.inner.rooms.lock().release(room_id);
                self.forward(&reply);
            }
            None => tracing::debug!(
                target = "signaling",
                recipient = %delivery.recipient,
                "local relay recipient offline"
            ),
        }
    }

    fn forward(&self, delivery: &Delivery) -> bool {
        let peers = self.inner.peers.lock();
        match peers.get(&delivery.recipient) {
            Some(tx) => tx
                .send(TransportEvent::Envelope(delivery.envelope.clone()))
                .is_ok(),
            None => false,
        }
    }
}

/// One client's connection to a [`LocalRelay`].
pub struct LocalTransport {
    relay: LocalRelay,
    inbound: Inbound,
    user: Mutex<Option<UserId>>,
    sent: Mutex<Vec<RelayRequest>>,
    fail_sends: AtomicBool,
}

impl LocalTransport {
    /// Every request this transport handed to the relay, in order.
    pub fn sent(&self) -> Vec<RelayRequest> {
        self.sent.lock().clone()
    }

    /// Makes subsequent sends fail with `ChannelClosed`.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingTransport for LocalTransport {
    async fn connect(&self, context: &RelayContext) -> Result<(), TransportError> {
        let tx = self.inbound.sender();
        let previous = *self.user.lock();
        if previous == Some(context.user_id) && self.relay.is_attached(context.user_id, &tx) {
            return Ok(());
        }
        if let Some(previous) = previous {
            self.relay.detach(previous, &tx);
        }
        self.relay.attach(context, tx)?;
        *self.user.lock() = Some(context.user_id);
        tracing::debug!(target = "signaling", user = %context.user_id, "joined local relay");
        Ok(())
    }

    async fn send(&self, request: RelayRequest) -> Result<(), TransportError> {
        let user = (*self.user.lock()).ok_or(TransportError::NotConnected)?;
        if !self.relay.is_attached(user, &self.inbound.sender()) {
            return Err(TransportError::NotConnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.sent.lock().push(request.clone());
        self.relay.deliver(user, request);
        Ok(())
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        self.inbound.take()
    }

    async fn disconnect(&self) {
        if let Some(user) = self.user.lock().take() {
            self.relay.detach(user, &self.inbound.sender());
        }
    }

    fn is_connected(&self) -> bool {
        match *self.user.lock() {
            Some(user) => self.relay.is_attached(user, &self.inbound.sender()),
            None => false,
        }
    }

    fn local_user(&self) -> Option<UserId> {
        *self.user.lock()
    }
}
