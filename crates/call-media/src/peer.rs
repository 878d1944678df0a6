use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use call_signaling::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::error::MediaError;
use crate::stream::{LocalTrack, RemoteStream, RemoteTrack};

/// Identity of one media session. The call engine uses its call epoch, so
/// keys only grow; `0` is never a live session.
pub type SessionKey = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum MediaEvent {
    CandidateDiscovered {
        session: SessionKey,
        candidate: IceCandidate,
    },
    RemoteStreamReceived {
        session: SessionKey,
        stream: RemoteStream,
    },
    ConnectionStateChanged {
        session: SessionKey,
        state: ConnectionState,
    },
}

impl MediaEvent {
    pub fn session(&self) -> SessionKey {
        match self {
            MediaEvent::CandidateDiscovered { session, .. }
            | MediaEvent::RemoteStreamReceived { session, .. }
            | MediaEvent::ConnectionStateChanged { session, .. } => *session,
        }
    }
}

/// Event sink a peer connection reports into. Every event is tagged with the
/// session it belongs to; events from retired sessions are swallowed.
#[derive(Clone)]
pub struct PeerEvents {
    session: SessionKey,
    tx: mpsc::UnboundedSender<MediaEvent>,
    remote: RemoteStream,
    retired: Arc<AtomicU64>,
}

impl PeerEvents {
    pub(crate) fn new(
        session: SessionKey,
        tx: mpsc::UnboundedSender<MediaEvent>,
        remote: RemoteStream,
        retired: Arc<AtomicU64>,
    ) -> Self {
        Self {
            session,
            tx,
            remote,
            retired,
        }
    }

    pub fn session(&self) -> SessionKey {
        self.session
    }

    fn is_retired(&self) -> bool {
        self.session <= self.retired.load(Ordering::SeqCst)
    }

    fn emit(&self, event: MediaEvent) {
        if self.is_retired() {
            tracing::trace!(target = "media", session = self.session, "dropping event for retired session");
            return;
        }
        let _ = self.tx.send(event);
    }

    pub fn candidate(&self, candidate: IceCandidate) {
        self.emit(MediaEvent::CandidateDiscovered {
            session: self.session,
            candidate,
        });
    }

    /// Adds `track` to the session's remote stream and announces the stream.
    pub fn remote_track(&self, track: RemoteTrack) {
        if self.is_retired() {
            return;
        }
        tracing::debug!(
            target = "media",
            session = self.session,
            kind = %track.kind,
            id = %track.id,
            "remote track received"
        );
        if self.remote.add(track) {
            self.emit(MediaEvent::RemoteStreamReceived {
                session: self.session,
                stream: self.remote.clone(),
            });
        }
    }

    pub fn state(&self, state: ConnectionState) {
        tracing::debug!(target = "media", session = self.session, ?state, "peer connection state");
        self.emit(MediaEvent::ConnectionStateChanged {
            session: self.session,
            state,
        });
    }
}

/// The native peer connection, reduced to what call setup needs.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), MediaError>;
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;
    /// Also starts ICE gathering; discovered candidates go to [`PeerEvents`].
    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), MediaError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;
    async fn close(&self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: PeerEvents) -> Result<Arc<dyn PeerConnection>, MediaError>;
}
