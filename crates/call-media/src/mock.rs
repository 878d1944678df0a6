//! Recording doubles for the device and peer-connection seams.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use call_signaling::{CallType, IceCandidate, SessionDescription};
use parking_lot::Mutex;

use crate::device::DeviceFacility;
use crate::error::{AcquisitionError, MediaError};
use crate::peer::{ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvents, SessionKey};
use crate::stream::{LocalStream, LocalTrack, RemoteTrack, TrackKind};

#[derive(Default)]
struct DeviceState {
    deny: AtomicBool,
    missing_camera: AtomicBool,
    acquired: AtomicUsize,
    stopped: AtomicUsize,
}

/// Hands out hardware-free tracks and counts how many were stopped.
#[derive(Clone, Default)]
pub struct MockDevices {
    state: Arc<DeviceState>,
}

impl MockDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_permission(&self, deny: bool) {
        self.state.deny.store(deny, Ordering::SeqCst);
    }

    pub fn remove_camera(&self, missing: bool) {
        self.state.missing_camera.store(missing, Ordering::SeqCst);
    }

    /// Number of tracks handed out.
    pub fn acquired(&self) -> usize {
        self.state.acquired.load(Ordering::SeqCst)
    }

    /// Number of tracks stopped.
    pub fn stopped(&self) -> usize {
        self.state.stopped.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.acquired() - self.stopped()
    }

    fn track(&self, kind: TrackKind) -> LocalTrack {
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        LocalTrack::new(kind, format!("mock-{kind}")).on_stop(move |_| {
            state.stopped.fetch_add(1, Ordering::SeqCst);
        })
    }
}

#[async_trait]
impl DeviceFacility for MockDevices {
    async fn acquire(&self, call_type: CallType) -> Result<LocalStream, AcquisitionError> {
        if self.state.deny.load(Ordering::SeqCst) {
            return Err(AcquisitionError::PermissionDenied);
        }
        if call_type.has_video() && self.state.missing_camera.load(Ordering::SeqCst) {
            return Err(AcquisitionError::NoDevice(TrackKind::Video));
        }
        let mut tracks = vec![self.track(TrackKind::Audio)];
        if call_type.has_video() {
            tracks.push(self.track(TrackKind::Video));
        }
        Ok(LocalStream::new("mock-local", tracks))
    }
}

/// One call made against a mock peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    AddTrack(TrackKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Default)]
struct FactoryState {
    created: AtomicUsize,
    closed: AtomicUsize,
    fail_create: AtomicBool,
    fail_remote: AtomicBool,
    calls: Mutex<Vec<(SessionKey, PeerCall)>>,
    events: Mutex<Vec<PeerEvents>>,
}

/// Peer connections that record every call and emit events on demand.
#[derive(Clone, Default)]
pub struct MockPeerFactory {
    state: Arc<FactoryState>,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Makes `set_remote_description` fail, as a malformed SDP would.
    pub fn fail_remote_description(&self, fail: bool) {
        self.state.fail_remote.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(SessionKey, PeerCall)> {
        self.state.calls.lock().clone()
    }

    /// Calls recorded for `session`, in order.
    pub fn calls_for(&self, session: SessionKey) -> Vec<PeerCall> {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|(key, _)| *key == session)
            .map(|(_, call)| call.clone())
            .collect()
    }

    fn latest_events(&self) -> Option<PeerEvents> {
        self.state.events.lock().last().cloned()
    }

    /// Reports a connection state change from the newest connection.
    pub fn emit_state(&self, state: ConnectionState) -> bool {
        self.latest_events().map(|events| events.state(state)).is_some()
    }

    pub fn emit_candidate(&self, candidate: IceCandidate) -> bool {
        self.latest_events()
            .map(|events| events.candidate(candidate))
            .is_some()
    }

    pub fn emit_remote_track(&self, kind: TrackKind) -> bool {
        self.latest_events()
            .map(|events| events.remote_track(RemoteTrack::new(kind, format!("remote-{kind}"), "remote")))
            .is_some()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(&self, events: PeerEvents) -> Result<Arc<dyn PeerConnection>, MediaError> {
        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(MediaError::Negotiation("mock peer creation refused".into()));
        }
        self.state.created.fetch_add(1, Ordering::SeqCst);
        let session = events.session();
        self.state.events.lock().push(events);
        Ok(Arc::new(MockPeer {
            session,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockPeer {
    session: SessionKey,
    state: Arc<FactoryState>,
    closed: AtomicBool,
}

impl MockPeer {
    fn record(&self, call: PeerCall) {
        self.state.calls.lock().push((self.session, call));
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), MediaError> {
        self.record(PeerCall::AddTrack(track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.record(PeerCall::CreateOffer);
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.session)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.session)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.record(PeerCall::SetLocal(description));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        if self.state.fail_remote.load(Ordering::SeqCst) {
            return Err(MediaError::Negotiation("mock remote description rejected".into()));
        }
        self.record(PeerCall::SetRemote(description));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.record(PeerCall::AddCandidate(candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
            self.record(PeerCall::Close);
        }
        Ok(())
    }
}
