use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use call_signaling::{CallType, IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::device::DeviceFacility;
use crate::error::MediaError;
use crate::peer::{MediaEvent, PeerConnection, PeerConnectionFactory, PeerEvents, SessionKey};
use crate::stream::{LocalStream, RemoteStream, TrackKind};

/// Remote candidates held back until the remote description is in place.
#[derive(Debug, Default)]
struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    seen: HashSet<IceCandidate>,
    remote_applied: bool,
}

enum Admission {
    Duplicate,
    Queued,
    ApplyNow,
}

impl CandidateQueue {
    fn admit(&mut self, candidate: &IceCandidate, has_peer: bool) -> Admission {
        if !self.seen.insert(candidate.clone()) {
            return Admission::Duplicate;
        }
        if self.remote_applied && has_peer {
            Admission::ApplyNow
        } else {
            self.pending.push_back(candidate.clone());
            Admission::Queued
        }
    }
}

struct MediaSlot {
    key: SessionKey,
    local: Option<LocalStream>,
    remote: RemoteStream,
    peer: Option<Arc<dyn PeerConnection>>,
    tracks_attached: bool,
    remote_description: Option<SessionDescription>,
    candidates: CandidateQueue,
}

impl MediaSlot {
    fn new(key: SessionKey) -> Self {
        Self {
            key,
            local: None,
            remote: RemoteStream::new(),
            peer: None,
            tracks_attached: false,
            remote_description: None,
            candidates: CandidateQueue::default(),
        }
    }
}

/// Owns the peer connection and the capture streams of the current call.
///
/// Every operation names the session it belongs to. Tearing a session down
/// retires its key: later or still-running operations for it end in
/// [`MediaError::Cancelled`] and release whatever they had acquired. No lock
/// is held across an await.
pub struct MediaSessionManager {
    devices: Arc<dyn DeviceFacility>,
    factory: Arc<dyn PeerConnectionFactory>,
    events: mpsc::UnboundedSender<MediaEvent>,
    retired: Arc<AtomicU64>,
    slot: Mutex<Option<MediaSlot>>,
}

impl MediaSessionManager {
    pub fn new(
        devices: Arc<dyn DeviceFacility>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<MediaEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            devices,
            factory,
            events,
            retired: Arc::new(AtomicU64::new(0)),
            slot: Mutex::new(None),
        };
        (manager, events_rx)
    }

    pub fn current_session(&self) -> Option<SessionKey> {
        self.slot.lock().as_ref().map(|slot| slot.key)
    }

    fn is_retired(&self, key: SessionKey) -> bool {
        key <= self.retired.load(Ordering::SeqCst)
    }

    /// Makes `key` the current slot, displacing an older one.
    async fn admit(&self, key: SessionKey) -> Result<(), MediaError> {
        if self.is_retired(key) {
            return Err(MediaError::Cancelled);
        }
        let displaced = {
            let mut slot = self.slot.lock();
            match slot.as_ref().map(|current| current.key) {
                Some(current) if current == key => None,
                Some(current) if current > key => return Err(MediaError::Cancelled),
                _ => slot.replace(MediaSlot::new(key)),
            }
        };
        if let Some(old) = displaced {
            self.retired.fetch_max(old.key, Ordering::SeqCst);
            tracing::debug!(target = "media", old = old.key, new = key, "displacing stale media session");
            release(old).await;
        }
        Ok(())
    }

    /// Runs `f` against the slot for `key`, or fails with `Cancelled`.
    fn with_slot<T>(
        &self,
        key: SessionKey,
        f: impl FnOnce(&mut MediaSlot) -> T,
    ) -> Result<T, MediaError> {
        let mut slot = self.slot.lock();
        match slot.as_mut() {
            Some(current) if current.key == key && !self.is_retired(key) => Ok(f(current)),
            _ => Err(MediaError::Cancelled),
        }
    }

    pub async fn create_local_media(
        &self,
        key: SessionKey,
        call_type: CallType,
    ) -> Result<LocalStream, MediaError> {
        self.admit(key).await?;
        if let Some(existing) = self.with_slot(key, |slot| slot.local.clone())? {
            return Ok(existing);
        }
        let stream = self.devices.acquire(call_type).await?;
        let stored = self.with_slot(key, |slot| match &slot.local {
            Some(existing) => Err(existing.clone()),
            None => {
                slot.local = Some(stream.clone());
                Ok(())
            }
        });
        match stored {
            Ok(Ok(())) => {
                tracing::debug!(
                    target = "media",
                    session = key,
                    call_type = %call_type,
                    "local media acquired"
                );
                Ok(stream)
            }
            Ok(Err(existing)) => {
                stream.stop();
                Ok(existing)
            }
            Err(err) => {
                tracing::debug!(target = "media", session = key, "releasing media acquired for retired session");
                stream.stop();
                Err(err)
            }
        }
    }

    async fn ensure_peer(&self, key: SessionKey) -> Result<Arc<dyn PeerConnection>, MediaError> {
        self.admit(key).await?;
        let remote = match self.with_slot(key, |slot| (slot.peer.clone(), slot.remote.clone()))? {
            (Some(peer), _) => return Ok(peer),
            (None, remote) => remote,
        };
        let events = PeerEvents::new(key, self.events.clone(), remote, Arc::clone(&self.retired));
        let created = self.factory.create(events).await?;
        let stored = self.with_slot(key, |slot| match &slot.peer {
            Some(existing) => Err(Arc::clone(existing)),
            None => {
                slot.peer = Some(Arc::clone(&created));
                Ok(())
            }
        });
        match stored {
            Ok(Ok(())) => Ok(created),
            Ok(Err(existing)) => {
                close_quietly(key, created.as_ref()).await;
                Ok(existing)
            }
            Err(err) => {
                close_quietly(key, created.as_ref()).await;
                Err(err)
            }
        }
    }

    async fn attach_tracks(
        &self,
        key: SessionKey,
        peer: &Arc<dyn PeerConnection>,
    ) -> Result<(), MediaError> {
        let local = self.with_slot(key, |slot| {
            if slot.tracks_attached {
                return Ok(None);
            }
            match &slot.local {
                Some(local) => {
                    slot.tracks_attached = true;
                    Ok(Some(local.clone()))
                }
                None => Err(MediaError::Negotiation("local media has not been acquired".into())),
            }
        })??;
        if let Some(local) = local {
            for track in local.tracks() {
                peer.add_track(track).await?;
            }
        }
        Ok(())
    }

    /// Produces and applies the local offer. ICE gathering starts here.
    pub async fn create_offer(&self, key: SessionKey) -> Result<SessionDescription, MediaError> {
        let peer = self.ensure_peer(key).await?;
        self.attach_tracks(key, &peer).await?;
        let offer = peer.create_offer().await?;
        self.with_slot(key, |_| ())?;
        peer.set_local_description(offer.clone()).await?;
        self.with_slot(key, |_| ())?;
        tracing::debug!(target = "media", session = key, "local offer applied");
        Ok(offer)
    }

    pub async fn create_answer_from_offer(
        &self,
        key: SessionKey,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        if offer.kind != SdpKind::Offer {
            return Err(MediaError::Negotiation("expected a remote offer".into()));
        }
        let peer = self.ensure_peer(key).await?;
        self.attach_tracks(key, &peer).await?;
        self.apply_remote_description(key, offer).await?;
        let answer = peer.create_answer().await?;
        self.with_slot(key, |_| ())?;
        peer.set_local_description(answer.clone()).await?;
        self.with_slot(key, |_| ())?;
        tracing::debug!(target = "media", session = key, "local answer applied");
        Ok(answer)
    }

    /// Applying the same description twice is a no-op. Candidates queued
    /// before it are applied afterwards in arrival order.
    pub async fn apply_remote_description(
        &self,
        key: SessionKey,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let peer = self.ensure_peer(key).await?;
        let already = self.with_slot(key, |slot| {
            slot.remote_description.as_ref() == Some(&description)
        })?;
        if already {
            return Ok(());
        }
        peer.set_remote_description(description.clone()).await?;
        self.with_slot(key, |slot| slot.remote_description = Some(description))?;
        self.flush_candidates(key, &peer).await
    }

    async fn flush_candidates(
        &self,
        key: SessionKey,
        peer: &Arc<dyn PeerConnection>,
    ) -> Result<(), MediaError> {
        let mut flushed = 0usize;
        loop {
            let next = self.with_slot(key, |slot| match slot.candidates.pending.pop_front() {
                Some(candidate) => Some(candidate),
                None => {
                    slot.candidates.remote_applied = true;
                    None
                }
            })?;
            let Some(candidate) = next else { break };
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                tracing::warn!(target = "media", session = key, "queued candidate rejected: {err}");
            }
            flushed += 1;
        }
        if flushed > 0 {
            tracing::debug!(target = "media", session = key, flushed, "flushed queued candidates");
        }
        Ok(())
    }

    /// Duplicates are ignored. Before the remote description is applied the
    /// candidate waits in a FIFO queue.
    pub async fn apply_remote_candidate(
        &self,
        key: SessionKey,
        candidate: IceCandidate,
    ) -> Result<(), MediaError> {
        self.admit(key).await?;
        let (admission, peer) = self.with_slot(key, |slot| {
            let admission = slot.candidates.admit(&candidate, slot.peer.is_some());
            (admission, slot.peer.clone())
        })?;
        match (admission, peer) {
            (Admission::ApplyNow, Some(peer)) => peer.add_ice_candidate(candidate).await,
            (Admission::Duplicate, _) => {
                tracing::trace!(target = "media", session = key, "duplicate remote candidate");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Releases the session `key` and anything older. Returns false when
    /// there was nothing left to release.
    pub async fn teardown_session(&self, key: SessionKey) -> bool {
        self.retired.fetch_max(key, Ordering::SeqCst);
        let taken = {
            let mut slot = self.slot.lock();
            match slot.as_ref().map(|current| current.key) {
                Some(current) if current <= key => slot.take(),
                _ => None,
            }
        };
        match taken {
            Some(slot) => {
                release(slot).await;
                true
            }
            None => false,
        }
    }

    /// Releases whatever session is current.
    pub async fn teardown(&self) -> bool {
        let taken = self.slot.lock().take();
        match taken {
            Some(slot) => {
                self.retired.fetch_max(slot.key, Ordering::SeqCst);
                release(slot).await;
                true
            }
            None => false,
        }
    }

    /// Enables or disables every local track of `kind`. Returns true when a
    /// track changed.
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let slot = self.slot.lock();
        let Some(local) = slot.as_ref().and_then(|slot| slot.local.as_ref()) else {
            return false;
        };
        local
            .tracks()
            .iter()
            .filter(|track| track.kind() == kind)
            .fold(false, |changed, track| track.set_enabled(enabled) || changed)
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        self.slot.lock().as_ref().and_then(|slot| slot.local.clone())
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.slot
            .lock()
            .as_ref()
            .map(|slot| slot.remote.clone())
            .filter(|remote| !remote.is_empty())
    }
}

async fn close_quietly(key: SessionKey, peer: &dyn PeerConnection) {
    if let Err(err) = peer.close().await {
        tracing::warn!(target = "media", session = key, "peer connection close failed: {err}");
    }
}

async fn release(slot: MediaSlot) {
    let stopped = slot.local.as_ref().map(LocalStream::stop).unwrap_or(0);
    if let Some(peer) = &slot.peer {
        close_quietly(slot.key, peer.as_ref()).await;
    }
    tracing::debug!(
        target = "media",
        session = slot.key,
        stopped_tracks = stopped,
        "media session released"
    );
}
