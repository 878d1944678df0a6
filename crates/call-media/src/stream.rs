use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{MediaError, to_negotiation_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

type StopHook = Box<dyn Fn(TrackKind) + Send + Sync>;

/// A captured track. Stopping it releases the underlying device.
pub struct LocalTrack {
    kind: TrackKind,
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc: Option<Arc<TrackLocalStaticSample>>,
    on_stop: Option<StopHook>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtc: None,
            on_stop: None,
        }
    }

    pub fn with_rtc(mut self, track: Arc<TrackLocalStaticSample>) -> Self {
        self.rtc = Some(track);
        self
    }

    /// Runs `hook` the first time the track is stopped.
    pub fn on_stop(mut self, hook: impl Fn(TrackKind) + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rtc(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.rtc.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns true when the flag actually changed.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst) != enabled
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Returns true only for the call that stopped the track.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(hook) = &self.on_stop {
            hook(self.kind);
        }
        true
    }

    /// Pushes one encoded frame. Disabled or stopped tracks drop it.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), MediaError> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }
        let Some(rtc) = &self.rtc else {
            return Ok(());
        };
        rtc.write_sample(&Sample {
            data,
            duration,
            ..Default::default()
        })
        .await
        .map_err(to_negotiation_error)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Local capture handle: one audio track and, for video calls, one video track.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks: tracks.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    pub fn has_video(&self) -> bool {
        self.track(TrackKind::Video).is_some()
    }

    /// Stops every track. Returns how many were still live.
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|track| track.stop()).count()
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|track| track.is_stopped())
    }
}

#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub id: String,
    pub stream_id: String,
    rtc: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            stream_id: stream_id.into(),
            rtc: None,
        }
    }

    pub fn from_rtc(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        Self {
            kind,
            id: track.id(),
            stream_id: track.stream_id(),
            rtc: Some(track),
        }
    }

    /// The native track for reading RTP, when backed by a real connection.
    pub fn rtc(&self) -> Option<&Arc<TrackRemote>> {
        self.rtc.as_ref()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Composite of every track the remote peer has sent for one session.
#[derive(Clone, Default)]
pub struct RemoteStream {
    tracks: Arc<Mutex<Vec<RemoteTrack>>>,
}

impl RemoteStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `track` unless one with the same id is already present.
    pub fn add(&self, track: RemoteTrack) -> bool {
        let mut tracks = self.tracks.lock();
        if tracks.iter().any(|existing| existing.id == track.id) {
            return false;
        }
        tracks.push(track);
        true
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.lock().clone()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.lock().iter().any(|track| track.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }

    pub fn same_stream(&self, other: &RemoteStream) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tracks.lock().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn stop_hook_fires_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stops);
        let stream = LocalStream::new(
            "local",
            vec![LocalTrack::new(TrackKind::Audio, "mic").on_stop(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })],
        );
        assert_eq!(stream.stop(), 1);
        assert_eq!(stream.stop(), 0);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(stream.is_stopped());
    }

    #[test]
    fn set_enabled_reports_changes() {
        let track = LocalTrack::new(TrackKind::Video, "cam");
        assert!(!track.set_enabled(true));
        assert!(track.set_enabled(false));
        assert!(!track.is_enabled());
    }

    #[test]
    fn remote_stream_ignores_repeated_tracks() {
        let stream = RemoteStream::new();
        assert!(stream.add(RemoteTrack::new(TrackKind::Audio, "a", "s")));
        assert!(!stream.add(RemoteTrack::new(TrackKind::Audio, "a", "s")));
        assert!(stream.add(RemoteTrack::new(TrackKind::Video, "v", "s")));
        assert!(stream.has_kind(TrackKind::Video));
        assert_eq!(stream.tracks().len(), 2);
    }
}
