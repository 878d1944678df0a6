use std::sync::Arc;

use async_trait::async_trait;
use call_signaling::CallType;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::AcquisitionError;
use crate::stream::{LocalStream, LocalTrack, TrackKind};

/// Source of local capture handles.
#[async_trait]
pub trait DeviceFacility: Send + Sync {
    /// Audio for every call, plus video for video calls.
    async fn acquire(&self, call_type: CallType) -> Result<LocalStream, AcquisitionError>;
}

/// Sample-fed tracks with no hardware behind them. The application writes
/// encoded frames into the tracks it gets back.
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    stream_label: String,
}

impl SyntheticDevices {
    pub fn new(stream_label: impl Into<String>) -> Self {
        Self {
            stream_label: stream_label.into(),
        }
    }

    fn track(&self, kind: TrackKind) -> LocalTrack {
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            self.stream_label.clone(),
        ));
        LocalTrack::new(kind, id).with_rtc(rtc)
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new("call-local")
    }
}

#[async_trait]
impl DeviceFacility for SyntheticDevices {
    async fn acquire(&self, call_type: CallType) -> Result<LocalStream, AcquisitionError> {
        let mut tracks = vec![self.track(TrackKind::Audio)];
        if call_type.has_video() {
            tracks.push(self.track(TrackKind::Video));
        }
        tracing::debug!(
            target = "media",
            call_type = %call_type,
            tracks = tracks.len(),
            "acquired synthetic capture"
        );
        Ok(LocalStream::new(self.stream_label.clone(), tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn video_calls_get_both_tracks() {
        let devices = SyntheticDevices::default();
        let audio = devices.acquire(CallType::Audio).await.expect("audio");
        assert_eq!(audio.tracks().len(), 1);
        assert!(!audio.has_video());

        let video = devices.acquire(CallType::Video).await.expect("video");
        assert!(video.has_video());
        assert!(video.track(TrackKind::Audio).is_some_and(|track| track.rtc().is_some()));
    }
}
