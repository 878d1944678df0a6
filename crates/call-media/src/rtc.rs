//! webrtc-rs backed peer connections.

use std::sync::Arc;

use async_trait::async_trait;
use call_signaling::{IceCandidate, SdpKind, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{MediaError, to_negotiation_error};
use crate::peer::{ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvents};
use crate::stream::{LocalTrack, RemoteTrack};

/// A STUN or TURN server handed to every new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

fn build_api() -> Result<API, MediaError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_negotiation_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_negotiation_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct RtcPeerConnectionFactory {
    api: API,
    ice_servers: Vec<IceServer>,
}

impl RtcPeerConnectionFactory {
    pub fn new(ice_servers: Vec<IceServer>) -> Result<Self, MediaError> {
        Ok(Self {
            api: build_api()?,
            ice_servers,
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(&self, events: PeerEvents) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(to_negotiation_error)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::debug!(target = "media", session = events.session(), "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(err) => {
                        tracing::warn!(target = "media", "failed to serialize local candidate: {err}")
                    }
                }
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                track_events.remote_track(RemoteTrack::from_rtc(track));
                Box::pin(async {})
            },
        ));

        let state_events = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            state_events.state(connection_state(state));
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeerConnection { pc }))
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionState::New,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(to_negotiation_error)
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, MediaError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer | RTCSdpType::Pranswer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(MediaError::Negotiation(format!(
            "unexpected local description type {other}"
        ))),
    }
}

struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), MediaError> {
        let rtc = track.rtc().cloned().ok_or_else(|| {
            MediaError::Negotiation(format!("{} track {} has no sample sink", track.kind(), track.id()))
        })?;
        let sender = self
            .pc
            .add_track(rtc as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_negotiation_error)?;
        // RTCP has to be drained for interceptors such as NACK to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self.pc.create_offer(None).await.map_err(to_negotiation_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await.map_err(to_negotiation_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(to_negotiation_error)
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.pc
            .close()
            .await
            .map_err(|err| MediaError::ConnectionFailure(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_state_maps_through() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
    }

    #[test]
    fn ice_servers_reach_configuration() {
        let factory = RtcPeerConnectionFactory::new(vec![IceServer::new("stun:stun.l.google.com:19302")])
            .expect("factory");
        let config = factory.configuration();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
    }
}
