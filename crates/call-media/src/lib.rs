//! Media session management for one-to-one calls: capture streams, the
//! peer connection, and ICE candidate ordering.

pub mod device;
pub mod error;
pub mod manager;
pub mod mock;
pub mod peer;
pub mod rtc;
pub mod stream;

pub use device::{DeviceFacility, SyntheticDevices};
pub use error::{AcquisitionError, MediaError};
pub use manager::MediaSessionManager;
pub use peer::{
    ConnectionState, MediaEvent, PeerConnection, PeerConnectionFactory, PeerEvents, SessionKey,
};
pub use rtc::{IceServer, RtcPeerConnectionFactory};
pub use stream::{LocalStream, LocalTrack, RemoteStream, RemoteTrack, TrackKind};
