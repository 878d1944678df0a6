//! Relay-backed signaling for one-to-one calls: the envelope format, the
//! transport seam and its websocket and in-process implementations.

pub mod auth;
pub mod envelope;
pub mod error;
pub mod local;
pub mod protocol;
pub mod relay;
pub mod transport;
pub mod websocket;

pub use auth::{TokenError, mint_token, verify_token};
pub use envelope::{
    CallType, Envelope, IceCandidate, RelayRequest, RoomId, SdpKind, SessionDescription, Signal,
    SignalType, UserId,
};
pub use error::{EnvelopeError, TransportError};
pub use local::{LocalRelay, LocalTransport};
pub use protocol::{ClientMessage, ServerMessage};
pub use relay::{Delivery, RoomDirectory, RouteError, UNAVAILABLE_REASON};
pub use transport::{RelayContext, SignalingTransport, TransportEvent};
pub use websocket::{WebSocketConfig, WebSocketTransport, relay_websocket_url};
