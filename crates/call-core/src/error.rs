use call_media::MediaError;
use call_signaling::TransportError;
use thiserror::Error;

use crate::session::CallStatus;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("signaling transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("media error: {0}")]
    Media(#[from] MediaError),
    #[error("{intent} is not permitted while {status}")]
    NotPermitted {
        intent: &'static str,
        status: CallStatus,
    },
    #[error("a call is already in progress")]
    Busy,
    #[error("call engine has shut down")]
    EngineClosed,
    #[error("invalid settings: {0}")]
    Settings(#[from] config::ConfigError),
}
