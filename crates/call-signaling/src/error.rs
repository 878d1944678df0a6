use thiserror::Error;

use crate::envelope::SignalType;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("relay refused join: {0}")]
    JoinRejected(String),
    #[error("timed out waiting for relay")]
    Timeout,
    #[error("inbound envelope stream already taken")]
    AlreadySubscribed,
    #[error("failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("envelope is missing senderId")]
    MissingSender,
    #[error("{kind:?} envelope is missing payload field {field}")]
    MissingField {
        kind: SignalType,
        field: &'static str,
    },
}
