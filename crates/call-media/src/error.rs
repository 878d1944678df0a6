use thiserror::Error;

use crate::stream::TrackKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquisitionError {
    #[error("permission to use capture devices was denied")]
    PermissionDenied,
    #[error("no {0} capture device available")]
    NoDevice(TrackKind),
    #[error("{0} capture device is busy")]
    DeviceBusy(TrackKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("media connection failed: {0}")]
    ConnectionFailure(String),
    #[error("media session was torn down")]
    Cancelled,
}

pub(crate) fn to_negotiation_error<E: std::fmt::Display>(err: E) -> MediaError {
    MediaError::Negotiation(err.to_string())
}
