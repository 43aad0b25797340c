//! Call-related error types.

use super::media::MediaError;
use super::peer::PeerError;
use super::signaling::SignalingError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("already in a call")]
    AlreadyInCall,

    #[error("media access denied: {0}")]
    PermissionDenied(String),

    #[error("negotiation stale: {0}")]
    NegotiationStale(String),

    #[error("connectivity lost")]
    ConnectivityLost,

    #[error("signaling channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("invalid call state: {0}")]
    InvalidState(&'static str),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("media error: {0}")]
    Media(MediaError),

    #[error("peer connection error: {0}")]
    Peer(#[from] PeerError),

    #[error("call record error: {0}")]
    Store(#[from] StoreError),

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("call was torn down before the request completed")]
    Cancelled,

    #[error("call manager is not running")]
    ManagerStopped,
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(msg) => Self::PermissionDenied(msg),
            other => Self::Media(other),
        }
    }
}
