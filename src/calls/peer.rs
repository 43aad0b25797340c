//! Peer connection abstraction.
//!
//! Modeled on the browser's `RTCPeerConnection`: the call layer drives the
//! offer/answer exchange through [`PeerConnection`], and the connection
//! reports discovered candidates, remote tracks and ICE state changes as
//! [`PeerEvent`]s on the channel handed to its factory.

use super::media::{MediaStream, MediaTrack};
use super::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("operation not valid in signaling state {0:?}")]
    InvalidState(SignalingState),

    #[error("peer connection is closed")]
    Closed,

    #[error("peer connection backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be sent to the peer.
    IceCandidate(IceCandidate),
    /// A remote stream arrived.
    Track(MediaStream),
    IceConnectionState(IceConnectionState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<MediaTrack>, stream_id: &str) -> Result<(), PeerError>;

    /// Swap the outbound video track without renegotiating.
    async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, description: SessionDescription)
    -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn has_remote_description(&self) -> bool;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &RtcConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
