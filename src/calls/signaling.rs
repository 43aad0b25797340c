//! Signaling frames exchanged over a call's channel.
//!
//! Every frame is a JSON object tagged by `type`:
//!
//! | type            | payload                                |
//! |-----------------|----------------------------------------|
//! | `ready`         | -                                      |
//! | `offer`         | `description`                          |
//! | `answer`        | `description`                          |
//! | `ice-candidate` | `callId`, `candidate`                  |
//!
//! and carries `from` (sender) and `to` (intended receiver). Unknown types
//! fail to decode rather than being skipped.

use crate::types::call::{CallId, ParticipantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to decode signaling frame: {0}")]
    Decode(String),

    #[error("failed to encode signaling frame: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An opaque session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Sender is subscribed and can receive frames.
    Ready {
        from: ParticipantId,
        to: ParticipantId,
    },
    Offer {
        from: ParticipantId,
        to: ParticipantId,
        description: SessionDescription,
    },
    Answer {
        from: ParticipantId,
        to: ParticipantId,
        description: SessionDescription,
    },
    IceCandidate {
        from: ParticipantId,
        to: ParticipantId,
        #[serde(rename = "callId")]
        call_id: CallId,
        candidate: IceCandidate,
    },
}

impl SignalingMessage {
    pub fn decode(frame: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(frame).map_err(|e| SignalingError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Encode(e.to_string()))
    }

    pub fn sender(&self) -> &ParticipantId {
        match self {
            Self::Ready { from, .. }
            | Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::IceCandidate { from, .. } => from,
        }
    }

    pub fn target(&self) -> &ParticipantId {
        match self {
            Self::Ready { to, .. }
            | Self::Offer { to, .. }
            | Self::Answer { to, .. }
            | Self::IceCandidate { to, .. } => to,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// True for frames another participant addressed to `local`. Loopback
    /// copies of our own frames are excluded.
    pub fn is_for(&self, local: &ParticipantId) -> bool {
        self.sender() != local && self.target() == local
    }
}
