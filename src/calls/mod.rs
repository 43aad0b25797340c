//! Call signaling and peer-connection lifecycle.
//!
//! # Architecture
//!
//! - [`CallInfo`] & [`CallState`]: the call state machine
//! - [`SignalingMessage`]: frames exchanged over a per-call channel
//! - [`CandidateBuffer`]: remote candidates held until the remote
//!   description is applied
//! - [`PeerSession`] & [`SessionTable`]: one peer connection, its local
//!   media and channel membership per remote participant
//! - [`CallManager`]: handle to the task that reacts to the record store,
//!   the channel and the peer connection
//!
//! # Flow
//!
//! The caller creates a `ringing` record. The receiver sees the insert and
//! rings; answering acquires media and marks the record `accepted`. The
//! caller sees the update and becomes the offerer. Both join `call-<id>`,
//! announce themselves with `ready`, and the offerer sends its offer once the
//! answerer is known to be listening. Either side ending or declining writes
//! the record once; the other side tears down when it sees the change.

mod actor;
mod candidates;
mod error;
mod manager;
pub mod media;
pub mod peer;
#[cfg(feature = "webrtc")]
pub mod rtc;
mod session;
pub mod signaling;
mod state;

pub use candidates::CandidateBuffer;
pub use error::CallError;
pub use manager::{BusyPolicy, CallManager, CallManagerBuilder, CallManagerConfig, CallSnapshot};
pub use media::{
    FacingMode, MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack, TrackKind,
    VideoConstraints,
};
pub use peer::{
    IceConnectionState, IceServer, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent,
    RtcConfig, SignalingState,
};
pub use session::{PeerSession, SessionTable};
pub use signaling::{IceCandidate, SdpType, SessionDescription, SignalingError, SignalingMessage};
pub use state::{
    CallDirection, CallInfo, CallState, CallTransition, EndReason, InvalidTransition, Role,
};
