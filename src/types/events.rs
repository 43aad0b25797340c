use crate::calls::{EndReason, MediaStream, Role};
use crate::store::CallRecord;
use crate::types::call::{CallId, ParticipantId};
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Call lifecycle
    (incoming_call, Arc<IncomingCall>),
    (call_accepted, Arc<CallAccepted>),
    (call_connected, Arc<CallConnected>),
    (call_declined, Arc<CallDeclined>),
    (call_ended, Arc<CallEnded>),

    // Media
    (remote_stream, Arc<RemoteStream>),

    // User-visible messages
    (notice, Arc<Notice>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Another participant is calling us.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub record: CallRecord,
}

/// The record moved to `accepted`; negotiation is starting.
#[derive(Debug, Clone)]
pub struct CallAccepted {
    pub call_id: CallId,
    pub role: Role,
}

/// Media is flowing.
#[derive(Debug, Clone)]
pub struct CallConnected {
    pub call_id: CallId,
}

#[derive(Debug, Clone)]
pub struct CallDeclined {
    pub call_id: CallId,
    /// True when the counterpart declined, false when we did.
    pub by_remote: bool,
}

#[derive(Debug, Clone)]
pub struct CallEnded {
    pub call_id: CallId,
    pub reason: EndReason,
}

/// A remote stream arrived for the current call's render target.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub call_id: CallId,
    pub stream: MediaStream,
}

/// Short message meant to be shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Calling,
    CallDeclined,
    CallEnded,
    /// An incoming call was declined because we were already in one.
    Busy(ParticipantId),
    MediaAccessDenied,
    ChannelUnavailable,
    CallFailed(String),
    ScreenShareFailed(String),
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Calling => f.write_str("Calling..."),
            Self::CallDeclined => f.write_str("Call declined"),
            Self::CallEnded => f.write_str("Call ended"),
            Self::Busy(caller) => write!(f, "Missed call from {} while busy", caller),
            Self::MediaAccessDenied => f.write_str("Camera/Mic access denied"),
            Self::ChannelUnavailable => f.write_str("Could not join the call"),
            Self::CallFailed(reason) => write!(f, "Call failed: {}", reason),
            Self::ScreenShareFailed(reason) => write!(f, "Screen sharing failed: {}", reason),
        }
    }
}
