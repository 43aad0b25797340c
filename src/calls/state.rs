//! Call state machine implementation.

use crate::store::CallRecord;
use crate::types::call::{CallId, ParticipantId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which side of the offer/answer exchange this client plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// We hung up.
    LocalHangup,
    /// The counterpart hung up.
    RemoteHangup,
    MediaAccessDenied,
    ChannelUnavailable,
    ConnectivityLost,
    RingTimeout,
    NegotiationTimeout,
    /// Setting up the peer connection failed.
    Failed,
    /// The manager was shut down with the call still live.
    Shutdown,
}

/// Current state of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// Outgoing call: record created, waiting for the receiver.
    Calling { since: DateTime<Utc> },
    /// Incoming call: ringing locally.
    Ringing { since: DateTime<Utc> },
    /// Call accepted, negotiating the peer connection.
    Connecting {
        accepted_at: DateTime<Utc>,
        role: Role,
    },
    /// Media flowing.
    Active {
        connected_at: DateTime<Utc>,
        audio_muted: bool,
        video_off: bool,
        screen_sharing: bool,
    },
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
    Declined {
        at: DateTime<Utc>,
        by_remote: bool,
    },
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_calling(&self) -> bool {
        matches!(self, Self::Calling { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. } | Self::Declined { .. })
    }

    pub fn can_accept(&self) -> bool {
        self.is_ringing()
    }

    pub fn can_decline(&self) -> bool {
        self.is_ringing()
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Connecting { role, .. } => Some(*role),
            _ => None,
        }
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    Dial,
    IncomingOffer,
    LocalAccepted,
    RemoteAccepted,
    LocalDeclined,
    RemoteDeclined,
    MediaConnected { audio_muted: bool, video_off: bool },
    Ended { reason: EndReason },
    AudioMuteChanged { muted: bool },
    VideoStateChanged { off: bool },
    ScreenShareChanged { sharing: bool },
}

/// Full call information tracked by one client.
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub record: CallRecord,
    /// The other participant.
    pub remote: ParticipantId,
    pub direction: CallDirection,
    pub state: CallState,
    /// Role fixed once the call is accepted.
    pub role: Option<Role>,
    /// Set once this client has written (or observed) a terminal status, so
    /// the record is never written twice.
    #[serde(skip)]
    pub record_closed: bool,
}

impl CallInfo {
    pub fn new_outgoing(record: CallRecord) -> Self {
        Self {
            remote: record.receiver_id.clone(),
            record,
            direction: CallDirection::Outgoing,
            state: CallState::Idle,
            role: None,
            record_closed: false,
        }
    }

    pub fn new_incoming(record: CallRecord) -> Self {
        Self {
            remote: record.caller_id.clone(),
            record,
            direction: CallDirection::Incoming,
            state: CallState::Idle,
            role: None,
            record_closed: false,
        }
    }

    pub fn id(&self) -> &CallId {
        &self.record.id
    }

    pub fn is_initiator(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let now = Utc::now();
        let new_state = match (&self.state, transition) {
            (CallState::Idle, CallTransition::Dial) if self.is_initiator() => {
                CallState::Calling { since: now }
            }
            (CallState::Idle, CallTransition::IncomingOffer) if !self.is_initiator() => {
                CallState::Ringing { since: now }
            }
            (CallState::Calling { .. }, CallTransition::RemoteAccepted) => {
                self.role = Some(Role::Offerer);
                CallState::Connecting {
                    accepted_at: now,
                    role: Role::Offerer,
                }
            }
            (CallState::Ringing { .. }, CallTransition::LocalAccepted) => {
                self.role = Some(Role::Answerer);
                CallState::Connecting {
                    accepted_at: now,
                    role: Role::Answerer,
                }
            }
            (CallState::Calling { .. }, CallTransition::RemoteDeclined) => CallState::Declined {
                at: now,
                by_remote: true,
            },
            (CallState::Ringing { .. }, CallTransition::LocalDeclined) => CallState::Declined {
                at: now,
                by_remote: false,
            },
            (
                CallState::Connecting { .. },
                CallTransition::MediaConnected {
                    audio_muted,
                    video_off,
                },
            ) => CallState::Active {
                connected_at: now,
                audio_muted,
                video_off,
                screen_sharing: false,
            },
            (CallState::Active { connected_at, .. }, CallTransition::Ended { reason }) => {
                let duration = now.signed_duration_since(*connected_at).num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: now,
                    duration_secs: Some(duration),
                }
            }
            (
                CallState::Calling { .. } | CallState::Ringing { .. } | CallState::Connecting { .. },
                CallTransition::Ended { reason },
            ) => CallState::Ended {
                reason,
                ended_at: now,
                duration_secs: None,
            },
            (
                CallState::Active {
                    connected_at,
                    video_off,
                    screen_sharing,
                    ..
                },
                CallTransition::AudioMuteChanged { muted },
            ) => CallState::Active {
                connected_at: *connected_at,
                audio_muted: muted,
                video_off: *video_off,
                screen_sharing: *screen_sharing,
            },
            (
                CallState::Active {
                    connected_at,
                    audio_muted,
                    screen_sharing,
                    ..
                },
                CallTransition::VideoStateChanged { off },
            ) => CallState::Active {
                connected_at: *connected_at,
                audio_muted: *audio_muted,
                video_off: off,
                screen_sharing: *screen_sharing,
            },
            (
                CallState::Active {
                    connected_at,
                    audio_muted,
                    video_off,
                    ..
                },
                CallTransition::ScreenShareChanged { sharing },
            ) => CallState::Active {
                connected_at: *connected_at,
                audio_muted: *audio_muted,
                video_off: *video_off,
                screen_sharing: sharing,
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CallStatus;

    fn record() -> CallRecord {
        CallRecord {
            id: CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            conversation_id: "conv-1".to_string(),
            caller_id: "alice".into(),
            receiver_id: "bob".into(),
            status: CallStatus::Ringing,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        }
    }

    fn make_outgoing_call() -> CallInfo {
        let mut call = CallInfo::new_outgoing(record());
        call.apply_transition(CallTransition::Dial).unwrap();
        call
    }

    fn make_incoming_call() -> CallInfo {
        let mut call = CallInfo::new_incoming(record());
        call.apply_transition(CallTransition::IncomingOffer).unwrap();
        call
    }

    fn connected() -> CallTransition {
        CallTransition::MediaConnected {
            audio_muted: false,
            video_off: false,
        }
    }

    /// Flow: Calling → Connecting → Active → Ended
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = make_outgoing_call();
        assert!(call.state.is_calling());
        assert_eq!(call.remote, ParticipantId::from("bob"));

        call.apply_transition(CallTransition::RemoteAccepted).unwrap();
        assert_eq!(call.state.role(), Some(Role::Offerer));

        call.apply_transition(connected()).unwrap();
        assert!(call.state.is_active());

        call.apply_transition(CallTransition::Ended {
            reason: EndReason::LocalHangup,
        })
        .unwrap();
        assert!(call.state.is_terminal());

        if let CallState::Ended { duration_secs, .. } = call.state {
            assert!(duration_secs.is_some());
        }
    }

    /// Flow: Ringing → Connecting → Active
    #[test]
    fn test_incoming_call_flow() {
        let mut call = make_incoming_call();
        assert!(call.state.can_accept());
        assert_eq!(call.remote, ParticipantId::from("alice"));

        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        assert_eq!(call.role, Some(Role::Answerer));

        call.apply_transition(connected()).unwrap();
        assert!(call.state.is_active());
    }

    #[test]
    fn test_declined_only_reachable_before_accept() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::LocalDeclined).unwrap();
        assert!(matches!(
            call.state,
            CallState::Declined {
                by_remote: false,
                ..
            }
        ));

        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::RemoteAccepted).unwrap();
        assert!(call.apply_transition(CallTransition::RemoteDeclined).is_err());
    }

    #[test]
    fn test_wrong_direction_is_rejected() {
        let mut call = CallInfo::new_outgoing(record());
        assert!(call.apply_transition(CallTransition::IncomingOffer).is_err());

        let mut call = CallInfo::new_incoming(record());
        assert!(call.apply_transition(CallTransition::Dial).is_err());
    }

    #[test]
    fn test_end_before_connect_has_no_duration() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::Ended {
            reason: EndReason::RingTimeout,
        })
        .unwrap();

        assert!(matches!(
            call.state,
            CallState::Ended {
                reason: EndReason::RingTimeout,
                duration_secs: None,
                ..
            }
        ));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::LocalDeclined).unwrap();

        let err = call
            .apply_transition(CallTransition::Ended {
                reason: EndReason::LocalHangup,
            })
            .unwrap_err();
        assert!(err.to_string().contains("Declined"));
        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());
    }

    #[test]
    fn test_media_toggles_only_while_active() {
        let mut call = make_outgoing_call();
        assert!(
            call.apply_transition(CallTransition::AudioMuteChanged { muted: true })
                .is_err()
        );

        call.apply_transition(CallTransition::RemoteAccepted).unwrap();
        call.apply_transition(connected()).unwrap();
        call.apply_transition(CallTransition::AudioMuteChanged { muted: true })
            .unwrap();
        call.apply_transition(CallTransition::ScreenShareChanged { sharing: true })
            .unwrap();

        assert!(matches!(
            call.state,
            CallState::Active {
                audio_muted: true,
                video_off: false,
                screen_sharing: true,
                ..
            }
        ));
    }
}
