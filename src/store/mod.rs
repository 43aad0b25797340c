pub mod error;
pub mod memory;
pub mod traits;

pub use error::StoreError;
pub use memory::MemoryCallStore;
pub use traits::CallRecordStore;

use crate::types::call::{CallId, ParticipantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted status of a call, shared by both participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Declined,
    Ended,
}

impl CallStatus {
    /// Terminal records are immutable.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Declined | Self::Ended)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub conversation_id: String,
    pub caller_id: ParticipantId,
    pub receiver_id: ParticipantId,
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn involves(&self, participant: &ParticipantId) -> bool {
        &self.caller_id == participant || &self.receiver_id == participant
    }

    /// Both participants, in a stable order regardless of who called whom.
    pub fn pair_key(&self) -> (ParticipantId, ParticipantId) {
        if self.caller_id <= self.receiver_id {
            (self.caller_id.clone(), self.receiver_id.clone())
        } else {
            (self.receiver_id.clone(), self.caller_id.clone())
        }
    }
}

/// Fields supplied by the caller when creating a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCallRecord {
    pub conversation_id: String,
    pub caller_id: ParticipantId,
    pub receiver_id: ParticipantId,
}

/// A status change, with the timestamps that accompany it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn accepted() -> Self {
        Self {
            status: CallStatus::Accepted,
            started_at: Some(Utc::now()),
            ended_at: None,
        }
    }

    pub fn declined() -> Self {
        Self {
            status: CallStatus::Declined,
            started_at: None,
            ended_at: Some(Utc::now()),
        }
    }

    pub fn ended() -> Self {
        Self {
            status: CallStatus::Ended,
            started_at: None,
            ended_at: Some(Utc::now()),
        }
    }
}

/// Change notification delivered to subscribed participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    Inserted(CallRecord),
    Updated(CallRecord),
}

impl RecordEvent {
    pub fn record(&self) -> &CallRecord {
        match self {
            Self::Inserted(record) | Self::Updated(record) => record,
        }
    }
}
