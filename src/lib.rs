// Identifiers and UI notifications
pub mod types {
    pub mod call;
    pub mod events;

    pub use call::{CallId, ParticipantId};
}

// Collaborators the call layer depends on
pub mod channel;
pub mod store;

// Call signaling and peer-connection lifecycle
pub mod calls;

pub use calls::{CallError, CallManager, CallManagerBuilder, CallManagerConfig, CallSnapshot};
pub use types::{CallId, ParticipantId};
