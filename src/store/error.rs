use crate::store::CallStatus;
use crate::types::call::CallId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("call record not found: {0}")]
    NotFound(CallId),

    #[error("call record {id} is already {status}")]
    Terminal { id: CallId, status: CallStatus },

    #[error("a live call already exists between these participants: {0}")]
    LiveCallExists(CallId),

    #[error("record store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
