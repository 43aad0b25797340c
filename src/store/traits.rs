use crate::store::error::Result;
use crate::store::{CallRecord, NewCallRecord, RecordEvent, StatusUpdate};
use crate::types::call::{CallId, ParticipantId};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Durable, shared store of call records.
///
/// This is the only source of truth for call existence shared between
/// participants. Implementations back it with whatever persistence the chat
/// client already uses and fan out changes to interested participants.
#[async_trait]
pub trait CallRecordStore: Send + Sync {
    /// Persist a new record with status `ringing`.
    async fn create(&self, record: NewCallRecord) -> Result<CallRecord>;

    /// Apply a status transition. Terminal records reject further updates.
    async fn update(&self, id: &CallId, update: StatusUpdate) -> Result<CallRecord>;

    /// Subscribe to inserts and updates of records where `participant` is
    /// the caller or the receiver. Every change is delivered, in order.
    async fn subscribe(
        &self,
        participant: &ParticipantId,
    ) -> Result<mpsc::UnboundedReceiver<RecordEvent>>;
}
