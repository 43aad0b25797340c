use crate::store::error::{Result, StoreError};
use crate::store::traits::CallRecordStore;
use crate::store::{CallRecord, CallStatus, NewCallRecord, RecordEvent, StatusUpdate};
use crate::types::call::{CallId, ParticipantId};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use std::collections::HashMap;
use tokio::sync::{RwLock, mpsc};

/// In-process call record store.
///
/// Shared by every participant of a test or single-process deployment; each
/// participant subscribes with its own id and only sees records it is part of.
#[derive(Default)]
pub struct MemoryCallStore {
    records: RwLock<HashMap<CallId, CallRecord>>,
    subscribers: RwLock<Vec<(ParticipantId, mpsc::UnboundedSender<RecordEvent>)>>,
    writes: RwLock<Vec<(CallId, CallStatus)>>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &CallId) -> Option<CallRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Every status written through `create`/`update`, in order.
    pub async fn write_log(&self) -> Vec<(CallId, CallStatus)> {
        self.writes.read().await.clone()
    }

    async fn publish(&self, event: RecordEvent) {
        let targets: Vec<mpsc::UnboundedSender<RecordEvent>> = {
            let mut subscribers = self.subscribers.write().await;
            subscribers.retain(|(_, tx)| !tx.is_closed());
            subscribers
                .iter()
                .filter(|(participant, _)| event.record().involves(participant))
                .map(|(_, tx)| tx.clone())
                .collect()
        };

        for tx in targets {
            if tx.send(event.clone()).is_err() {
                debug!(
                    "Subscriber for call {} went away",
                    event.record().id
                );
            }
        }
    }
}

#[async_trait]
impl CallRecordStore for MemoryCallStore {
    async fn create(&self, new: NewCallRecord) -> Result<CallRecord> {
        let record = CallRecord {
            id: CallId::generate(),
            conversation_id: new.conversation_id,
            caller_id: new.caller_id,
            receiver_id: new.receiver_id,
            status: CallStatus::Ringing,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        };

        {
            let mut records = self.records.write().await;
            let pair = record.pair_key();
            if let Some(live) = records
                .values()
                .find(|r| !r.status.is_terminal() && r.pair_key() == pair)
            {
                return Err(StoreError::LiveCallExists(live.id.clone()));
            }
            records.insert(record.id.clone(), record.clone());
        }
        self.writes
            .write()
            .await
            .push((record.id.clone(), CallStatus::Ringing));

        self.publish(RecordEvent::Inserted(record.clone())).await;
        Ok(record)
    }

    async fn update(&self, id: &CallId, update: StatusUpdate) -> Result<CallRecord> {
        let updated = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;

            if record.status.is_terminal() {
                return Err(StoreError::Terminal {
                    id: id.clone(),
                    status: record.status,
                });
            }

            record.status = update.status;
            if update.started_at.is_some() {
                record.started_at = update.started_at;
            }
            if update.ended_at.is_some() {
                record.ended_at = update.ended_at;
            }
            record.clone()
        };
        self.writes.write().await.push((id.clone(), update.status));

        self.publish(RecordEvent::Updated(updated.clone())).await;
        Ok(updated)
    }

    async fn subscribe(
        &self,
        participant: &ParticipantId,
    ) -> Result<mpsc::UnboundedReceiver<RecordEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .push((participant.clone(), tx));
        Ok(rx)
    }
}
