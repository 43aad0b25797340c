//! Publish/subscribe transport used for call signaling.
//!
//! A channel is a named topic. Frames sent on it are delivered to every
//! member subscribed at the time of sending, possibly including the sender
//! itself. Ordering is only guaranteed per sender.

pub mod memory;
pub mod registry;

pub use memory::MemoryHub;
pub use registry::{ChannelLease, ChannelRegistry};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel {0} unavailable: {1}")]
    Unavailable(String, String),

    #[error("channel {0} is closed")]
    Closed(String),
}

/// One named topic on the broadcast backend.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Join the topic. Resolves once the subscription is confirmed.
    async fn subscribe(&self) -> Result<mpsc::Receiver<String>, ChannelError>;

    async fn send(&self, frame: String) -> Result<(), ChannelError>;

    /// Leave the topic and drop every subscription made through this handle.
    async fn close(&self);
}

/// Opens channel handles on a broadcast backend.
pub trait ChannelProvider: Send + Sync {
    fn open(&self, name: &str) -> Arc<dyn SignalingChannel>;
}
