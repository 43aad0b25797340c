use crate::channel::{ChannelError, ChannelProvider, SignalingChannel};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

// Frames buffered per topic before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 256;

/// In-process broadcast backend.
///
/// Topics are created on demand and shared by every handle opened with the
/// same name, so two managers in one process can signal each other through a
/// single hub. Frames are looped back to the sender's own subscriptions. A
/// topic is dropped once the last handle subscribed to it closes.
#[derive(Default)]
pub struct MemoryHub {
    topics: Arc<DashMap<String, broadcast::Sender<String>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent subscriptions fail, as if the backend were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live subscriptions on a topic across all handles.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.topics
            .get(name)
            .map(|t| t.receiver_count())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl ChannelProvider for MemoryHub {
    fn open(&self, name: &str) -> Arc<dyn SignalingChannel> {
        Arc::new(MemoryChannel {
            name: name.to_string(),
            unavailable: self.unavailable.clone(),
            topics: self.topics.clone(),
            closed: AtomicBool::new(false),
            forwarders: Mutex::new(Vec::new()),
        })
    }
}

struct MemoryChannel {
    name: String,
    unavailable: Arc<AtomicBool>,
    topics: Arc<DashMap<String, broadcast::Sender<String>>>,
    closed: AtomicBool,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryChannel {
    fn topic(&self) -> broadcast::Sender<String> {
        self.topics
            .entry(self.name.clone())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<String>, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ChannelError::Unavailable(
                self.name.clone(),
                "broadcast backend unreachable".to_string(),
            ));
        }

        let mut topic_rx = self.topic().subscribe();
        let (tx, rx) = mpsc::channel(TOPIC_CAPACITY);
        let name = self.name.clone();

        let forwarder = tokio::spawn(async move {
            loop {
                match topic_rx.recv().await {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Subscriber on {} lagged, skipped {} frames", name, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.forwarders.lock().await.push(forwarder);

        debug!("Subscribed to {}", self.name);
        Ok(rx)
    }

    async fn send(&self, frame: String) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        // No topic or no subscribers means nobody is listening; that's not an error.
        if let Some(topic) = self.topics.get(&self.name) {
            let _ = topic.send(frame);
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let forwarders: Vec<JoinHandle<()>> = self.forwarders.lock().await.drain(..).collect();
        for forwarder in forwarders {
            forwarder.abort();
            // Resolves once the task, and its topic receiver, are dropped.
            let _ = forwarder.await;
        }
        if self
            .topics
            .remove_if(&self.name, |_, topic| topic.receiver_count() == 0)
            .is_some()
        {
            debug!("Dropped topic {}", self.name);
        }
        debug!("Left {}", self.name);
    }
}
