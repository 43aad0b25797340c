use crate::channel::{ChannelProvider, SignalingChannel};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::debug;
use std::sync::Arc;

struct RegistryEntry {
    channel: Arc<dyn SignalingChannel>,
    refs: usize,
}

/// Process-wide owner of open channel handles.
///
/// Consumers `acquire` a lease on a named channel and hand it back with
/// `release`. The underlying handle is opened on first acquire and closed
/// when the last lease is released, so independent calls never share or
/// leak a handle.
pub struct ChannelRegistry {
    provider: Arc<dyn ChannelProvider>,
    entries: DashMap<String, RegistryEntry>,
}

/// A counted reference to an open channel.
pub struct ChannelLease {
    name: String,
    channel: Arc<dyn SignalingChannel>,
}

impl ChannelLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &Arc<dyn SignalingChannel> {
        &self.channel
    }
}

impl std::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("name", &self.name)
            .finish()
    }
}

impl ChannelRegistry {
    pub fn new(provider: Arc<dyn ChannelProvider>) -> Self {
        Self {
            provider,
            entries: DashMap::new(),
        }
    }

    pub fn acquire(&self, name: &str) -> ChannelLease {
        let mut entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| RegistryEntry {
                channel: self.provider.open(name),
                refs: 0,
            });
        entry.refs += 1;
        debug!("Acquired channel {} (refs={})", name, entry.refs);

        ChannelLease {
            name: name.to_string(),
            channel: entry.channel.clone(),
        }
    }

    pub async fn release(&self, lease: ChannelLease) {
        let closing = match self.entries.entry(lease.name.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.refs = entry.refs.saturating_sub(1);
                debug!("Released channel {} (refs={})", lease.name, entry.refs);
                if entry.refs == 0 {
                    Some(occupied.remove().channel)
                } else {
                    None
                }
            }
            Entry::Vacant(_) => None,
        };

        if let Some(channel) = closing {
            channel.close().await;
            debug!("Closed channel {}", lease.name);
        }
    }

    pub fn ref_count(&self, name: &str) -> usize {
        self.entries.get(name).map(|e| e.refs).unwrap_or(0)
    }

    pub fn open_channels(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryHub;

    fn registry() -> (Arc<MemoryHub>, ChannelRegistry) {
        let hub = Arc::new(MemoryHub::new());
        let registry = ChannelRegistry::new(hub.clone());
        (hub, registry)
    }

    #[tokio::test]
    async fn test_acquire_shares_one_handle_per_name() {
        let (_hub, registry) = registry();

        let a = registry.acquire("effects");
        let b = registry.acquire("effects");

        assert!(Arc::ptr_eq(a.channel(), b.channel()));
        assert_eq!(registry.ref_count("effects"), 2);

        registry.release(a).await;
        assert_eq!(registry.ref_count("effects"), 1);
        assert_eq!(registry.open_channels(), 1);

        registry.release(b).await;
        assert_eq!(registry.ref_count("effects"), 0);
        assert_eq!(registry.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_independent_names_do_not_contend() {
        let (_hub, registry) = registry();

        let one = registry.acquire("call-1");
        let two = registry.acquire("call-2");
        assert!(!Arc::ptr_eq(one.channel(), two.channel()));

        registry.release(one).await;
        assert_eq!(registry.ref_count("call-1"), 0);
        assert_eq!(registry.ref_count("call-2"), 1);
        registry.release(two).await;
    }

    #[tokio::test]
    async fn test_last_release_closes_channel() {
        let (_hub, registry) = registry();

        let lease = registry.acquire("call-1");
        let channel = lease.channel().clone();
        let mut rx = channel.subscribe().await.unwrap();

        registry.release(lease).await;

        // Subscription is gone and the handle rejects sends.
        assert_eq!(rx.recv().await, None);
        assert!(channel.send("late".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_reacquire_after_close_opens_fresh_handle() {
        let (_hub, registry) = registry();

        let first = registry.acquire("call-1");
        let first_channel = first.channel().clone();
        registry.release(first).await;

        let second = registry.acquire("call-1");
        assert!(!Arc::ptr_eq(&first_channel, second.channel()));
        assert!(second.channel().send("hello".to_string()).await.is_ok());
        registry.release(second).await;
    }

    /// Call-scoped channels leave nothing behind on the backend.
    #[tokio::test]
    async fn test_released_channels_free_backend_topics() {
        let (hub, registry) = registry();

        for n in 0..100 {
            let name = format!("call-{}", n);
            let lease = registry.acquire(&name);
            let _rx = lease.channel().subscribe().await.unwrap();
            assert_eq!(hub.subscriber_count(&name), 1);
            registry.release(lease).await;
        }

        assert_eq!(registry.open_channels(), 0);
        assert_eq!(hub.topic_count(), 0);
    }
}
