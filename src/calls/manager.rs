//! Public handle to the call layer.

use super::actor::{CallActor, Collaborators, Command};
use super::error::CallError;
use super::media::{MediaDevices, MediaStream, VideoConstraints};
use super::peer::{IceServer, PeerConnectionFactory, RtcConfig};
use super::state::{CallState, Role};
use crate::channel::ChannelRegistry;
use crate::store::{CallRecord, CallRecordStore};
use crate::types::call::{CallId, ParticipantId};
use crate::types::events::EventBus;
use anyhow::anyhow;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

// Commands queued before callers start waiting.
const COMMAND_CAPACITY: usize = 32;

/// What to do with an incoming call while already in one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyPolicy {
    /// Mark the new record `declined` so the caller stops ringing.
    #[default]
    AutoDecline,
    /// Leave it ringing, e.g. for another device of the same user.
    Ignore,
}

/// Configuration for the call manager.
#[derive(Clone)]
pub struct CallManagerConfig {
    /// STUN/TURN servers handed to every peer connection.
    pub ice_servers: Vec<IceServer>,
    /// Camera constraints for local capture.
    pub video: VideoConstraints,
    /// How long the offerer waits for the peer's `ready` before sending its
    /// offer anyway.
    pub offer_settle_delay: Duration,
    /// Outgoing calls still unanswered after this long are ended.
    pub ring_timeout: Option<Duration>,
    /// Calls that don't reach `active` within this window after acceptance
    /// are ended as connectivity failures.
    pub negotiation_timeout: Duration,
    /// ICE restarts attempted before a connectivity failure ends the call.
    pub max_ice_restarts: u32,
    pub busy_policy: BusyPolicy,
}

impl std::fmt::Debug for CallManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManagerConfig")
            .field("ice_servers", &self.ice_servers.len())
            .field("video", &self.video)
            .field("offer_settle_delay", &self.offer_settle_delay)
            .field("ring_timeout", &self.ring_timeout)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("max_ice_restarts", &self.max_ice_restarts)
            .field("busy_policy", &self.busy_policy)
            .finish()
    }
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::stun("stun:stun2.l.google.com:19302"),
            ],
            video: VideoConstraints::default(),
            offer_settle_delay: Duration::from_secs(1),
            ring_timeout: Some(Duration::from_secs(45)),
            negotiation_timeout: Duration::from_secs(30),
            max_ice_restarts: 1,
            busy_policy: BusyPolicy::default(),
        }
    }
}

impl CallManagerConfig {
    pub fn rtc_config(&self) -> RtcConfig {
        RtcConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }
}

/// Reactive view of the call layer for the UI.
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub state: CallState,
    /// Record of the current call, incoming or outgoing.
    pub call: Option<CallRecord>,
    /// Set while an incoming call is ringing.
    pub incoming: Option<CallRecord>,
    pub role: Option<Role>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    /// Render target for the local preview.
    pub local_video: Option<MediaStream>,
    /// Render target for the remote peer.
    pub remote_video: Option<MediaStream>,
}

impl CallSnapshot {
    /// True from dialing until the call ends.
    pub fn in_call(&self) -> bool {
        self.call.is_some() && self.incoming.is_none()
    }
}

/// Handle to a running call manager.
///
/// All call state lives in one background task; this handle sends it
/// commands and exposes what it publishes. Cloning is cheap.
#[derive(Clone)]
pub struct CallManager {
    local: ParticipantId,
    commands: mpsc::Sender<Command>,
    events: Arc<EventBus>,
    snapshot: watch::Receiver<CallSnapshot>,
    channels: Arc<ChannelRegistry>,
}

impl CallManager {
    pub fn builder() -> CallManagerBuilder {
        CallManagerBuilder::new()
    }

    pub fn local_participant(&self) -> &ParticipantId {
        &self.local
    }

    /// Create a `ringing` record for `receiver_id` and start calling.
    ///
    /// Media is not touched until the receiver answers.
    pub async fn initiate_call(
        &self,
        conversation_id: impl Into<String>,
        receiver_id: ParticipantId,
    ) -> Result<CallId, CallError> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::Initiate {
            conversation_id,
            receiver_id,
            reply,
        })
        .await
    }

    /// Answer the ringing incoming call. Resolves once local media is
    /// acquired and the record is `accepted`.
    pub async fn answer_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Answer { reply }).await
    }

    pub async fn decline_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Decline { reply }).await
    }

    /// End the current call. Does nothing when there is none.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Returns whether the microphone is now enabled.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await
    }

    /// Returns whether the camera is now enabled.
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleCamera { reply }).await
    }

    /// Returns whether the screen is now being shared.
    pub async fn toggle_screen_share(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleScreenShare { reply })
            .await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// End any live call and stop the background task.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, CallError>>) -> Command,
    ) -> Result<T, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CallError::ManagerStopped)?;
        response.await.map_err(|_| CallError::ManagerStopped)?
    }
}

/// Builder for [`CallManager`].
#[derive(Default)]
pub struct CallManagerBuilder {
    local: Option<ParticipantId>,
    store: Option<Arc<dyn CallRecordStore>>,
    devices: Option<Arc<dyn MediaDevices>>,
    peers: Option<Arc<dyn PeerConnectionFactory>>,
    channels: Option<Arc<ChannelRegistry>>,
    config: CallManagerConfig,
}

impl CallManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_participant(mut self, participant: ParticipantId) -> Self {
        self.local = Some(participant);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CallRecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_media_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn with_peer_factory(mut self, peers: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Registry the manager leases signaling channels from.
    pub fn with_channels(mut self, channels: Arc<ChannelRegistry>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe to the record store and start the manager task.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn build(self) -> anyhow::Result<CallManager> {
        let local = self
            .local
            .ok_or_else(|| anyhow!("local participant is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow!("call record store is required"))?;
        let devices = self
            .devices
            .ok_or_else(|| anyhow!("media devices are required"))?;
        let peers = self
            .peers
            .ok_or_else(|| anyhow!("peer connection factory is required"))?;
        let channels = self
            .channels
            .ok_or_else(|| anyhow!("channel registry is required"))?;

        let records = store.subscribe(&local).await?;
        let events = Arc::new(EventBus::new());
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        let actor = CallActor::new(
            local.clone(),
            self.config,
            Collaborators {
                store,
                devices,
                peers,
                channels: channels.clone(),
            },
            events.clone(),
            snapshot_tx,
        );
        tokio::spawn(actor.run(commands_rx, records));
        info!("Call manager started for {}", local);

        Ok(CallManager {
            local,
            commands: commands_tx,
            events,
            snapshot: snapshot_rx,
            channels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CallManagerConfig::default();
        assert_eq!(config.ice_servers.len(), 3);
        assert_eq!(config.rtc_config().ice_servers, config.ice_servers);
        assert_eq!(config.busy_policy, BusyPolicy::AutoDecline);
        assert_eq!(config.max_ice_restarts, 1);

        let debug = format!("{:?}", config);
        assert!(debug.contains("ice_servers: 3"));
    }

    /// Building without every collaborator fails instead of panicking later.
    #[tokio::test]
    async fn test_build_requires_collaborators() {
        let err = CallManager::builder()
            .local_participant(ParticipantId::from("alice"))
            .build()
            .await
            .err()
            .expect("build should fail");
        assert!(err.to_string().contains("call record store"));
    }

    #[test]
    fn test_snapshot_in_call() {
        let snapshot = CallSnapshot::default();
        assert!(!snapshot.in_call());
        assert!(snapshot.state.is_idle());
    }
}
