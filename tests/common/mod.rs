#![allow(dead_code)]

use async_trait::async_trait;
use chatcall::calls::{
    IceCandidate, IceConnectionState, MediaConstraints, MediaDevices, MediaError, MediaStream,
    MediaTrack, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, RtcConfig, SdpType,
    SessionDescription, SignalingMessage, SignalingState, TrackKind,
};
use chatcall::channel::{
    ChannelError, ChannelProvider, ChannelRegistry, MemoryHub, SignalingChannel,
};
use chatcall::store::MemoryCallStore;
use chatcall::{CallManager, CallManagerConfig, CallSnapshot, ParticipantId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Capture devices that hand out synthetic streams.
#[derive(Default)]
pub struct FakeDevices {
    pub deny: AtomicBool,
    pub deny_screen: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
    pub user_media_calls: AtomicUsize,
    pub issued: Mutex<Vec<MediaStream>>,
    pub screens: Mutex<Vec<MediaStream>>,
}

impl FakeDevices {
    pub fn user_media_calls(&self) -> usize {
        self.user_media_calls.load(Ordering::SeqCst)
    }

    pub fn last_issued(&self) -> Option<MediaStream> {
        self.issued.lock().unwrap().last().cloned()
    }

    pub fn last_screen(&self) -> Option<MediaStream> {
        self.screens.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        self.user_media_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("user dismissed the prompt".into()));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "microphone"));
        }
        if constraints.video.is_some() {
            tracks.push(MediaTrack::new(TrackKind::Video, "camera"));
        }
        let stream = MediaStream::new(tracks);
        self.issued.lock().unwrap().push(stream.clone());
        Ok(stream)
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaError> {
        if self.deny_screen.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("screen picker dismissed".into()));
        }
        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Video, "screen")]);
        self.screens.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

/// Peer connection with synthetic SDP.
///
/// Gathers two local candidates whenever a local description is set, and
/// reports `Connected` once both descriptions are in place and the signaling
/// state is back to stable.
pub struct FakePeer {
    label: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    auto_connect: Arc<AtomicBool>,
    state: Mutex<SignalingState>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    track_sent: AtomicBool,
    gathered: AtomicUsize,
    pub applied: Mutex<Vec<String>>,
    pub early_candidates: AtomicUsize,
    pub remote_descriptions: AtomicUsize,
    pub video: Mutex<Option<String>>,
    pub offers: AtomicUsize,
    pub restarts: AtomicUsize,
    pub closed: AtomicBool,
}

impl FakePeer {
    pub fn video_track(&self) -> Option<String> {
        self.video.lock().unwrap().clone()
    }

    pub fn emit(&self, state: IceConnectionState) {
        let _ = self.events.send(PeerEvent::IceConnectionState(state));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn state(&self) -> SignalingState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SignalingState) {
        *self.state.lock().unwrap() = state;
    }

    fn gather(&self) {
        for _ in 0..2 {
            let n = self.gathered.fetch_add(1, Ordering::SeqCst);
            let candidate = IceCandidate {
                candidate: format!("candidate:{} {} udp 2122260223 10.0.0.1 5000{} typ host", self.label, n, n),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            };
            let _ = self.events.send(PeerEvent::IceCandidate(candidate));
        }
    }

    fn maybe_connect(&self) {
        if self.local_set.load(Ordering::SeqCst)
            && self.remote_set.load(Ordering::SeqCst)
            && self.state() == SignalingState::Stable
            && self.auto_connect.load(Ordering::SeqCst)
        {
            self.emit(IceConnectionState::Checking);
            self.emit(IceConnectionState::Connected);
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: Arc<MediaTrack>, _stream_id: &str) -> Result<(), PeerError> {
        if track.kind() == TrackKind::Video {
            *self.video.lock().unwrap() = Some(track.id().to_string());
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError> {
        *self.video.lock().unwrap() = Some(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        if ice_restart {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SessionDescription::offer(format!("v=0 o={} offer", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.state() != SignalingState::HaveRemoteOffer {
            return Err(PeerError::InvalidState(self.state()));
        }
        Ok(SessionDescription::answer(format!("v=0 o={} answer", self.label)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        match (description.kind, self.state()) {
            (SdpType::Offer, SignalingState::Stable) => {
                self.set_state(SignalingState::HaveLocalOffer)
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                self.set_state(SignalingState::Stable)
            }
            (_, state) => return Err(PeerError::InvalidState(state)),
        }
        self.local_set.store(true, Ordering::SeqCst);
        self.gather();
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.remote_descriptions.fetch_add(1, Ordering::SeqCst);
        match (description.kind, self.state()) {
            (SdpType::Offer, SignalingState::Stable) => {
                self.set_state(SignalingState::HaveRemoteOffer)
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                self.set_state(SignalingState::Stable)
            }
            (_, state) => return Err(PeerError::InvalidState(state)),
        }
        self.remote_set.store(true, Ordering::SeqCst);
        if !self.track_sent.swap(true, Ordering::SeqCst) {
            let remote = MediaStream::new(vec![
                MediaTrack::new(TrackKind::Audio, "remote audio"),
                MediaTrack::new(TrackKind::Video, "remote video"),
            ]);
            let _ = self.events.send(PeerEvent::Track(remote));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            self.early_candidates.fetch_add(1, Ordering::SeqCst);
        }
        self.applied.lock().unwrap().push(candidate.candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
    }

    fn signaling_state(&self) -> SignalingState {
        self.state()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_state(SignalingState::Closed);
    }
}

pub struct FakePeerFactory {
    label: String,
    pub auto_connect: Arc<AtomicBool>,
    created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            auto_connect: Arc::new(AtomicBool::new(true)),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        _config: &RtcConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = Arc::new(FakePeer {
            label: self.label.clone(),
            events,
            auto_connect: self.auto_connect.clone(),
            state: Mutex::new(SignalingState::Stable),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            track_sent: AtomicBool::new(false),
            gathered: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
            early_candidates: AtomicUsize::new(0),
            remote_descriptions: AtomicUsize::new(0),
            video: Mutex::new(None),
            offers: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

type Copies = Arc<dyn Fn(&SignalingMessage) -> usize + Send + Sync>;

/// Broadcast backend that sends each outgoing frame as many times as
/// `copies` says: zero drops it, two repeats it.
pub struct ScriptedHub {
    inner: Arc<MemoryHub>,
    copies: Copies,
}

impl ScriptedHub {
    pub fn new(
        inner: Arc<MemoryHub>,
        copies: impl Fn(&SignalingMessage) -> usize + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            copies: Arc::new(copies),
        }
    }
}

impl ChannelProvider for ScriptedHub {
    fn open(&self, name: &str) -> Arc<dyn SignalingChannel> {
        Arc::new(ScriptedChannel {
            inner: self.inner.open(name),
            copies: self.copies.clone(),
        })
    }
}

struct ScriptedChannel {
    inner: Arc<dyn SignalingChannel>,
    copies: Copies,
}

#[async_trait]
impl SignalingChannel for ScriptedChannel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<String>, ChannelError> {
        self.inner.subscribe().await
    }

    async fn send(&self, frame: String) -> Result<(), ChannelError> {
        let copies = SignalingMessage::decode(&frame)
            .map(|m| (self.copies)(&m))
            .unwrap_or(1);
        for _ in 0..copies {
            self.inner.send(frame.clone()).await?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// One signed-in user with their own manager, devices and channel registry.
pub struct Party {
    pub id: ParticipantId,
    pub manager: CallManager,
    pub devices: Arc<FakeDevices>,
    pub peers: Arc<FakePeerFactory>,
    pub channels: Arc<ChannelRegistry>,
}

impl Party {
    /// Wait until the published snapshot satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        let mut rx = self.manager.watch();
        let snapshot = tokio::time::timeout(WAIT, rx.wait_for(predicate))
            .await
            .unwrap_or_else(|_| panic!("{} timed out waiting for snapshot", self.id))
            .expect("manager stopped");
        snapshot.clone()
    }

    pub async fn wait_active(&self) -> CallSnapshot {
        self.wait_for(|s| s.state.is_active()).await
    }

    pub async fn wait_idle(&self) -> CallSnapshot {
        self.wait_for(|s| s.call.is_none()).await
    }

    pub async fn wait_ringing(&self) -> CallSnapshot {
        self.wait_for(|s| s.incoming.is_some()).await
    }
}

/// Shared record store and broadcast backend.
pub struct World {
    pub store: Arc<MemoryCallStore>,
    pub hub: Arc<MemoryHub>,
}

pub fn test_config() -> CallManagerConfig {
    CallManagerConfig {
        offer_settle_delay: Duration::from_millis(50),
        ring_timeout: None,
        negotiation_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

impl World {
    pub fn new() -> Self {
        init_logging();
        Self {
            store: Arc::new(MemoryCallStore::new()),
            hub: Arc::new(MemoryHub::new()),
        }
    }

    pub async fn party(&self, name: &str) -> Party {
        self.party_with(name, test_config()).await
    }

    pub async fn party_with(&self, name: &str, config: CallManagerConfig) -> Party {
        self.party_over(name, config, self.hub.clone()).await
    }

    /// A party whose signaling goes through `provider` instead of the hub.
    pub async fn party_over(
        &self,
        name: &str,
        config: CallManagerConfig,
        provider: Arc<dyn ChannelProvider>,
    ) -> Party {
        let id = ParticipantId::from(name);
        let devices = Arc::new(FakeDevices::default());
        let peers = Arc::new(FakePeerFactory::new(name));
        let channels = Arc::new(ChannelRegistry::new(provider));
        let manager = CallManager::builder()
            .local_participant(id.clone())
            .with_store(self.store.clone())
            .with_media_devices(devices.clone())
            .with_peer_factory(peers.clone())
            .with_channels(channels.clone())
            .with_config(config)
            .build()
            .await
            .expect("manager should build");
        Party {
            id,
            manager,
            devices,
            peers,
            channels,
        }
    }
}

/// Dial from `caller` and answer on `callee`, returning once both are active.
pub async fn connect(caller: &Party, callee: &Party) {
    caller
        .manager
        .initiate_call("conversation-1", callee.id.clone())
        .await
        .expect("initiate_call");
    callee.wait_ringing().await;
    callee.manager.answer_call().await.expect("answer_call");
    caller.wait_active().await;
    callee.wait_active().await;
}

/// Poll `check` until it holds or the wait budget runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
