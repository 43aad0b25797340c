//! Peer sessions: one peer connection per remote participant.

use super::candidates::CandidateBuffer;
use super::error::CallError;
use super::media::{MediaStream, MediaTrack};
use super::peer::{
    PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, RtcConfig, SignalingState,
};
use super::signaling::{IceCandidate, SessionDescription, SignalingMessage};
use super::state::Role;
use crate::channel::{ChannelLease, ChannelRegistry};
use crate::types::call::ParticipantId;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Membership {
    registry: Arc<ChannelRegistry>,
    lease: ChannelLease,
}

/// Everything this client holds for one remote participant: the peer
/// connection, the outbound media, buffered remote candidates and the
/// signaling channel membership.
///
/// `close` releases all of it and may be called any number of times.
pub struct PeerSession {
    remote: ParticipantId,
    role: Role,
    pc: Arc<dyn PeerConnection>,
    local: MediaStream,
    screen: Option<MediaStream>,
    candidates: CandidateBuffer,
    membership: Option<Membership>,
    tasks: Vec<JoinHandle<()>>,
    offer_sent: bool,
    closed: bool,
}

impl PeerSession {
    /// Create the peer connection and attach every local track to it, so the
    /// first description already advertises the right media kinds.
    pub async fn open(
        factory: &dyn PeerConnectionFactory,
        config: &RtcConfig,
        remote: ParticipantId,
        role: Role,
        local: MediaStream,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pc = factory.create(config, events_tx).await?;

        for track in local.tracks() {
            if let Err(e) = pc.add_track(track.clone(), local.id()).await {
                pc.close().await;
                return Err(e);
            }
        }
        debug!(
            "Opened peer session with {} as {:?} ({} local tracks)",
            remote,
            role,
            local.tracks().len()
        );

        Ok((
            Self {
                remote,
                role,
                pc,
                local,
                screen: None,
                candidates: CandidateBuffer::new(),
                membership: None,
                tasks: Vec::new(),
                offer_sent: false,
                closed: false,
            },
            events_rx,
        ))
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_stream(&self) -> &MediaStream {
        &self.local
    }

    pub fn screen_stream(&self) -> Option<&MediaStream> {
        self.screen.as_ref()
    }

    /// The stream currently shown in the local preview.
    pub fn preview(&self) -> &MediaStream {
        self.screen.as_ref().unwrap_or(&self.local)
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.screen.is_some()
    }

    pub fn offer_sent(&self) -> bool {
        self.offer_sent
    }

    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.pc.signaling_state()
    }

    /// Keep a background task alive for as long as the session.
    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Acquire the named channel and subscribe to it.
    pub async fn join_channel(
        &mut self,
        registry: &Arc<ChannelRegistry>,
        name: &str,
    ) -> Result<mpsc::Receiver<String>, CallError> {
        if self.closed {
            return Err(PeerError::Closed.into());
        }
        let lease = registry.acquire(name);
        match lease.channel().subscribe().await {
            Ok(frames) => {
                self.membership = Some(Membership {
                    registry: registry.clone(),
                    lease,
                });
                Ok(frames)
            }
            Err(e) => {
                registry.release(lease).await;
                Err(CallError::ChannelUnavailable(e.to_string()))
            }
        }
    }

    pub async fn send(&self, message: &SignalingMessage) -> Result<(), CallError> {
        let Some(membership) = &self.membership else {
            return Err(CallError::InvalidState("signaling channel not joined"));
        };
        let frame = message.encode()?;
        membership
            .lease
            .channel()
            .send(frame)
            .await
            .map_err(|e| CallError::ChannelUnavailable(e.to_string()))
    }

    /// Create an offer and apply it locally.
    pub async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, CallError> {
        let offer = self.pc.create_offer(ice_restart).await?;
        self.pc.set_local_description(offer.clone()).await?;
        self.offer_sent = true;
        Ok(offer)
    }

    /// Apply a remote offer, flush buffered candidates and produce the answer.
    ///
    /// Accepted from `stable` only, which covers both the initial offer and
    /// later renegotiations such as ICE restarts.
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, CallError> {
        match self.pc.signaling_state() {
            SignalingState::Stable => {}
            state => {
                return Err(CallError::NegotiationStale(format!(
                    "offer received in {:?}",
                    state
                )));
            }
        }
        self.pc.set_remote_description(offer).await?;
        self.flush_candidates().await;

        let answer = self.pc.create_answer().await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Apply the peer's answer. Late or duplicate answers are stale.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        let state = self.pc.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            return Err(CallError::NegotiationStale(format!(
                "answer received in {:?}",
                state
            )));
        }
        self.pc.set_remote_description(answer).await?;
        self.flush_candidates().await;
        Ok(())
    }

    /// Apply a remote candidate, or hold it until the remote description is
    /// set. Returns whether it was applied now.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<bool, CallError> {
        if self.closed {
            return Err(PeerError::Closed.into());
        }
        if !self.pc.has_remote_description().await {
            self.candidates.push(candidate);
            debug!(
                "Buffered candidate from {} ({} pending)",
                self.remote,
                self.candidates.len()
            );
            return Ok(false);
        }
        self.pc.add_ice_candidate(candidate).await?;
        Ok(true)
    }

    /// Apply every buffered candidate in arrival order. Returns how many were
    /// applied; a candidate the connection rejects is logged and skipped.
    pub async fn flush_candidates(&mut self) -> usize {
        let pending: Vec<IceCandidate> = self.candidates.drain().collect();
        let mut applied = 0;
        for candidate in pending {
            match self.pc.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!("Dropping buffered candidate from {}: {}", self.remote, e),
            }
        }
        if applied > 0 {
            debug!("Flushed {} buffered candidates from {}", applied, self.remote);
        }
        applied
    }

    pub async fn replace_video(&mut self, track: Arc<MediaTrack>) -> Result<(), CallError> {
        self.pc.replace_video_track(track).await?;
        Ok(())
    }

    /// Send `screen`'s video track in place of the camera. Returns the track
    /// now being sent.
    pub async fn share_screen(&mut self, screen: MediaStream) -> Result<Arc<MediaTrack>, CallError> {
        let Some(track) = screen.video_track().cloned() else {
            screen.stop_all();
            return Err(CallError::InvalidState("screen capture has no video track"));
        };
        if let Err(e) = self.replace_video(track.clone()).await {
            screen.stop_all();
            return Err(e);
        }
        if let Some(previous) = self.screen.replace(screen) {
            previous.stop_all();
        }
        info!("Sharing screen with {}", self.remote);
        Ok(track)
    }

    /// Put the camera track back and stop the screen capture.
    pub async fn stop_screen_share(&mut self) -> Result<(), CallError> {
        let Some(screen) = self.screen.take() else {
            return Ok(());
        };
        screen.stop_all();
        if let Some(camera) = self.local.video_track().cloned() {
            self.replace_video(camera).await?;
        }
        info!("Stopped sharing screen with {}", self.remote);
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.local.stop_all();
        if let Some(screen) = self.screen.take() {
            screen.stop_all();
        }
        self.pc.close().await;
        self.candidates.clear();
        if let Some(membership) = self.membership.take() {
            membership.registry.release(membership.lease).await;
        }
        debug!("Closed peer session with {}", self.remote);
    }
}

/// Live sessions keyed by remote participant.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<ParticipantId, PeerSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session, closing any previous session for the same peer
    /// first.
    pub async fn install(&mut self, session: PeerSession) -> &mut PeerSession {
        let remote = session.remote().clone();
        if let Some(mut previous) = self.remove(&remote) {
            info!("Replacing existing session with {}", remote);
            previous.close().await;
        }
        self.sessions.entry(remote).or_insert(session)
    }

    pub fn get(&self, remote: &ParticipantId) -> Option<&PeerSession> {
        self.sessions.get(remote)
    }

    pub fn get_mut(&mut self, remote: &ParticipantId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(remote)
    }

    pub fn remove(&mut self, remote: &ParticipantId) -> Option<PeerSession> {
        self.sessions.remove(remote)
    }

    pub async fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::calls::media::TrackKind;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Peer connection that only tracks signaling state and what was applied.
    #[derive(Default)]
    pub struct MockPeer {
        pub state: Mutex<Option<SignalingState>>,
        pub remote_set: AtomicBool,
        pub applied: Mutex<Vec<String>>,
        pub tracks: Mutex<Vec<String>>,
        pub video: Mutex<Option<String>>,
        pub closed: AtomicBool,
    }

    impl MockPeer {
        fn state(&self) -> SignalingState {
            self.state.lock().unwrap().unwrap_or(SignalingState::Stable)
        }

        fn set_state(&self, state: SignalingState) {
            *self.state.lock().unwrap() = Some(state);
        }
    }

    #[async_trait]
    impl PeerConnection for MockPeer {
        async fn add_track(&self, track: Arc<MediaTrack>, _stream_id: &str) -> Result<(), PeerError> {
            if track.kind() == TrackKind::Video {
                *self.video.lock().unwrap() = Some(track.id().to_string());
            }
            self.tracks.lock().unwrap().push(track.id().to_string());
            Ok(())
        }

        async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError> {
            *self.video.lock().unwrap() = Some(track.id().to_string());
            Ok(())
        }

        async fn create_offer(&self, _ice_restart: bool) -> Result<SessionDescription, PeerError> {
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
            if self.state() != SignalingState::HaveRemoteOffer {
                return Err(PeerError::InvalidState(self.state()));
            }
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
            match desc.kind {
                crate::calls::signaling::SdpType::Offer => {
                    self.set_state(SignalingState::HaveLocalOffer)
                }
                _ => self.set_state(SignalingState::Stable),
            }
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
            self.remote_set.store(true, Ordering::SeqCst);
            match desc.kind {
                crate::calls::signaling::SdpType::Offer => {
                    self.set_state(SignalingState::HaveRemoteOffer)
                }
                _ => self.set_state(SignalingState::Stable),
            }
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
            assert!(
                self.remote_set.load(Ordering::SeqCst),
                "candidate applied before remote description"
            );
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

    #[derive(Default)]
    pub struct MockFactory {
        pub created: Mutex<Vec<Arc<MockPeer>>>,
    }

    impl MockFactory {
        pub fn last(&self) -> Arc<MockPeer> {
            self.created.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl PeerConnectionFactory for MockFactory {
        async fn create(
            &self,
            _config: &RtcConfig,
            _events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<Arc<dyn PeerConnection>, PeerError> {
            let peer = Arc::new(MockPeer::default());
            self.created.lock().unwrap().push(peer.clone());
            Ok(peer)
        }
    }
}
