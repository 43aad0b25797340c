//! The task that owns all call state.
//!
//! UI commands, record store events, signaling frames, peer-connection
//! callbacks, media acquisition results and timers are all handled here, one
//! at a time. Anything that completes asynchronously is tagged with the
//! generation it was started in; teardown bumps the generation, so results
//! that arrive for a torn-down call are recognized and discarded.

use super::error::CallError;
use super::manager::{BusyPolicy, CallManagerConfig, CallSnapshot};
use super::media::{MediaConstraints, MediaDevices, MediaError, MediaStream, TrackKind};
use super::peer::{IceConnectionState, PeerConnectionFactory, PeerEvent};
use super::session::{PeerSession, SessionTable};
use super::signaling::SignalingMessage;
use super::state::{CallInfo, CallState, CallTransition, EndReason, Role};
use crate::channel::ChannelRegistry;
use crate::store::{
    CallRecord, CallRecordStore, CallStatus, NewCallRecord, RecordEvent, StatusUpdate, StoreError,
};
use crate::types::call::{CallId, ParticipantId};
use crate::types::events::{
    CallAccepted, CallConnected, CallDeclined, CallEnded, EventBus, IncomingCall, Notice,
    RemoteStream,
};
use log::{debug, info, warn};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

pub(crate) enum Command {
    Initiate {
        conversation_id: String,
        receiver_id: ParticipantId,
        reply: Reply<CallId>,
    },
    Answer {
        reply: Reply<()>,
    },
    Decline {
        reply: Reply<()>,
    },
    End {
        reply: Reply<()>,
    },
    ToggleMute {
        reply: Reply<bool>,
    },
    ToggleCamera {
        reply: Reply<bool>,
    },
    ToggleScreenShare {
        reply: Reply<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    MediaAcquired {
        generation: u64,
        result: Result<MediaStream, MediaError>,
    },
    ScreenAcquired {
        generation: u64,
        result: Result<MediaStream, MediaError>,
    },
    ScreenEnded {
        generation: u64,
        track_id: String,
    },
    Frame {
        generation: u64,
        frame: String,
    },
    Peer {
        generation: u64,
        event: PeerEvent,
    },
    SettleElapsed {
        generation: u64,
    },
    RingTimeout {
        generation: u64,
    },
    NegotiationDeadline {
        generation: u64,
    },
}

impl Internal {
    fn generation(&self) -> u64 {
        match self {
            Self::MediaAcquired { generation, .. }
            | Self::ScreenAcquired { generation, .. }
            | Self::ScreenEnded { generation, .. }
            | Self::Frame { generation, .. }
            | Self::Peer { generation, .. }
            | Self::SettleElapsed { generation }
            | Self::RingTimeout { generation }
            | Self::NegotiationDeadline { generation } => *generation,
        }
    }

    /// Drop a result that arrived after its call was torn down.
    fn discard(self) {
        match self {
            Self::MediaAcquired {
                result: Ok(stream), ..
            }
            | Self::ScreenAcquired {
                result: Ok(stream), ..
            } => {
                debug!("Stopping media acquired for a finished call");
                stream.stop_all();
            }
            Self::Frame { .. } => debug!("Dropping signaling frame for a finished call"),
            _ => {}
        }
    }
}

/// External services the manager drives.
pub(crate) struct Collaborators {
    pub store: Arc<dyn CallRecordStore>,
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub channels: Arc<ChannelRegistry>,
}

pub(crate) struct CallActor {
    local: ParticipantId,
    config: CallManagerConfig,
    store: Arc<dyn CallRecordStore>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    channels: Arc<ChannelRegistry>,
    events: Arc<EventBus>,
    snapshot: watch::Sender<CallSnapshot>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,

    call: Option<CallInfo>,
    sessions: SessionTable,
    generation: u64,
    pending_answer: Option<Reply<()>>,
    pending_screen: Option<Reply<bool>>,
    ice_restarts: u32,
    remote_video: Option<MediaStream>,
}

impl CallActor {
    pub(crate) fn new(
        local: ParticipantId,
        config: CallManagerConfig,
        collaborators: Collaborators,
        events: Arc<EventBus>,
        snapshot: watch::Sender<CallSnapshot>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            local,
            config,
            store: collaborators.store,
            devices: collaborators.devices,
            peers: collaborators.peers,
            channels: collaborators.channels,
            events,
            snapshot,
            internal_tx,
            internal_rx: Some(internal_rx),
            call: None,
            sessions: SessionTable::new(),
            generation: 0,
            pending_answer: None,
            pending_screen: None,
            ice_restarts: 0,
            remote_video: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut records: mpsc::UnboundedReceiver<RecordEvent>,
    ) {
        let Some(mut internal) = self.internal_rx.take() else {
            return;
        };

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let flow = match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.shutdown().await;
                            ControlFlow::Break(())
                        }
                    };
                    if flow.is_break() {
                        break;
                    }
                }
                Some(event) = records.recv() => self.handle_record_event(event).await,
                Some(event) = internal.recv() => self.handle_internal(event).await,
            }
        }
        debug!("Call manager for {} stopped", self.local);
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Initiate {
                conversation_id,
                receiver_id,
                reply,
            } => {
                let result = self.initiate(conversation_id, receiver_id).await;
                let _ = reply.send(result);
            }
            Command::Answer { reply } => self.answer(reply),
            Command::Decline { reply } => {
                let result = self.decline().await;
                let _ = reply.send(result);
            }
            Command::End { reply } => {
                let result = self.end_call().await;
                let _ = reply.send(result);
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(Ok(self.toggle_track(TrackKind::Audio)));
            }
            Command::ToggleCamera { reply } => {
                let _ = reply.send(Ok(self.toggle_track(TrackKind::Video)));
            }
            Command::ToggleScreenShare { reply } => self.toggle_screen_share(reply).await,
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_internal(&mut self, event: Internal) {
        if event.generation() != self.generation {
            event.discard();
            return;
        }
        match event {
            Internal::MediaAcquired { result, .. } => self.on_media_acquired(result).await,
            Internal::ScreenAcquired { result, .. } => self.on_screen_acquired(result).await,
            Internal::ScreenEnded { track_id, .. } => self.on_screen_ended(track_id).await,
            Internal::Frame { frame, .. } => self.on_frame(frame).await,
            Internal::Peer { event, .. } => self.on_peer_event(event).await,
            Internal::SettleElapsed { .. } => self.on_settle_elapsed().await,
            Internal::RingTimeout { .. } => {
                if self.call.as_ref().is_some_and(|c| c.state.is_calling()) {
                    info!("No answer, ending call");
                    self.fail_call(EndReason::RingTimeout, Notice::CallEnded)
                        .await;
                }
            }
            Internal::NegotiationDeadline { .. } => {
                if self.call.as_ref().is_some_and(|c| c.state.is_connecting()) {
                    warn!(
                        "Call did not connect within {:?}",
                        self.config.negotiation_timeout
                    );
                    self.fail_call(
                        EndReason::NegotiationTimeout,
                        Notice::CallFailed(CallError::ConnectivityLost.to_string()),
                    )
                    .await;
                }
            }
        }
    }

    // --- commands ---

    async fn initiate(
        &mut self,
        conversation_id: String,
        receiver_id: ParticipantId,
    ) -> Result<CallId, CallError> {
        if self.call.is_some() {
            return Err(CallError::AlreadyInCall);
        }
        if receiver_id == self.local {
            return Err(CallError::InvalidState("cannot call yourself"));
        }
        self.sessions.close_all().await;

        let record = self
            .store
            .create(NewCallRecord {
                conversation_id,
                caller_id: self.local.clone(),
                receiver_id,
            })
            .await?;

        let mut call = CallInfo::new_outgoing(record);
        call.apply_transition(CallTransition::Dial)?;
        let call_id = call.id().clone();
        info!("Calling {} (call {})", call.remote, call_id);
        self.call = Some(call);

        if let Some(timeout) = self.config.ring_timeout {
            self.schedule(
                timeout,
                Internal::RingTimeout {
                    generation: self.generation,
                },
            );
        }
        self.notify(Notice::Calling);
        self.publish();
        Ok(call_id)
    }

    fn answer(&mut self, reply: Reply<()>) {
        let check = match &self.call {
            None => Err(CallError::InvalidState("no incoming call")),
            Some(call) if call.is_initiator() || !call.state.can_accept() => {
                Err(CallError::InvalidState("call is not ringing"))
            }
            Some(_) if self.pending_answer.is_some() => {
                Err(CallError::InvalidState("call is already being answered"))
            }
            Some(_) => Ok(()),
        };
        if let Err(e) = check {
            let _ = reply.send(Err(e));
            return;
        }

        // Completed in `accept_incoming` once media is available.
        self.pending_answer = Some(reply);
        self.acquire_media();
    }

    async fn decline(&mut self) -> Result<(), CallError> {
        let call_id = match &self.call {
            Some(call) if !call.is_initiator() && call.state.can_decline() => call.id().clone(),
            Some(_) => return Err(CallError::InvalidState("call is not ringing")),
            None => return Err(CallError::InvalidState("no incoming call")),
        };

        self.store
            .update(&call_id, StatusUpdate::declined())
            .await?;
        if let Some(call) = self.call.as_mut() {
            call.record_closed = true;
        }
        info!("Declined call {}", call_id);
        self.finish(CallTransition::LocalDeclined).await;
        Ok(())
    }

    async fn end_call(&mut self) -> Result<(), CallError> {
        let Some(call) = &self.call else {
            debug!("No call to end");
            return Ok(());
        };
        info!("Ending call {}", call.id());
        self.close_record(StatusUpdate::ended()).await;
        self.finish(CallTransition::Ended {
            reason: EndReason::LocalHangup,
        })
        .await;
        Ok(())
    }

    fn toggle_track(&mut self, kind: TrackKind) -> bool {
        let track = self
            .current_session()
            .map(|session| session.local_stream())
            .and_then(|stream| match kind {
                TrackKind::Audio => stream.audio_track(),
                TrackKind::Video => stream.video_track(),
            })
            .cloned();
        let Some(track) = track else {
            return false;
        };

        let enabled = track.toggle();
        debug!("{:?} track {} enabled={}", kind, track.id(), enabled);

        let transition = match kind {
            TrackKind::Audio => CallTransition::AudioMuteChanged { muted: !enabled },
            TrackKind::Video => CallTransition::VideoStateChanged { off: !enabled },
        };
        if let Some(call) = self.call.as_mut()
            && call.state.is_active()
        {
            let _ = call.apply_transition(transition);
        }
        self.publish();
        enabled
    }

    async fn toggle_screen_share(&mut self, reply: Reply<bool>) {
        if !self.call.as_ref().is_some_and(|c| c.state.is_active()) {
            let _ = reply.send(Err(CallError::InvalidState(
                "screen sharing needs an active call",
            )));
            return;
        }
        let Some(session) = self.current_session_mut() else {
            let _ = reply.send(Err(CallError::InvalidState("no peer session")));
            return;
        };

        if session.is_sharing_screen() {
            let result = session.stop_screen_share().await;
            match result {
                Ok(()) => {
                    self.transition(CallTransition::ScreenShareChanged { sharing: false });
                    self.publish();
                    let _ = reply.send(Ok(false));
                }
                Err(e) => {
                    warn!("Failed to stop screen sharing: {}", e);
                    self.notify(Notice::ScreenShareFailed(e.to_string()));
                    let _ = reply.send(Err(e));
                }
            }
            return;
        }

        if self.pending_screen.is_some() {
            let _ = reply.send(Err(CallError::InvalidState(
                "screen capture already requested",
            )));
            return;
        }
        self.pending_screen = Some(reply);

        let devices = self.devices.clone();
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = devices.get_display_media().await;
            let _ = tx.send(Internal::ScreenAcquired { generation, result });
        });
    }

    async fn shutdown(&mut self) {
        if self.call.is_some() {
            self.close_record(StatusUpdate::ended()).await;
            self.finish(CallTransition::Ended {
                reason: EndReason::Shutdown,
            })
            .await;
        } else {
            self.teardown().await;
        }
        info!("Call manager for {} shutting down", self.local);
    }

    // --- record store ---

    async fn handle_record_event(&mut self, event: RecordEvent) {
        match event {
            RecordEvent::Inserted(record) => self.on_record_inserted(record).await,
            RecordEvent::Updated(record) => self.on_record_updated(record).await,
        }
    }

    async fn on_record_inserted(&mut self, record: CallRecord) {
        if record.receiver_id != self.local || record.status != CallStatus::Ringing {
            return;
        }

        if let Some(current) = &self.call {
            if current.id() == &record.id {
                return;
            }
            match self.config.busy_policy {
                BusyPolicy::AutoDecline => {
                    info!(
                        "Declining call {} from {}: already in call {}",
                        record.id,
                        record.caller_id,
                        current.id()
                    );
                    if let Err(e) = self
                        .store
                        .update(&record.id, StatusUpdate::declined())
                        .await
                    {
                        warn!("Failed to decline call {}: {}", record.id, e);
                    }
                    self.notify(Notice::Busy(record.caller_id));
                }
                BusyPolicy::Ignore => {
                    debug!("Ignoring call {} while busy", record.id);
                }
            }
            return;
        }

        let mut call = CallInfo::new_incoming(record.clone());
        if let Err(e) = call.apply_transition(CallTransition::IncomingOffer) {
            warn!("Ignoring incoming call {}: {}", record.id, e);
            return;
        }
        info!("Incoming call {} from {}", record.id, record.caller_id);
        self.call = Some(call);
        let _ = self
            .events
            .incoming_call
            .send(Arc::new(IncomingCall { record }));
        self.publish();
    }

    async fn on_record_updated(&mut self, record: CallRecord) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.id() != &record.id {
            debug!("Ignoring update for call {}", record.id);
            return;
        }
        let status = record.status;
        call.record = record;

        match status {
            CallStatus::Ringing => {}
            CallStatus::Accepted => {
                if call.is_initiator() && call.state.is_calling() {
                    self.on_remote_accepted();
                } else {
                    self.publish();
                }
            }
            CallStatus::Declined | CallStatus::Ended => {
                // Our own write coming back.
                if call.record_closed {
                    return;
                }
                call.record_closed = true;
                let remote = call.remote.clone();
                if status == CallStatus::Declined {
                    info!("Call declined by {}", remote);
                    self.notify(Notice::CallDeclined);
                    self.finish(CallTransition::RemoteDeclined).await;
                } else {
                    info!("Call ended by {}", remote);
                    self.notify(Notice::CallEnded);
                    self.finish(CallTransition::Ended {
                        reason: EndReason::RemoteHangup,
                    })
                    .await;
                }
            }
        }
    }

    fn on_remote_accepted(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if let Err(e) = call.apply_transition(CallTransition::RemoteAccepted) {
            warn!("{}", e);
            return;
        }
        let call_id = call.id().clone();
        info!("Call {} accepted, starting as offerer", call_id);
        let _ = self.events.call_accepted.send(Arc::new(CallAccepted {
            call_id,
            role: Role::Offerer,
        }));

        self.schedule(
            self.config.negotiation_timeout,
            Internal::NegotiationDeadline {
                generation: self.generation,
            },
        );
        self.acquire_media();
        self.publish();
    }

    // --- media ---

    fn acquire_media(&self) {
        let devices = self.devices.clone();
        let constraints = MediaConstraints {
            audio: true,
            video: Some(self.config.video.clone()),
        };
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = devices.get_user_media(&constraints).await;
            let _ = tx.send(Internal::MediaAcquired { generation, result });
        });
    }

    async fn on_media_acquired(&mut self, result: Result<MediaStream, MediaError>) {
        let role = match self.call.as_ref().map(|c| &c.state) {
            Some(CallState::Ringing { .. }) if self.pending_answer.is_some() => Role::Answerer,
            Some(CallState::Connecting {
                role: Role::Offerer,
                ..
            }) if self.sessions.is_empty() => Role::Offerer,
            _ => {
                if let Ok(stream) = result {
                    debug!("Stopping media nobody is waiting for");
                    stream.stop_all();
                }
                return;
            }
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                self.on_media_failed(role, e).await;
                return;
            }
        };

        match role {
            Role::Answerer => {
                let result = self.accept_incoming(stream).await;
                if let Some(reply) = self.pending_answer.take() {
                    let _ = reply.send(result);
                }
            }
            Role::Offerer => self.start_offerer(stream).await,
        }
    }

    async fn on_media_failed(&mut self, role: Role, err: MediaError) {
        warn!("Media acquisition failed: {}", err);
        let notice = match &err {
            MediaError::PermissionDenied(_) | MediaError::NotFound(_) => Notice::MediaAccessDenied,
            other => Notice::CallFailed(other.to_string()),
        };
        self.notify(notice);

        match role {
            Role::Answerer => {
                if let Some(reply) = self.pending_answer.take() {
                    let _ = reply.send(Err(err.into()));
                }
                self.close_record(StatusUpdate::declined()).await;
                self.finish(CallTransition::LocalDeclined).await;
            }
            Role::Offerer => {
                self.close_record(StatusUpdate::ended()).await;
                self.finish(CallTransition::Ended {
                    reason: EndReason::MediaAccessDenied,
                })
                .await;
            }
        }
    }

    async fn accept_incoming(&mut self, stream: MediaStream) -> Result<(), CallError> {
        if let Err(e) = self.open_session(Role::Answerer, stream).await {
            warn!("Failed to answer call: {}", e);
            self.notify(Notice::CallFailed(e.to_string()));
            self.close_record(StatusUpdate::declined()).await;
            self.finish(CallTransition::LocalDeclined).await;
            return Err(e);
        }

        let Some(call_id) = self.current_id() else {
            return Err(CallError::Cancelled);
        };
        match self.store.update(&call_id, StatusUpdate::accepted()).await {
            Ok(record) => {
                if let Some(call) = self.call.as_mut() {
                    call.record = record;
                }
            }
            Err(StoreError::Terminal { id, status }) => {
                info!("Call {} was already {} when answering", id, status);
                if let Some(call) = self.call.as_mut() {
                    call.record_closed = true;
                }
                self.notify(Notice::CallEnded);
                self.finish(CallTransition::Ended {
                    reason: EndReason::RemoteHangup,
                })
                .await;
                return Err(StoreError::Terminal { id, status }.into());
            }
            Err(e) => {
                warn!("Failed to accept call {}: {}", call_id, e);
                self.notify(Notice::CallFailed(e.to_string()));
                self.close_record(StatusUpdate::declined()).await;
                self.finish(CallTransition::LocalDeclined).await;
                return Err(e.into());
            }
        }

        self.transition(CallTransition::LocalAccepted);
        info!("Accepted call {}, waiting for offer", call_id);
        let _ = self.events.call_accepted.send(Arc::new(CallAccepted {
            call_id,
            role: Role::Answerer,
        }));
        self.schedule(
            self.config.negotiation_timeout,
            Internal::NegotiationDeadline {
                generation: self.generation,
            },
        );
        self.publish();

        if let Err(e) = self.join_signaling().await {
            self.fail_signaling(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn start_offerer(&mut self, stream: MediaStream) {
        if let Err(e) = self.open_session(Role::Offerer, stream).await {
            warn!("Failed to set up peer connection: {}", e);
            self.fail_call(EndReason::Failed, Notice::CallFailed(e.to_string()))
                .await;
            return;
        }
        self.publish();

        if let Err(e) = self.join_signaling().await {
            self.fail_signaling(&e).await;
        }
    }

    /// Replace any live session with a new one for the current call.
    async fn open_session(&mut self, role: Role, stream: MediaStream) -> Result<(), CallError> {
        let Some(remote) = self.call.as_ref().map(|c| c.remote.clone()) else {
            stream.stop_all();
            return Err(CallError::Cancelled);
        };
        self.sessions.close_all().await;

        let opened = PeerSession::open(
            self.peers.as_ref(),
            &self.config.rtc_config(),
            remote,
            role,
            stream.clone(),
        )
        .await;
        let (session, mut peer_events) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                stream.stop_all();
                return Err(e.into());
            }
        };

        let tx = self.internal_tx.clone();
        let generation = self.generation;
        let forwarder = tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                if tx.send(Internal::Peer { generation, event }).is_err() {
                    break;
                }
            }
        });
        self.sessions.install(session).await.attach_task(forwarder);
        Ok(())
    }

    async fn on_screen_acquired(&mut self, result: Result<MediaStream, MediaError>) {
        let Some(reply) = self.pending_screen.take() else {
            if let Ok(stream) = result {
                stream.stop_all();
            }
            return;
        };
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Screen capture failed: {}", e);
                self.notify(Notice::ScreenShareFailed(e.to_string()));
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        let active = self.call.as_ref().is_some_and(|c| c.state.is_active());
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        let Some(session) = self.current_session_mut().filter(|_| active) else {
            stream.stop_all();
            let _ = reply.send(Err(CallError::InvalidState(
                "screen sharing needs an active call",
            )));
            return;
        };

        match session.share_screen(stream).await {
            Ok(track) => {
                let mut ended = track.on_ended();
                let track_id = track.id().to_string();
                session.attach_task(tokio::spawn(async move {
                    let stopped = ended.wait_for(|ended| *ended).await.is_ok();
                    if stopped {
                        let _ = tx.send(Internal::ScreenEnded {
                            generation,
                            track_id,
                        });
                    }
                }));
                self.transition(CallTransition::ScreenShareChanged { sharing: true });
                self.publish();
                let _ = reply.send(Ok(true));
            }
            Err(e) => {
                warn!("Failed to share screen: {}", e);
                self.notify(Notice::ScreenShareFailed(e.to_string()));
                let _ = reply.send(Err(e));
            }
        }
    }

    /// The capture was stopped outside our control; go back to the camera.
    async fn on_screen_ended(&mut self, track_id: String) {
        let Some(session) = self.current_session_mut() else {
            return;
        };
        let current = session
            .screen_stream()
            .and_then(|s| s.video_track())
            .is_some_and(|t| t.id() == track_id);
        if !current {
            return;
        }

        info!("Screen capture ended, restoring camera");
        match session.stop_screen_share().await {
            Ok(()) => {
                self.transition(CallTransition::ScreenShareChanged { sharing: false });
                self.publish();
            }
            Err(e) => warn!("Failed to restore camera: {}", e),
        }
    }

    // --- signaling ---

    async fn join_signaling(&mut self) -> Result<(), CallError> {
        let Some(call) = &self.call else {
            return Err(CallError::Cancelled);
        };
        let remote = call.remote.clone();
        let name = call.id().channel_name();
        let local = self.local.clone();
        let channels = self.channels.clone();
        let tx = self.internal_tx.clone();
        let generation = self.generation;

        let Some(session) = self.sessions.get_mut(&remote) else {
            return Err(CallError::Cancelled);
        };
        let mut frames = session.join_channel(&channels, &name).await?;
        session.attach_task(tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if tx.send(Internal::Frame { generation, frame }).is_err() {
                    break;
                }
            }
        }));
        let role = session.role();
        info!("Joined {} as {:?}", name, role);

        session
            .send(&SignalingMessage::Ready {
                from: local,
                to: remote,
            })
            .await?;

        if role == Role::Offerer {
            self.schedule(
                self.config.offer_settle_delay,
                Internal::SettleElapsed { generation },
            );
        }
        Ok(())
    }

    async fn fail_signaling(&mut self, err: &CallError) {
        warn!("Signaling failed: {}", err);
        self.notify(Notice::ChannelUnavailable);
        self.close_record(StatusUpdate::ended()).await;
        self.finish(CallTransition::Ended {
            reason: EndReason::ChannelUnavailable,
        })
        .await;
    }

    async fn on_frame(&mut self, frame: String) {
        let message = match SignalingMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Rejecting signaling frame: {}", e);
                return;
            }
        };
        if !message.is_for(&self.local) {
            debug!(
                "Ignoring {} frame from {} to {}",
                message.kind(),
                message.sender(),
                message.target()
            );
            return;
        }
        let Some(call) = &self.call else {
            return;
        };
        if message.sender() != &call.remote {
            warn!(
                "Ignoring {} frame from {}: not part of call {}",
                message.kind(),
                message.sender(),
                call.id()
            );
            return;
        }
        let call_id = call.id().clone();
        let remote = call.remote.clone();
        let local = self.local.clone();

        if let SignalingMessage::Ready { .. } = message {
            self.on_peer_ready().await;
            return;
        }

        let Some(session) = self.sessions.get_mut(&remote) else {
            return;
        };
        match message {
            SignalingMessage::Offer { description, .. } => {
                if session.role() != Role::Answerer {
                    debug!("Dropping offer from {}: we are the offerer", remote);
                    return;
                }
                info!("Received offer from {}", remote);
                match session.accept_offer(description).await {
                    Ok(answer) => {
                        let reply = SignalingMessage::Answer {
                            from: local,
                            to: remote.clone(),
                            description: answer,
                        };
                        match session.send(&reply).await {
                            Ok(()) => info!("Sent answer to {}", remote),
                            Err(e) => warn!("Failed to send answer to {}: {}", remote, e),
                        }
                    }
                    Err(CallError::NegotiationStale(reason)) => {
                        debug!("Dropping stale offer: {}", reason)
                    }
                    Err(e) => warn!("Error handling offer from {}: {}", remote, e),
                }
            }
            SignalingMessage::Answer { description, .. } => {
                match session.accept_answer(description).await {
                    Ok(()) => info!("Applied answer from {}", remote),
                    Err(CallError::NegotiationStale(reason)) => {
                        debug!("Dropping stale answer: {}", reason)
                    }
                    Err(e) => warn!("Error handling answer from {}: {}", remote, e),
                }
            }
            SignalingMessage::IceCandidate {
                call_id: frame_call,
                candidate,
                ..
            } => {
                if frame_call != call_id {
                    debug!("Dropping candidate for call {}", frame_call);
                    return;
                }
                if let Err(e) = session.add_remote_candidate(candidate).await {
                    warn!("Error adding ICE candidate: {}", e);
                }
            }
            SignalingMessage::Ready { .. } => {}
        }
    }

    async fn on_peer_ready(&mut self) {
        let local = self.local.clone();
        let Some(session) = self.current_session_mut() else {
            return;
        };
        let remote = session.remote().clone();
        match session.role() {
            Role::Offerer if !session.offer_sent() => {
                debug!("{} is ready, sending offer", remote);
                self.send_offer(false).await;
            }
            Role::Offerer => debug!("{} is ready, offer already sent", remote),
            Role::Answerer => {
                let ready = SignalingMessage::Ready {
                    from: local,
                    to: remote.clone(),
                };
                if let Err(e) = session.send(&ready).await {
                    warn!("Failed to acknowledge {}: {}", remote, e);
                }
            }
        }
    }

    async fn on_settle_elapsed(&mut self) {
        let pending = self
            .current_session()
            .is_some_and(|s| s.role() == Role::Offerer && !s.offer_sent());
        if pending {
            info!(
                "Peer not ready after {:?}, sending offer anyway",
                self.config.offer_settle_delay
            );
            self.send_offer(false).await;
        }
    }

    async fn send_offer(&mut self, ice_restart: bool) {
        let local = self.local.clone();
        let Some(session) = self.current_session_mut() else {
            return;
        };
        let remote = session.remote().clone();
        let description = match session.create_offer(ice_restart).await {
            Ok(description) => description,
            Err(e) => {
                warn!("Error creating offer: {}", e);
                return;
            }
        };
        let offer = SignalingMessage::Offer {
            from: local,
            to: remote.clone(),
            description,
        };
        match session.send(&offer).await {
            Ok(()) if ice_restart => info!("Sent ICE restart offer to {}", remote),
            Ok(()) => info!("Sent offer to {}", remote),
            Err(e) => warn!("Failed to send offer to {}: {}", remote, e),
        }
    }

    // --- peer connection ---

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                let (Some(call_id), local) = (self.current_id(), self.local.clone()) else {
                    return;
                };
                let Some(session) = self.current_session() else {
                    return;
                };
                let message = SignalingMessage::IceCandidate {
                    from: local,
                    to: session.remote().clone(),
                    call_id,
                    candidate,
                };
                if let Err(e) = session.send(&message).await {
                    debug!("Dropping local candidate: {}", e);
                }
            }
            PeerEvent::Track(stream) => {
                let Some(call_id) = self.current_id() else {
                    return;
                };
                info!("Remote stream {} received", stream.id());
                self.remote_video = Some(stream.clone());
                let _ = self
                    .events
                    .remote_stream
                    .send(Arc::new(RemoteStream { call_id, stream }));
                self.publish();
            }
            PeerEvent::IceConnectionState(state) => self.on_ice_state(state).await,
        }
    }

    async fn on_ice_state(&mut self, state: IceConnectionState) {
        let Some(call) = &self.call else {
            return;
        };
        info!("ICE state for call {}: {:?}", call.id(), state);

        if state.is_connected() {
            self.ice_restarts = 0;
            if !call.state.is_connecting() {
                return;
            }
            let call_id = call.id().clone();
            let (audio_muted, video_off) = self
                .current_session()
                .map(|s| {
                    let stream = s.local_stream();
                    (
                        !stream.audio_track().is_some_and(|t| t.is_enabled()),
                        !stream.video_track().is_some_and(|t| t.is_enabled()),
                    )
                })
                .unwrap_or((true, true));
            self.transition(CallTransition::MediaConnected {
                audio_muted,
                video_off,
            });
            info!("Call {} connected", call_id);
            let _ = self
                .events
                .call_connected
                .send(Arc::new(CallConnected { call_id }));
            self.publish();
            return;
        }

        if state != IceConnectionState::Failed
            || !(call.state.is_connecting() || call.state.is_active())
        {
            return;
        }
        let role = call.role;
        if self.ice_restarts < self.config.max_ice_restarts {
            self.ice_restarts += 1;
            match role {
                Some(Role::Offerer) => {
                    info!(
                        "ICE failed, restarting (attempt {}/{})",
                        self.ice_restarts, self.config.max_ice_restarts
                    );
                    self.send_offer(true).await;
                }
                _ => info!("ICE failed, waiting for the offerer to restart"),
            }
        } else {
            warn!(
                "ICE failed after {} restarts, ending call",
                self.config.max_ice_restarts
            );
            self.fail_call(EndReason::ConnectivityLost, Notice::CallEnded)
                .await;
        }
    }

    // --- teardown ---

    /// Write the terminal status for the current call, once.
    async fn close_record(&mut self, update: StatusUpdate) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.record_closed {
            return;
        }
        call.record_closed = true;
        let call_id = call.id().clone();
        let status = update.status;

        match self.store.update(&call_id, update).await {
            Ok(record) => {
                if let Some(call) = self.call.as_mut() {
                    call.record = record;
                }
            }
            Err(StoreError::Terminal { status: current, .. }) => {
                debug!("Call {} was already {}", call_id, current)
            }
            Err(e) => warn!("Failed to mark call {} {}: {}", call_id, status, e),
        }
    }

    /// End the call on the record and locally, telling the user why.
    async fn fail_call(&mut self, reason: EndReason, notice: Notice) {
        self.notify(notice);
        self.close_record(StatusUpdate::ended()).await;
        self.finish(CallTransition::Ended { reason }).await;
    }

    /// Move the call to its terminal state, announce it and tear down.
    async fn finish(&mut self, transition: CallTransition) {
        if let Some(call) = self.call.as_mut() {
            let call_id = call.id().clone();
            let fallback = match &transition {
                CallTransition::LocalDeclined => EndReason::LocalHangup,
                CallTransition::Ended { reason } => *reason,
                _ => EndReason::RemoteHangup,
            };
            let applied = match call.apply_transition(transition) {
                Ok(()) => Ok(()),
                Err(e) => {
                    debug!("{}, ending with {:?} instead", e, fallback);
                    call.apply_transition(CallTransition::Ended { reason: fallback })
                }
            };
            match applied {
                Ok(()) => match &call.state {
                    CallState::Declined { by_remote, .. } => {
                        let _ = self.events.call_declined.send(Arc::new(CallDeclined {
                            call_id,
                            by_remote: *by_remote,
                        }));
                    }
                    CallState::Ended {
                        reason,
                        duration_secs,
                        ..
                    } => {
                        info!(
                            "Call {} ended ({:?}, {}s)",
                            call_id,
                            reason,
                            duration_secs.unwrap_or(0)
                        );
                        let _ = self.events.call_ended.send(Arc::new(CallEnded {
                            call_id,
                            reason: *reason,
                        }));
                    }
                    _ => {}
                },
                Err(e) => {
                    warn!("{}", e);
                    let _ = self.events.call_ended.send(Arc::new(CallEnded {
                        call_id,
                        reason: fallback,
                    }));
                }
            }
        }
        self.teardown().await;
    }

    /// Release everything held for the current call. Safe to call at any
    /// point, any number of times.
    async fn teardown(&mut self) {
        self.generation += 1;
        self.sessions.close_all().await;

        if let Some(reply) = self.pending_answer.take() {
            let _ = reply.send(Err(CallError::Cancelled));
        }
        if let Some(reply) = self.pending_screen.take() {
            let _ = reply.send(Err(CallError::Cancelled));
        }
        if let Some(call) = self.call.take() {
            debug!("Cleaned up call {}", call.id());
        }
        self.remote_video = None;
        self.ice_restarts = 0;
        self.publish();
    }

    // --- helpers ---

    fn transition(&mut self, transition: CallTransition) {
        if let Some(call) = self.call.as_mut()
            && let Err(e) = call.apply_transition(transition)
        {
            warn!("{}", e);
        }
    }

    fn current_id(&self) -> Option<CallId> {
        self.call.as_ref().map(|c| c.id().clone())
    }

    fn current_session(&self) -> Option<&PeerSession> {
        let remote = &self.call.as_ref()?.remote;
        self.sessions.get(remote)
    }

    fn current_session_mut(&mut self) -> Option<&mut PeerSession> {
        let remote = &self.call.as_ref()?.remote;
        self.sessions.get_mut(remote)
    }

    fn schedule(&self, delay: Duration, event: Internal) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    fn notify(&self, notice: Notice) {
        debug!("Notice: {}", notice);
        let _ = self.events.notice.send(Arc::new(notice));
    }

    fn publish(&self) {
        let call = self.call.as_ref();
        let session = self.current_session();
        let local = session.map(|s| s.local_stream());

        self.snapshot.send_replace(CallSnapshot {
            state: call.map(|c| c.state.clone()).unwrap_or_default(),
            call: call.map(|c| c.record.clone()),
            incoming: call
                .filter(|c| !c.is_initiator() && c.state.is_ringing())
                .map(|c| c.record.clone()),
            role: call.and_then(|c| c.role),
            audio_enabled: local
                .and_then(|s| s.audio_track())
                .is_some_and(|t| t.is_enabled()),
            video_enabled: local
                .and_then(|s| s.video_track())
                .is_some_and(|t| t.is_enabled()),
            screen_sharing: session.is_some_and(|s| s.is_sharing_screen()),
            local_video: session.map(|s| s.preview().clone()),
            remote_video: self.remote_video.clone(),
        });
    }
}
