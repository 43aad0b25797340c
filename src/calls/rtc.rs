//! webrtc-rs backed peer connections.
//!
//! Local tracks are mapped to `TrackLocalStaticSample`s; whatever captures
//! media writes samples into them through [`RtcPeer::sample_track`]. Remote
//! tracks are grouped by the stream they belong to, and every arrival reports
//! the stream with all of its tracks so far.

use super::media::{MediaStream, MediaTrack, TrackKind};
use super::peer::{
    IceConnectionState, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, RtcConfig,
    SignalingState,
};
use super::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

fn backend(err: webrtc::Error) -> PeerError {
    PeerError::Backend(err.to_string())
}

type RemoteStreams = Arc<DashMap<String, MediaStream>>;

/// Add a remote track to its stream and return the stream as it stands now.
fn merge_remote_track(
    streams: &RemoteStreams,
    stream_id: String,
    track: Arc<MediaTrack>,
) -> MediaStream {
    let mut stream = streams
        .entry(stream_id.clone())
        .or_insert_with(|| MediaStream::with_id(stream_id, Vec::new()));
    stream.add_track(track);
    stream.clone()
}

/// Creates [`RtcPeer`]s with the default codecs and interceptors.
#[derive(Debug, Default)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }

    fn create_api() -> Result<webrtc::api::API, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(backend)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        config: &RtcConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let api = Self::create_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(backend)?);

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                let state = match state {
                    RTCIceConnectionState::New | RTCIceConnectionState::Unspecified => {
                        IceConnectionState::New
                    }
                    RTCIceConnectionState::Checking => IceConnectionState::Checking,
                    RTCIceConnectionState::Connected => IceConnectionState::Connected,
                    RTCIceConnectionState::Completed => IceConnectionState::Completed,
                    RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
                    RTCIceConnectionState::Failed => IceConnectionState::Failed,
                    RTCIceConnectionState::Closed => IceConnectionState::Closed,
                };
                let _ = events.send(PeerEvent::IceConnectionState(state));
            })
        }));

        let track_events = events;
        let remote_streams: RemoteStreams = Arc::new(DashMap::new());
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let events = track_events.clone();
            let streams = remote_streams.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                info!("Remote {:?} track {} arrived", kind, track.id());
                let remote = MediaTrack::with_id(track.id(), kind, "remote");
                let stream = merge_remote_track(&streams, track.stream_id(), remote);
                let _ = events.send(PeerEvent::Track(stream));
            })
        }));

        Ok(Arc::new(RtcPeer {
            pc,
            samples: DashMap::new(),
            video_sender: tokio::sync::Mutex::new(None),
        }))
    }
}

/// A peer connection backed by `RTCPeerConnection`.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    samples: DashMap<String, Arc<TrackLocalStaticSample>>,
    video_sender: tokio::sync::Mutex<Option<Arc<RTCRtpSender>>>,
}

impl RtcPeer {
    /// The outbound sample track for a local track, for writing media.
    pub fn sample_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.samples.get(track_id).map(|t| t.clone())
    }

    fn local_track(&self, track: &MediaTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_owned(),
            stream_id.to_owned(),
        ));
        self.samples.insert(track.id().to_owned(), local.clone());
        local
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&self, track: Arc<MediaTrack>, stream_id: &str) -> Result<(), PeerError> {
        let local = self.local_track(&track, stream_id);
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(backend)?;
        if track.kind() == TrackKind::Video {
            *self.video_sender.lock().await = Some(sender);
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError> {
        let sender = self.video_sender.lock().await.clone();
        let Some(sender) = sender else {
            return Err(PeerError::Backend("no outbound video track".to_string()));
        };
        let stream_id = match sender.track().await {
            Some(current) => {
                self.samples.remove(current.id());
                current.stream_id().to_owned()
            }
            None => track.id().to_owned(),
        };
        let local = self.local_track(&track, &stream_id);
        sender
            .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(backend)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart,
                voice_activity_detection: false,
            }))
            .await
            .map_err(backend)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let description = to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(backend)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: None,
            })
            .await
            .map_err(backend)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {}", e);
        }
        self.samples.clear();
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(PeerError::Backend("rollback is not supported".to_string()));
        }
    }
    .map_err(backend)
}
