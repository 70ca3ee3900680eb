//! Peer connection manager: one point-to-point media connection per remote
//! approved participant. Links are created through a factory seam so the
//! coordination logic can be exercised without a live media stack.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::media::MediaSource;
use crate::signaling::{ParticipantInfo, SignalPayload};

/// Signals that arrive before their link exists are held, capped per remote.
const SIGNAL_BUFFER_CAP: usize = 32;

/// Exactly one side of every pair initiates: participants that are already
/// joined initiate toward a newly approved one, and the newcomer responds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTrackKind {
    Audio,
    Video,
}

/// What a link reports back to the dispatch loop. All room-state mutation
/// stays on that loop; link internals only emit.
#[derive(Debug)]
pub enum LinkEvent {
    /// Outgoing negotiation step to relay to `remote_id` via the transport.
    Signal { remote_id: String, payload: SignalPayload },
    Connected { remote_id: String },
    Failed { remote_id: String },
    RemoteTrack { remote_id: String, kind: RemoteTrackKind },
}

#[async_trait]
pub trait MediaLink: Send + Sync {
    async fn apply_signal(&self, payload: SignalPayload) -> Result<()>;
    async fn close(&self);
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create_link(
        &self,
        remote_id: &str,
        role: LinkRole,
        media: Option<&Arc<MediaSource>>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>>;
}

pub struct PeerEntry {
    pub connection_id: String,
    pub participant: ParticipantInfo,
    pub role: LinkRole,
    pub connected: bool,
    pub remote_mic_on: bool,
    pub remote_cam_on: bool,
    link: Arc<dyn MediaLink>,
}

/// Owns every live link plus the buffer of early-arriving signals. Sole
/// authority on per-peer connection objects.
pub struct PeerRegistry {
    factory: Arc<dyn LinkFactory>,
    events: mpsc::Sender<LinkEvent>,
    links: HashMap<String, PeerEntry>,
    pending_signals: HashMap<String, Vec<SignalPayload>>,
}

impl PeerRegistry {
    pub fn new(factory: Arc<dyn LinkFactory>, events: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            factory,
            events,
            links: HashMap::new(),
            pending_signals: HashMap::new(),
        }
    }

    /// Opens a link we negotiate first on. Returns false when a link for this
    /// remote already exists (replayed approval events are ignored).
    pub async fn create_initiating_link(
        &mut self,
        remote_id: &str,
        participant: ParticipantInfo,
        media: Option<&Arc<MediaSource>>,
    ) -> Result<bool> {
        self.create_link(remote_id, participant, LinkRole::Initiator, media).await
    }

    /// Opens a link that waits for the remote's offer.
    pub async fn create_responding_link(
        &mut self,
        remote_id: &str,
        participant: ParticipantInfo,
        media: Option<&Arc<MediaSource>>,
    ) -> Result<bool> {
        self.create_link(remote_id, participant, LinkRole::Responder, media).await
    }

    async fn create_link(
        &mut self,
        remote_id: &str,
        participant: ParticipantInfo,
        role: LinkRole,
        media: Option<&Arc<MediaSource>>,
    ) -> Result<bool> {
        if self.links.contains_key(remote_id) {
            debug!("link to {} already exists, ignoring", remote_id);
            return Ok(false);
        }

        let link = self
            .factory
            .create_link(remote_id, role, media, self.events.clone())
            .await?;
        self.links.insert(
            remote_id.to_owned(),
            PeerEntry {
                connection_id: remote_id.to_owned(),
                participant,
                role,
                connected: false,
                remote_mic_on: true,
                remote_cam_on: true,
                link: link.clone(),
            },
        );

        // Drain any signals that raced ahead of link creation, in order.
        if let Some(buffered) = self.pending_signals.remove(remote_id) {
            debug!("applying {} buffered signal(s) for {}", buffered.len(), remote_id);
            for payload in buffered {
                if let Err(e) = link.apply_signal(payload).await {
                    warn!("buffered signal failed for {}: {}", remote_id, e);
                    self.teardown(remote_id).await;
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    /// Routes a negotiation message to its link; buffers it when the link does
    /// not exist yet. A failing link is torn down; others are unaffected.
    pub async fn apply_signal(&mut self, remote_id: &str, payload: SignalPayload) -> Result<()> {
        if let Some(entry) = self.links.get(remote_id) {
            let link = entry.link.clone();
            if let Err(e) = link.apply_signal(payload).await {
                warn!("signal failed for {}, tearing the link down: {}", remote_id, e);
                self.teardown(remote_id).await;
                return Err(e);
            }
            return Ok(());
        }

        let buffer = self.pending_signals.entry(remote_id.to_owned()).or_default();
        if buffer.len() >= SIGNAL_BUFFER_CAP {
            warn!("signal buffer full for {}, dropping oldest", remote_id);
            buffer.remove(0);
        }
        buffer.push(payload);
        Ok(())
    }

    /// Releases the link's resources. No-op when no link exists.
    pub async fn teardown(&mut self, remote_id: &str) {
        self.pending_signals.remove(remote_id);
        if let Some(entry) = self.links.remove(remote_id) {
            entry.link.close().await;
        }
    }

    pub async fn teardown_all(&mut self) {
        self.pending_signals.clear();
        let links: Vec<_> = self.links.drain().collect();
        for (_, entry) in links {
            entry.link.close().await;
        }
    }

    pub fn mark_connected(&mut self, remote_id: &str) {
        if let Some(entry) = self.links.get_mut(remote_id) {
            entry.connected = true;
        }
    }

    pub fn mark_remote_track(&mut self, remote_id: &str, kind: RemoteTrackKind) {
        if let Some(entry) = self.links.get_mut(remote_id) {
            match kind {
                RemoteTrackKind::Audio => entry.remote_mic_on = true,
                RemoteTrackKind::Video => entry.remote_cam_on = true,
            }
        }
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.links.contains_key(remote_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PeerEntry> {
        self.links.values()
    }
}

/// Builds real links over `RTCPeerConnection`.
pub struct WebRtcLinkFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcLinkFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn create_link(
        &self,
        remote_id: &str,
        role: LinkRole,
        media: Option<&Arc<MediaSource>>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        if let Some(media) = media {
            if let Some(track) = media.audio_track() {
                pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
            }
            if let Some(track) = media.video_track() {
                pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
            }
        }

        let remote = remote_id.to_owned();
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let remote = remote.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_string(&init) {
                        Ok(json) => {
                            let _ = tx
                                .send(LinkEvent::Signal {
                                    remote_id: remote,
                                    payload: SignalPayload::Candidate { candidate: json },
                                })
                                .await;
                        }
                        Err(e) => warn!("failed to encode ICE candidate: {}", e),
                    },
                    Err(e) => warn!("failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let remote = remote_id.to_owned();
        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let remote = remote.clone();
            let tx = tx.clone();
            Box::pin(async move {
                debug!("peer connection {} state: {}", remote, state);
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = tx.send(LinkEvent::Connected { remote_id: remote }).await;
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = tx.send(LinkEvent::Failed { remote_id: remote }).await;
                    }
                    _ => {}
                }
            })
        }));

        let remote = remote_id.to_owned();
        let tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let remote = remote.clone();
                let tx = tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => RemoteTrackKind::Video,
                        _ => RemoteTrackKind::Audio,
                    };
                    let _ = tx.send(LinkEvent::RemoteTrack { remote_id: remote, kind }).await;
                })
            },
        ));

        let link = Arc::new(WebRtcLink {
            remote_id: remote_id.to_owned(),
            pc: pc.clone(),
            events,
        });

        if role == LinkRole::Initiator {
            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer.clone()).await?;
            let _ = link
                .events
                .send(LinkEvent::Signal {
                    remote_id: remote_id.to_owned(),
                    payload: SignalPayload::Offer { sdp: offer.sdp },
                })
                .await;
        }

        Ok(link)
    }
}

struct WebRtcLink {
    remote_id: String,
    pc: Arc<RTCPeerConnection>,
    events: mpsc::Sender<LinkEvent>,
}

#[async_trait]
impl MediaLink for WebRtcLink {
    async fn apply_signal(&self, payload: SignalPayload) -> Result<()> {
        match payload {
            SignalPayload::Offer { sdp } => {
                let offer = RTCSessionDescription::offer(sdp)?;
                self.pc.set_remote_description(offer).await?;
                let answer = self.pc.create_answer(None).await?;
                self.pc.set_local_description(answer.clone()).await?;
                let _ = self
                    .events
                    .send(LinkEvent::Signal {
                        remote_id: self.remote_id.clone(),
                        payload: SignalPayload::Answer { sdp: answer.sdp },
                    })
                    .await;
            }
            SignalPayload::Answer { sdp } => {
                let answer = RTCSessionDescription::answer(sdp)?;
                self.pc.set_remote_description(answer).await?;
            }
            SignalPayload::Candidate { candidate } => {
                let init: RTCIceCandidateInit = serde_json::from_str(&candidate)?;
                self.pc.add_ice_candidate(init).await?;
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("closing peer connection to {}: {}", self.remote_id, e);
        }
    }
}
