//! The room coordinator: one dispatch loop per client that reacts to server
//! messages, user commands, and link events, one at a time. All room state is
//! owned here; the outside world sees immutable [`RoomView`] snapshots.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use crate::admission::{AdmissionControl, PendingAdmission};
use crate::audio::CpalBackend;
use crate::config::RoomConfig;
use crate::error::{Error, Result};
use crate::media::{MediaAcquirer, MediaSource};
use crate::peer::{LinkEvent, LinkFactory, PeerRegistry, WebRtcLinkFactory};
use crate::signaling::{
    ApprovedPeer, SignalingClient, SignalingMessage, SignalingSender,
};

const COMMAND_CHANNEL_CAP: usize = 16;
const LINK_EVENT_CHANNEL_CAP: usize = 100;

#[derive(Debug)]
enum RoomCommand {
    Approve(String),
    ToggleMic,
    ToggleCam,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub connection_id: String,
    pub display_name: String,
    pub connected: bool,
    pub mic_on: bool,
    pub cam_on: bool,
}

/// Aggregate of local room state for presentation. Pure data, rebuilt after
/// every event; replaying an event never duplicates an entry.
#[derive(Debug, Clone, Default)]
pub struct RoomView {
    pub joined: bool,
    pub waiting: Vec<PendingAdmission>,
    pub peers: Vec<PeerSummary>,
    pub mic_on: bool,
    pub cam_on: bool,
    /// Non-fatal media trouble to show the user (e.g. joined audio-only).
    pub media_notice: Option<String>,
}

/// User-action side of a running room. Cheap to clone.
#[derive(Clone)]
pub struct RoomHandle {
    commands: mpsc::Sender<RoomCommand>,
    view: watch::Receiver<RoomView>,
}

impl RoomHandle {
    /// Host only: admit a waiting participant.
    pub async fn approve(&self, connection_id: &str) -> Result<()> {
        self.send(RoomCommand::Approve(connection_id.to_owned())).await
    }

    pub async fn toggle_mic(&self) -> Result<()> {
        self.send(RoomCommand::ToggleMic).await
    }

    pub async fn toggle_cam(&self) -> Result<()> {
        self.send(RoomCommand::ToggleCam).await
    }

    /// Leaves the room: every link is torn down and the capture source
    /// released before `run` returns.
    pub async fn leave(&self) -> Result<()> {
        self.send(RoomCommand::Leave).await
    }

    pub fn view(&self) -> RoomView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomView> {
        self.view.clone()
    }

    async fn send(&self, cmd: RoomCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| Error::Room("room session has ended".to_string()))
    }
}

pub struct RoomCoordinator<S: SignalingSender> {
    config: RoomConfig,
    signaling: S,
    inbox: mpsc::Receiver<SignalingMessage>,
    local_id: String,
    commands: mpsc::Receiver<RoomCommand>,
    link_events: mpsc::Receiver<LinkEvent>,
    peers: PeerRegistry,
    admission: AdmissionControl,
    acquirer: MediaAcquirer,
    media: Option<Arc<MediaSource>>,
    media_notice: Option<String>,
    joined: bool,
    view: watch::Sender<RoomView>,
}

impl RoomCoordinator<SignalingClient> {
    /// Connects to the signaling server and wires the production media stack.
    pub async fn connect(config: RoomConfig) -> Result<(Self, RoomHandle)> {
        let (signaling, inbox, local_id) =
            SignalingClient::connect(&config.signaling_url).await?;
        let factory = Arc::new(WebRtcLinkFactory::new(config.ice_servers.clone())?);
        let acquirer = MediaAcquirer::new(Arc::new(CpalBackend));
        Ok(Self::new(config, signaling, inbox, local_id, factory, acquirer))
    }
}

impl<S: SignalingSender> RoomCoordinator<S> {
    pub fn new(
        config: RoomConfig,
        signaling: S,
        inbox: mpsc::Receiver<SignalingMessage>,
        local_id: String,
        factory: Arc<dyn LinkFactory>,
        acquirer: MediaAcquirer,
    ) -> (Self, RoomHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAP);
        let (link_tx, link_rx) = mpsc::channel(LINK_EVENT_CHANNEL_CAP);
        let (view_tx, view_rx) = watch::channel(RoomView::default());

        let coordinator = Self {
            config,
            signaling,
            inbox,
            local_id,
            commands: command_rx,
            link_events: link_rx,
            peers: PeerRegistry::new(factory, link_tx),
            admission: AdmissionControl::new(),
            acquirer,
            media: None,
            media_notice: None,
            joined: false,
            view: view_tx,
        };
        let handle = RoomHandle { commands: command_tx, view: view_rx };
        (coordinator, handle)
    }

    /// Drives the room until the user leaves or the transport drops. Either
    /// way every link is torn down and the media source released before this
    /// returns; a dropped transport additionally yields
    /// [`Error::ConnectionLost`], and rejoining means a fresh connect.
    pub async fn run(mut self) -> Result<()> {
        if self.config.is_host {
            // The host is the room's first approved member by construction:
            // no waiting state, media comes up before the join request.
            self.ensure_media().await;
            self.joined = true;
        }
        let result = self.request_join().await;
        let result = match result {
            Ok(()) => {
                self.publish_view();
                self.dispatch().await
            }
            Err(e) => Err(e),
        };
        self.shutdown().await;
        result
    }

    async fn dispatch(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle_server(msg).await?,
                    None => return Err(Error::ConnectionLost),
                },
                cmd = self.commands.recv() => match cmd {
                    // A dropped handle means the room view went away.
                    Some(RoomCommand::Leave) | None => return Ok(()),
                    Some(cmd) => self.handle_command(cmd).await?,
                },
                Some(event) = self.link_events.recv() => {
                    self.handle_link_event(event).await?;
                }
            }
            self.publish_view();
        }
    }

    async fn request_join(&mut self) -> Result<()> {
        self.signaling
            .send(SignalingMessage::JoinRoomRequest {
                room_id: self.config.room_id.clone(),
                participant: self.config.participant.clone(),
            })
            .await
    }

    async fn handle_server(&mut self, msg: SignalingMessage) -> Result<()> {
        match msg {
            SignalingMessage::WaitingUser { connection_id, participant } => {
                if !self.config.is_host {
                    debug!("ignoring waiting-user on a non-host client");
                    return Ok(());
                }
                if self.admission.request(&connection_id, participant.clone()) {
                    info!("{} is waiting for approval", participant.display_name());
                }
            }
            SignalingMessage::ApprovedToJoin { approved_participants } => {
                self.ensure_media().await;
                self.joined = true;
                for peer in approved_participants {
                    if peer.connection_id == self.local_id {
                        continue;
                    }
                    self.open_responding_link(peer).await;
                }
                self.signaling
                    .send(SignalingMessage::NewUserJoined {
                        room_id: self.config.room_id.clone(),
                        participant: self.config.participant.clone(),
                    })
                    .await?;
            }
            SignalingMessage::ExistingPeers { peers } => {
                self.ensure_media().await;
                for peer in peers {
                    if peer.connection_id != self.local_id {
                        self.open_responding_link(peer).await;
                    }
                }
            }
            SignalingMessage::NewUserApproved { connection_id, participant } => {
                if connection_id == self.local_id {
                    return Ok(());
                }
                self.ensure_media().await;
                // Already-joined side initiates toward the newcomer.
                let media = self.media.clone();
                if let Err(e) = self
                    .peers
                    .create_initiating_link(&connection_id, participant, media.as_ref())
                    .await
                {
                    warn!("could not open link to {}: {}", connection_id, e);
                }
            }
            SignalingMessage::Signal { from, signal, .. } => {
                // A failing link is removed; the rest of the room is not
                // affected.
                if let Err(e) = self.peers.apply_signal(&from, signal).await {
                    warn!("dropped failed link to {}: {}", from, e);
                }
            }
            SignalingMessage::UserDisconnected { connection_id } => {
                self.admission.disconnected(&connection_id);
                self.peers.teardown(&connection_id).await;
            }
            other => debug!("ignoring unexpected signaling message: {:?}", other),
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: RoomCommand) -> Result<()> {
        match cmd {
            RoomCommand::Approve(connection_id) => {
                if !self.config.is_host {
                    warn!("approve ignored: only the host may admit participants");
                    return Ok(());
                }
                if let Some(entry) = self.admission.approve(&connection_id) {
                    info!("approved {}", entry.participant.display_name());
                    self.signaling
                        .send(SignalingMessage::ApproveUser {
                            room_id: self.config.room_id.clone(),
                            connection_id_to_approve: connection_id,
                        })
                        .await?;
                }
            }
            RoomCommand::ToggleMic => {
                if let Some(media) = &self.media {
                    let on = media.toggle_mic();
                    debug!("mic {}", if on { "on" } else { "off" });
                }
            }
            RoomCommand::ToggleCam => {
                if let Some(media) = &self.media {
                    let on = media.toggle_cam();
                    debug!("camera {}", if on { "on" } else { "off" });
                }
            }
            // Leave never reaches here; the dispatch loop intercepts it.
            RoomCommand::Leave => {}
        }
        Ok(())
    }

    async fn handle_link_event(&mut self, event: LinkEvent) -> Result<()> {
        match event {
            LinkEvent::Signal { remote_id, payload } => {
                self.signaling
                    .send(SignalingMessage::Signal {
                        to: remote_id,
                        from: self.local_id.clone(),
                        signal: payload,
                    })
                    .await?;
            }
            LinkEvent::Connected { remote_id } => {
                self.peers.mark_connected(&remote_id);
            }
            LinkEvent::Failed { remote_id } => {
                warn!("link to {} failed, removing it", remote_id);
                self.peers.teardown(&remote_id).await;
            }
            LinkEvent::RemoteTrack { remote_id, kind } => {
                self.peers.mark_remote_track(&remote_id, kind);
            }
        }
        Ok(())
    }

    async fn open_responding_link(&mut self, peer: ApprovedPeer) {
        let media = self.media.clone();
        if let Err(e) = self
            .peers
            .create_responding_link(&peer.connection_id, peer.participant, media.as_ref())
            .await
        {
            warn!("could not open link to {}: {}", peer.connection_id, e);
        }
    }

    /// Brings up the capture source on first need. A missing camera or a
    /// fully absent device set is not fatal: the room still loads, with a
    /// notice on the view instead.
    async fn ensure_media(&mut self) {
        if self.media.is_some() {
            return;
        }
        match self.acquirer.acquire().await {
            Ok(source) => {
                if source.video_track().is_none() {
                    self.media_notice =
                        Some("Video not available. Joining with audio only.".to_string());
                }
                self.media = Some(source);
            }
            Err(e) => {
                warn!("no local media available: {}", e);
                self.media_notice = Some(
                    "Cannot access camera/microphone. Check permissions and devices."
                        .to_string(),
                );
            }
        }
    }

    fn publish_view(&self) {
        let mut peers: Vec<PeerSummary> = self
            .peers
            .entries()
            .map(|entry| PeerSummary {
                connection_id: entry.connection_id.clone(),
                display_name: entry.participant.display_name(),
                connected: entry.connected,
                mic_on: entry.remote_mic_on,
                cam_on: entry.remote_cam_on,
            })
            .collect();
        peers.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));

        let view = RoomView {
            joined: self.joined,
            waiting: self.admission.waiting().to_vec(),
            peers,
            mic_on: self.media.as_ref().map(|m| m.mic_on()).unwrap_or(false),
            cam_on: self.media.as_ref().map(|m| m.cam_on()).unwrap_or(false),
            media_notice: self.media_notice.clone(),
        };
        let _ = self.view.send(view);
    }

    async fn shutdown(&mut self) {
        self.peers.teardown_all().await;
        self.acquirer.release().await;
        self.media = None;
        self.joined = false;
        self.publish_view();
    }
}
