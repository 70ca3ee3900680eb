//! End-to-end room flows over a fake transport and link factory: admission,
//! initiator tie-breaking, disconnects, buffered signals, and teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_test::assert_ok;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

use room_client::media::{CaptureBackend, CaptureHandle, MediaAcquirer, MediaSource};
use room_client::peer::{LinkEvent, LinkFactory, LinkRole, MediaLink};
use room_client::signaling::{
    ApprovedPeer, ParticipantInfo, SignalPayload, SignalingMessage, SignalingSender,
};
use room_client::{Error, Result, RoomConfig, RoomCoordinator, RoomHandle, RoomView};

fn participant(name: &str) -> ParticipantInfo {
    ParticipantInfo { name: name.into(), email: format!("{name}@example.com") }
}

fn approved(id: &str) -> ApprovedPeer {
    ApprovedPeer { connection_id: id.into(), participant: participant(id) }
}

struct FakeSender {
    sent: Arc<Mutex<Vec<SignalingMessage>>>,
}

#[async_trait]
impl SignalingSender for FakeSender {
    async fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
}

struct FakeLink {
    applied: Mutex<Vec<SignalPayload>>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaLink for FakeLink {
    async fn apply_signal(&self, payload: SignalPayload) -> Result<()> {
        self.applied.lock().unwrap().push(payload);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Records every created link; initiating links emit one fake offer so the
/// relay path back through the transport is exercised.
#[derive(Default)]
struct FakeFactory {
    created: Mutex<Vec<(String, LinkRole)>>,
    links: Mutex<HashMap<String, Arc<FakeLink>>>,
}

impl FakeFactory {
    fn link(&self, remote_id: &str) -> Arc<FakeLink> {
        self.links.lock().unwrap().get(remote_id).expect("link exists").clone()
    }

    fn roles(&self) -> Vec<(String, LinkRole)> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl LinkFactory for FakeFactory {
    async fn create_link(
        &self,
        remote_id: &str,
        role: LinkRole,
        _media: Option<&Arc<MediaSource>>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>> {
        let link = Arc::new(FakeLink {
            applied: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push((remote_id.to_owned(), role));
        self.links.lock().unwrap().insert(remote_id.to_owned(), link.clone());
        if role == LinkRole::Initiator {
            let _ = events
                .send(LinkEvent::Signal {
                    remote_id: remote_id.to_owned(),
                    payload: SignalPayload::Offer { sdp: "fake-offer".into() },
                })
                .await;
        }
        Ok(link)
    }
}

struct FakeBackend {
    audio: bool,
    video: bool,
}

#[async_trait]
impl CaptureBackend for FakeBackend {
    async fn open_audio(
        &self,
        _track: Arc<webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample>,
        _enabled: Arc<AtomicBool>,
    ) -> Result<CaptureHandle> {
        if self.audio {
            Ok(CaptureHandle::new(()))
        } else {
            Err(Error::Media("no microphone".into()))
        }
    }

    async fn open_video(
        &self,
        _track: Arc<webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample>,
        _enabled: Arc<AtomicBool>,
    ) -> Result<CaptureHandle> {
        if self.video {
            Ok(CaptureHandle::new(()))
        } else {
            Err(Error::Media("no camera".into()))
        }
    }
}

struct Harness {
    handle: RoomHandle,
    view: watch::Receiver<RoomView>,
    server: mpsc::Sender<SignalingMessage>,
    sent: Arc<Mutex<Vec<SignalingMessage>>>,
    factory: Arc<FakeFactory>,
    task: tokio::task::JoinHandle<Result<()>>,
}

fn start(local_id: &str, is_host: bool) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let (server, inbox) = mpsc::channel(32);
    let sent = Arc::new(Mutex::new(Vec::new()));
    let factory = Arc::new(FakeFactory::default());
    let acquirer = MediaAcquirer::new(Arc::new(FakeBackend { audio: true, video: true }));
    let config = RoomConfig::new("r1", participant(local_id), is_host);

    let (coordinator, handle) = RoomCoordinator::new(
        config,
        FakeSender { sent: sent.clone() },
        inbox,
        local_id.to_owned(),
        factory.clone(),
        acquirer,
    );
    let view = handle.subscribe();
    let task = tokio::spawn(coordinator.run());
    Harness { handle, view, server, sent, factory, task }
}

async fn wait_view<F>(rx: &mut watch::Receiver<RoomView>, f: F) -> RoomView
where
    F: Fn(&RoomView) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            {
                let view = rx.borrow_and_update();
                if f(&view) {
                    return RoomView::clone(&view);
                }
            }
            rx.changed().await.expect("room ended before condition held");
        }
    })
    .await
    .expect("timed out waiting for view condition")
}

async fn wait_sent<F>(sent: &Arc<Mutex<Vec<SignalingMessage>>>, f: F)
where
    F: Fn(&[SignalingMessage]) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            if f(&sent.lock().unwrap()) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for outgoing message")
}

#[tokio::test]
async fn host_admits_a_waiting_participant() {
    let mut h = start("host", true);

    // host joins immediately and announces itself
    wait_sent(&h.sent, |sent| {
        matches!(sent.first(), Some(SignalingMessage::JoinRoomRequest { room_id, .. }) if room_id == "r1")
    })
    .await;
    let view = wait_view(&mut h.view, |v| v.joined).await;
    assert!(view.mic_on && view.cam_on);

    // p1 asks to join; a replayed request does not duplicate the entry
    h.server
        .send(SignalingMessage::WaitingUser {
            connection_id: "p1".into(),
            participant: participant("p1"),
        })
        .await
        .unwrap();
    wait_view(&mut h.view, |v| v.waiting.len() == 1).await;
    h.server
        .send(SignalingMessage::WaitingUser {
            connection_id: "p1".into(),
            participant: participant("p1"),
        })
        .await
        .unwrap();
    h.server
        .send(SignalingMessage::WaitingUser {
            connection_id: "p2".into(),
            participant: participant("p2"),
        })
        .await
        .unwrap();
    let view = wait_view(&mut h.view, |v| v.waiting.len() >= 2).await;
    assert_eq!(view.waiting.len(), 2);

    // approval removes p1 from the waiting list and notifies the server
    h.handle.approve("p1").await.unwrap();
    wait_sent(&h.sent, |sent| {
        sent.iter().any(|m| matches!(m, SignalingMessage::ApproveUser { connection_id_to_approve, .. } if connection_id_to_approve == "p1"))
    })
    .await;
    let view = wait_view(&mut h.view, |v| v.waiting.len() == 1).await;
    assert_eq!(view.waiting[0].connection_id, "p2");

    // server fans the approval back: the host, already joined, initiates
    h.server
        .send(SignalingMessage::NewUserApproved {
            connection_id: "p1".into(),
            participant: participant("p1"),
        })
        .await
        .unwrap();
    let view = wait_view(&mut h.view, |v| v.peers.len() == 1).await;
    assert_eq!(view.peers[0].connection_id, "p1");
    assert_eq!(h.factory.roles(), vec![("p1".to_string(), LinkRole::Initiator)]);

    // the initiating link's offer is relayed with our id as sender
    wait_sent(&h.sent, |sent| {
        sent.iter().any(|m| matches!(m, SignalingMessage::Signal { to, from, signal: SignalPayload::Offer { sdp } } if to == "p1" && from == "host" && sdp == "fake-offer"))
    })
    .await;

    // replaying the approval creates nothing new
    h.server
        .send(SignalingMessage::NewUserApproved {
            connection_id: "p1".into(),
            participant: participant("p1"),
        })
        .await
        .unwrap();
    h.server
        .send(SignalingMessage::WaitingUser {
            connection_id: "p3".into(),
            participant: participant("p3"),
        })
        .await
        .unwrap();
    let view = wait_view(&mut h.view, |v| v.waiting.len() == 2).await;
    assert_eq!(view.peers.len(), 1);
    assert_eq!(h.factory.roles().len(), 1);

    h.handle.leave().await.unwrap();
    tokio_test::assert_ok!(h.task.await.unwrap());
}

#[tokio::test]
async fn joiner_waits_then_responds_to_the_roster() {
    let mut h = start("p1", false);

    wait_sent(&h.sent, |sent| {
        matches!(sent.first(), Some(SignalingMessage::JoinRoomRequest { .. }))
    })
    .await;
    assert!(!h.handle.view().joined);

    // approval carries the roster, including ourselves; we respond to the
    // host only and announce that we are in
    h.server
        .send(SignalingMessage::ApprovedToJoin {
            approved_participants: vec![approved("host"), approved("p1")],
        })
        .await
        .unwrap();
    let view = wait_view(&mut h.view, |v| v.joined && v.peers.len() == 1).await;
    assert_eq!(view.peers[0].connection_id, "host");
    assert_eq!(h.factory.roles(), vec![("host".to_string(), LinkRole::Responder)]);
    wait_sent(&h.sent, |sent| {
        sent.iter().any(|m| matches!(m, SignalingMessage::NewUserJoined { .. }))
    })
    .await;

    h.handle.leave().await.unwrap();
    tokio_test::assert_ok!(h.task.await.unwrap());
}

#[tokio::test]
async fn third_joiner_splits_roles_pairwise() {
    // P2's side: approved into a room where host and p1 already joined
    let mut p2 = start("p2", false);
    p2.server
        .send(SignalingMessage::ApprovedToJoin {
            approved_participants: vec![approved("host"), approved("p1"), approved("p2")],
        })
        .await
        .unwrap();
    let view = wait_view(&mut p2.view, |v| v.peers.len() == 2).await;
    assert!(view.peers.iter().all(|p| p.connection_id != "p2"));
    let mut roles = p2.factory.roles();
    roles.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        roles,
        vec![
            ("host".to_string(), LinkRole::Responder),
            ("p1".to_string(), LinkRole::Responder),
        ]
    );

    // The host's side of the same room: it initiated toward both newcomers
    let mut host = start("host", true);
    host.server
        .send(SignalingMessage::NewUserApproved {
            connection_id: "p1".into(),
            participant: participant("p1"),
        })
        .await
        .unwrap();
    host.server
        .send(SignalingMessage::NewUserApproved {
            connection_id: "p2".into(),
            participant: participant("p2"),
        })
        .await
        .unwrap();
    wait_view(&mut host.view, |v| v.peers.len() == 2).await;
    let mut roles = host.factory.roles();
    roles.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        roles,
        vec![
            ("p1".to_string(), LinkRole::Initiator),
            ("p2".to_string(), LinkRole::Initiator),
        ]
    );
}

#[tokio::test]
async fn disconnect_clears_waiting_entry_and_tears_down_link() {
    let mut h = start("host", true);

    h.server
        .send(SignalingMessage::NewUserApproved {
            connection_id: "p1".into(),
            participant: participant("p1"),
        })
        .await
        .unwrap();
    h.server
        .send(SignalingMessage::WaitingUser {
            connection_id: "p2".into(),
            participant: participant("p2"),
        })
        .await
        .unwrap();
    wait_view(&mut h.view, |v| v.peers.len() == 1 && v.waiting.len() == 1).await;

    h.server
        .send(SignalingMessage::UserDisconnected { connection_id: "p1".into() })
        .await
        .unwrap();
    h.server
        .send(SignalingMessage::UserDisconnected { connection_id: "p2".into() })
        .await
        .unwrap();
    let view = wait_view(&mut h.view, |v| v.peers.is_empty() && v.waiting.is_empty()).await;
    assert!(view.joined);
    assert!(h.factory.link("p1").closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn signal_arriving_before_link_creation_is_buffered() {
    let mut h = start("p1", false);

    // the host's offer outruns the approval notification
    h.server
        .send(SignalingMessage::Signal {
            to: "p1".into(),
            from: "host".into(),
            signal: SignalPayload::Offer { sdp: "early".into() },
        })
        .await
        .unwrap();
    h.server
        .send(SignalingMessage::ApprovedToJoin {
            approved_participants: vec![approved("host"), approved("p1")],
        })
        .await
        .unwrap();
    wait_view(&mut h.view, |v| v.peers.len() == 1).await;

    let applied = h.factory.link("host").applied.lock().unwrap().clone();
    assert_eq!(applied, vec![SignalPayload::Offer { sdp: "early".into() }]);
}

#[tokio::test]
async fn mute_toggle_touches_only_the_local_source() {
    let mut h = start("host", true);
    h.server
        .send(SignalingMessage::NewUserApproved {
            connection_id: "p1".into(),
            participant: participant("p1"),
        })
        .await
        .unwrap();
    wait_view(&mut h.view, |v| v.peers.len() == 1 && v.mic_on).await;

    h.handle.toggle_mic().await.unwrap();
    let view = wait_view(&mut h.view, |v| !v.mic_on).await;
    // camera flag and the peer link are untouched
    assert!(view.cam_on);
    assert_eq!(view.peers.len(), 1);
    assert!(h.factory.link("p1").applied.lock().unwrap().is_empty());
    assert!(!h.factory.link("p1").closed.load(Ordering::SeqCst));

    h.handle.toggle_mic().await.unwrap();
    wait_view(&mut h.view, |v| v.mic_on).await;
}

#[tokio::test]
async fn transport_loss_ends_the_session_and_releases_links() {
    let mut h = start("host", true);
    h.server
        .send(SignalingMessage::NewUserApproved {
            connection_id: "p1".into(),
            participant: participant("p1"),
        })
        .await
        .unwrap();
    wait_view(&mut h.view, |v| v.peers.len() == 1).await;

    drop(h.server);
    let result = h.task.await.unwrap();
    assert!(matches!(result, Err(Error::ConnectionLost)));
    assert!(h.factory.link("p1").closed.load(Ordering::SeqCst));
    assert!(h.handle.view().peers.is_empty());
}
