//! Client side of the mesh: one peer link per remote participant, driven by
//! events from the negotiation channel.

mod link;
mod monitor;
mod roster;
mod worker;

pub use link::PeerLink;
pub use monitor::{LinkMonitor, LinkState, LinkStatus, NegotiationRole};
pub use roster::{ClientId, MediaSink, Roster, SinkMedia};

use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::media::{LocalMediaSession, MediaDevices};
use crate::protocol::{ClientEvent, EventKind, PeerId, RoomId};
use crate::signaling::{NegotiationChannel, SubscriptionId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use worker::{LinkDirectory, MeshWorker};

/// Media engine with the default codecs and interceptors.
pub fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

const ROOM_EVENTS: [EventKind; 4] = [
    EventKind::AddPeer,
    EventKind::RemovePeer,
    EventKind::SessionDescription,
    EventKind::IceCandidate,
];

/// Drives one room at a time over a negotiation channel.
pub struct PeerMeshOrchestrator {
    channel: NegotiationChannel,
    config: MeshConfig,
    api: Arc<API>,
    active: Arc<Mutex<Option<RoomId>>>,
}

impl PeerMeshOrchestrator {
    pub fn new(channel: NegotiationChannel, config: MeshConfig) -> Result<Self> {
        Ok(Self {
            channel,
            config,
            api: Arc::new(build_api()?),
            active: Arc::default(),
        })
    }

    pub fn channel(&self) -> &NegotiationChannel {
        &self.channel
    }

    /// Room of the live session, if any.
    pub fn active_room(&self) -> Option<RoomId> {
        self.active.lock().clone()
    }

    /// Acquire local media, then join `room`. If acquisition fails nothing
    /// is sent to the relay. Fails with [`Error::AlreadyInRoom`] while a
    /// previous session is still live.
    pub async fn enter(&self, room: RoomId, devices: &dyn MediaDevices) -> Result<RoomSession> {
        {
            let mut active = self.active.lock();
            if let Some(current) = active.as_ref() {
                warn!(room = %room, current = %current, "Already in a room");
                return Err(Error::AlreadyInRoom(current.clone()));
            }
            *active = Some(room.clone());
        }

        let local = match devices.get_user_media(self.config.constraints).await {
            Ok(local) => local,
            Err(e) => {
                error!("Error getting user media: {}", e);
                *self.active.lock() = None;
                return Err(e);
            }
        };

        let roster = Roster::new();
        roster.attach(ClientId::Local, SinkMedia::Local(local.tracks()));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let subscriptions: Vec<_> = ROOM_EVENTS
            .into_iter()
            .map(|kind| {
                let events = events_tx.clone();
                let id = self.channel.on(kind, move |event| {
                    let _ = events.send(event.clone());
                });
                (kind, id)
            })
            .collect();

        info!(room = %room, "Joining room");
        if let Err(e) = self.channel.send(ClientEvent::Join { id: room.clone() }) {
            for (kind, id) in subscriptions {
                self.channel.off(kind, id);
            }
            *self.active.lock() = None;
            return Err(e);
        }

        let directory = LinkDirectory::default();
        let worker = MeshWorker::new(
            Arc::clone(&self.api),
            self.config.rtc_configuration(),
            self.channel.clone(),
            roster.clone(),
            local.tracks(),
            Arc::clone(&directory),
        );
        let (leave_tx, leave_rx) = oneshot::channel();
        let task = tokio::spawn(worker.run(events_rx, leave_rx));

        Ok(RoomSession {
            room,
            roster,
            directory,
            channel: self.channel.clone(),
            local,
            subscriptions,
            active: Arc::clone(&self.active),
            leave: Some(leave_tx),
            task: Some(task),
        })
    }
}

/// Membership in one room.
///
/// Leaving, explicitly or by drop, stops capture, sends LEAVE and drops the
/// event subscriptions before returning, so a following `enter` always
/// reaches the relay after the LEAVE. Closing the peer links happens in the
/// background; [`leave`](Self::leave) waits for it.
pub struct RoomSession {
    room: RoomId,
    roster: Roster,
    directory: LinkDirectory,
    channel: NegotiationChannel,
    local: LocalMediaSession,
    subscriptions: Vec<(EventKind, SubscriptionId)>,
    active: Arc<Mutex<Option<RoomId>>>,
    leave: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RoomSession {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Remote peers with a live link.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.directory.read().keys().cloned().collect();
        peers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        peers
    }

    pub fn link_status(&self, peer_id: &PeerId) -> Option<LinkStatus> {
        self.directory.read().get(peer_id).map(LinkMonitor::status)
    }

    pub fn subscribe_link(&self, peer_id: &PeerId) -> Option<watch::Receiver<LinkStatus>> {
        self.directory.read().get(peer_id).map(LinkMonitor::subscribe)
    }

    /// Leave the room and wait until every link is closed.
    pub async fn leave(mut self) -> Result<()> {
        self.depart();
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| Error::Other(e.into()))?;
        }
        Ok(())
    }

    fn depart(&mut self) {
        let Some(leave) = self.leave.take() else {
            return;
        };
        self.local.stop();
        info!(room = %self.room, "leave room");
        if let Err(e) = self.channel.send(ClientEvent::Leave) {
            debug!("LEAVE not sent: {}", e);
        }
        for (kind, id) in self.subscriptions.drain(..) {
            self.channel.off(kind, id);
        }
        *self.active.lock() = None;
        let _ = leave.send(());
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.depart();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, SyntheticDevices};
    use crate::protocol::ServerEvent;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn local_config() -> MeshConfig {
        MeshConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    fn in_memory() -> (
        NegotiationChannel,
        mpsc::UnboundedReceiver<ClientEvent>,
        mpsc::UnboundedSender<ServerEvent>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (NegotiationChannel::from_parts(out_tx, in_rx), out_rx, in_tx)
    }

    async fn next_sent(outbound: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
        timeout(Duration::from_secs(5), outbound.recv())
            .await
            .expect("timed out waiting for an outbound event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_enter_sends_join_with_local_entry() {
        let (channel, mut outbound, _inbound) = in_memory();
        let mesh = PeerMeshOrchestrator::new(channel.clone(), local_config()).unwrap();
        let room = RoomId::generate();

        let session = mesh.enter(room.clone(), &SyntheticDevices).await.unwrap();

        assert_eq!(next_sent(&mut outbound).await, ClientEvent::Join { id: room.clone() });
        assert_eq!(session.room(), &room);
        assert_eq!(session.roster().clients(), vec![ClientId::Local]);
        for kind in ROOM_EVENTS {
            assert_eq!(channel.handler_count(kind), 1);
        }
    }

    #[tokio::test]
    async fn test_media_failure_sends_nothing() {
        let (channel, mut outbound, _inbound) = in_memory();
        let config = MeshConfig {
            constraints: MediaConstraints {
                audio: false,
                video: false,
            },
            ..local_config()
        };
        let mesh = PeerMeshOrchestrator::new(channel.clone(), config).unwrap();

        let result = mesh.enter(RoomId::generate(), &SyntheticDevices).await;

        assert!(matches!(result, Err(Error::MediaAcquisition(_))));
        assert!(outbound.try_recv().is_err());
        assert_eq!(channel.handler_count(EventKind::AddPeer), 0);
    }

    #[tokio::test]
    async fn test_add_peer_creates_offering_link() {
        let (channel, mut outbound, inbound) = in_memory();
        let mesh = PeerMeshOrchestrator::new(channel, local_config()).unwrap();
        let session = mesh.enter(RoomId::generate(), &SyntheticDevices).await.unwrap();
        let _join = next_sent(&mut outbound).await;

        let peer = PeerId::from("remote");
        inbound
            .send(ServerEvent::AddPeer {
                peer_id: peer.clone(),
                create_offer: true,
            })
            .unwrap();

        loop {
            if let ClientEvent::RelaySdp {
                peer_id,
                session_description,
            } = next_sent(&mut outbound).await
            {
                assert_eq!(peer_id, peer);
                assert_eq!(session_description["type"], json!("offer"));
                break;
            }
        }
        assert_eq!(session.peers(), vec![peer.clone()]);
        assert_eq!(
            session.link_status(&peer).unwrap().state,
            LinkState::Negotiating(NegotiationRole::Offering)
        );
    }

    #[tokio::test]
    async fn test_leave_tears_down() {
        let (channel, mut outbound, inbound) = in_memory();
        let mesh = PeerMeshOrchestrator::new(channel.clone(), local_config()).unwrap();
        let session = mesh.enter(RoomId::generate(), &SyntheticDevices).await.unwrap();
        let _join = next_sent(&mut outbound).await;

        let peer = PeerId::from("remote");
        inbound
            .send(ServerEvent::AddPeer {
                peer_id: peer.clone(),
                create_offer: false,
            })
            .unwrap();
        let mut roster = session.roster().subscribe();
        let roster_handle = session.roster().clone();
        timeout(Duration::from_secs(5), async {
            while session.peers().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let mut link = session.subscribe_link(&peer).unwrap();

        session.leave().await.unwrap();

        let mut saw_leave = false;
        while let Ok(event) = outbound.try_recv() {
            saw_leave |= event == ClientEvent::Leave;
        }
        assert!(saw_leave);
        assert_eq!(link.borrow_and_update().state, LinkState::Closed);
        assert!(roster.borrow_and_update().is_empty());
        assert!(roster_handle.clients().is_empty());
        for kind in ROOM_EVENTS {
            assert_eq!(channel.handler_count(kind), 0);
        }
    }

    #[tokio::test]
    async fn test_drop_leaves_room() {
        let (channel, mut outbound, _inbound) = in_memory();
        let mesh = PeerMeshOrchestrator::new(channel, local_config()).unwrap();
        let session = mesh.enter(RoomId::generate(), &SyntheticDevices).await.unwrap();
        let _join = next_sent(&mut outbound).await;

        drop(session);

        assert_eq!(next_sent(&mut outbound).await, ClientEvent::Leave);
    }

    fn joins_and_leaves(outbound: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut sent = Vec::new();
        while let Ok(event) = outbound.try_recv() {
            if matches!(event, ClientEvent::Join { .. } | ClientEvent::Leave) {
                sent.push(event);
            }
        }
        sent
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_leave_by_drop_reaches_relay_before_next_join() {
        let (channel, mut outbound, _inbound) = in_memory();
        let mesh = PeerMeshOrchestrator::new(channel, local_config()).unwrap();
        let first = RoomId::generate();
        let second = RoomId::generate();

        let session = mesh.enter(first.clone(), &SyntheticDevices).await.unwrap();
        drop(session);
        let session = mesh.enter(second.clone(), &SyntheticDevices).await.unwrap();

        assert_eq!(
            joins_and_leaves(&mut outbound),
            vec![
                ClientEvent::Join { id: first },
                ClientEvent::Leave,
                ClientEvent::Join { id: second.clone() },
            ]
        );
        assert_eq!(mesh.active_room(), Some(second));
        drop(session);
        assert_eq!(mesh.active_room(), None);
    }

    #[tokio::test]
    async fn test_second_enter_while_in_room_is_rejected() {
        let (channel, mut outbound, inbound) = in_memory();
        let mesh = PeerMeshOrchestrator::new(channel.clone(), local_config()).unwrap();
        let room = RoomId::generate();
        let _session = mesh.enter(room.clone(), &SyntheticDevices).await.unwrap();

        let second = mesh.enter(RoomId::generate(), &SyntheticDevices).await;

        assert!(matches!(second, Err(Error::AlreadyInRoom(ref current)) if *current == room));
        for kind in ROOM_EVENTS {
            assert_eq!(channel.handler_count(kind), 1);
        }
        assert_eq!(joins_and_leaves(&mut outbound), vec![ClientEvent::Join { id: room }]);

        let peer = PeerId::from("remote");
        inbound
            .send(ServerEvent::AddPeer {
                peer_id: peer.clone(),
                create_offer: true,
            })
            .unwrap();
        let mut offers = 0;
        while let Ok(Some(event)) = timeout(Duration::from_millis(500), outbound.recv()).await {
            if matches!(event, ClientEvent::RelaySdp { ref peer_id, .. } if *peer_id == peer) {
                offers += 1;
            }
        }
        assert_eq!(offers, 1);
    }

    #[tokio::test]
    async fn test_enter_again_after_leave() {
        let (channel, mut outbound, _inbound) = in_memory();
        let mesh = PeerMeshOrchestrator::new(channel, local_config()).unwrap();

        let session = mesh.enter(RoomId::generate(), &SyntheticDevices).await.unwrap();
        session.leave().await.unwrap();
        let room = RoomId::generate();
        let session = mesh.enter(room.clone(), &SyntheticDevices).await.unwrap();

        assert_eq!(session.room(), &room);
        let sent = joins_and_leaves(&mut outbound);
        assert_eq!(sent.last(), Some(&ClientEvent::Join { id: room }));
    }

    #[tokio::test]
    async fn test_media_failure_releases_room_slot() {
        let (channel, _outbound, _inbound) = in_memory();
        let config = MeshConfig {
            constraints: MediaConstraints {
                audio: false,
                video: false,
            },
            ..local_config()
        };
        let mesh = PeerMeshOrchestrator::new(channel, config).unwrap();

        assert!(mesh.enter(RoomId::generate(), &SyntheticDevices).await.is_err());
        assert_eq!(mesh.active_room(), None);
    }
}
