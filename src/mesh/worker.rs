//! Per-room event loop. Owns every [`PeerLink`] and applies relayed events
//! one at a time, so a link never has two local-description operations in
//! flight.

use super::link::PeerLink;
use super::monitor::LinkMonitor;
use super::roster::{ClientId, Roster};
use crate::protocol::{PeerId, ServerEvent};
use crate::signaling::NegotiationChannel;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Read-only view of the live links, shared with the session handle.
pub(crate) type LinkDirectory = Arc<RwLock<HashMap<PeerId, LinkMonitor>>>;

pub(crate) struct MeshWorker {
    api: Arc<API>,
    rtc_config: RTCConfiguration,
    channel: NegotiationChannel,
    roster: Roster,
    local_tracks: Vec<Arc<TrackLocalStaticSample>>,
    links: HashMap<PeerId, PeerLink>,
    directory: LinkDirectory,
}

impl MeshWorker {
    pub(crate) fn new(
        api: Arc<API>,
        rtc_config: RTCConfiguration,
        channel: NegotiationChannel,
        roster: Roster,
        local_tracks: Vec<Arc<TrackLocalStaticSample>>,
        directory: LinkDirectory,
    ) -> Self {
        Self {
            api,
            rtc_config,
            channel,
            roster,
            local_tracks,
            links: HashMap::new(),
            directory,
        }
    }

    /// Process events until `leave` fires or is dropped, then close every
    /// link. LEAVE and capture release are done by the session itself.
    pub(crate) async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ServerEvent>,
        mut leave: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = &mut leave => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        self.close_all().await;
        self.roster.clear();
        debug!("Room torn down");
    }

    pub(crate) async fn handle(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::AddPeer {
                peer_id,
                create_offer,
            } => self.add_peer(peer_id, create_offer).await,
            ServerEvent::SessionDescription {
                peer_id,
                session_description,
            } => self.session_description(peer_id, session_description).await,
            ServerEvent::IceCandidate {
                peer_id,
                ice_candidate,
            } => self.ice_candidate(peer_id, ice_candidate).await,
            ServerEvent::RemovePeer { peer_id } => self.remove_peer(&peer_id).await,
            ServerEvent::ShareRooms { .. } => {}
        }
    }

    async fn add_peer(&mut self, peer_id: PeerId, create_offer: bool) {
        if self.links.contains_key(&peer_id) {
            warn!(peer_id = %peer_id, "Peer already exists");
            return;
        }

        info!(peer_id = %peer_id, create_offer, "Adding new peer");
        let link = PeerLink::open(
            peer_id.clone(),
            &self.api,
            self.rtc_config.clone(),
            &self.local_tracks,
            self.channel.clone(),
            self.roster.clone(),
        )
        .await;
        let mut link = match link {
            Ok(link) => link,
            Err(e) => {
                error!(peer_id = %peer_id, "Failed to create peer connection: {}", e);
                return;
            }
        };
        self.directory
            .write()
            .insert(peer_id.clone(), link.monitor().clone());

        if create_offer {
            if let Err(e) = link.start_offer(&self.channel).await {
                error!(peer_id = %peer_id, "Failed to send offer: {}", e);
                link.monitor().set_error(e.to_string());
            }
        }
        self.links.insert(peer_id, link);
    }

    async fn session_description(&mut self, peer_id: PeerId, session_description: Value) {
        let Some(link) = self.links.get_mut(&peer_id) else {
            debug!(peer_id = %peer_id, "Session description for unknown peer");
            return;
        };
        let description: RTCSessionDescription = match serde_json::from_value(session_description) {
            Ok(description) => description,
            Err(e) => {
                warn!(peer_id = %peer_id, "Malformed session description: {}", e);
                return;
            }
        };
        if let Err(e) = link.apply_remote_description(description, &self.channel).await {
            error!(peer_id = %peer_id, "Error setting remote description: {}", e);
            link.monitor().set_error(e.to_string());
        }
    }

    async fn ice_candidate(&mut self, peer_id: PeerId, ice_candidate: Value) {
        let Some(link) = self.links.get_mut(&peer_id) else {
            debug!(peer_id = %peer_id, "ICE candidate for unknown peer");
            return;
        };
        let candidate: RTCIceCandidateInit = match serde_json::from_value(ice_candidate) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(peer_id = %peer_id, "Malformed ICE candidate: {}", e);
                return;
            }
        };
        if let Err(e) = link.apply_remote_candidate(candidate).await {
            warn!(peer_id = %peer_id, "Failed to add ICE candidate: {}", e);
        }
    }

    async fn remove_peer(&mut self, peer_id: &PeerId) {
        info!(peer_id = %peer_id, "Removing peer");
        if let Some(link) = self.links.remove(peer_id) {
            link.close().await;
        }
        self.directory.write().remove(peer_id);
        self.roster.remove(&ClientId::Remote(peer_id.clone()));
    }

    async fn close_all(&mut self) {
        let peers: Vec<PeerId> = self.links.keys().cloned().collect();
        for peer_id in peers {
            self.remove_peer(&peer_id).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn link(&self, peer_id: &PeerId) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }
}
