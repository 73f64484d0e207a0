use super::monitor::{LinkMonitor, LinkState, NegotiationRole};
use super::roster::{ClientId, Roster, SinkMedia};
use crate::error::Result;
use crate::protocol::{ClientEvent, PeerId};
use crate::signaling::NegotiationChannel;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Local state for one remote participant: the peer connection, its
/// negotiation status and any remote candidates that arrived too early.
pub struct PeerLink {
    peer_id: PeerId,
    peer_connection: Arc<RTCPeerConnection>,
    monitor: LinkMonitor,
    pending_candidates: Vec<RTCIceCandidateInit>,
    has_remote_description: bool,
}

impl PeerLink {
    /// Create the connection, wire its observers and attach every local
    /// track. No negotiation is started here.
    pub async fn open(
        peer_id: PeerId,
        api: &API,
        config: RTCConfiguration,
        local_tracks: &[Arc<TrackLocalStaticSample>],
        channel: NegotiationChannel,
        roster: Roster,
    ) -> Result<Self> {
        let monitor = LinkMonitor::new();
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let ice_peer = peer_id.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let peer_id = ice_peer.clone();
            let channel = channel.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(peer_id = %peer_id, "ICE gathering complete");
                    return;
                };
                let relayed = candidate
                    .to_json()
                    .map_err(crate::error::Error::from)
                    .and_then(|init| Ok(serde_json::to_value(init)?))
                    .and_then(|ice_candidate| {
                        channel.send(ClientEvent::RelayIce {
                            peer_id: peer_id.clone(),
                            ice_candidate,
                        })
                    });
                match relayed {
                    Ok(()) => debug!(peer_id = %peer_id, "ICE candidate relayed"),
                    Err(e) => debug!(peer_id = %peer_id, "Failed to relay ICE candidate: {}", e),
                }
            })
        }));

        let track_peer = peer_id.clone();
        let track_monitor = monitor.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                info!(peer_id = %track_peer, kind = ?track.kind(), "Remote track arrived");
                let media = SinkMedia::Remote(track);
                deliver_remote(&track_monitor, &roster, &track_peer, media);
                Box::pin(async {})
            },
        ));

        let state_monitor = monitor.clone();
        let state_peer = peer_id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                state_monitor.update_peer_state(s);
                debug!(peer_id = %state_peer, "Connection state changed: {}", s);
                if s == RTCPeerConnectionState::Failed {
                    error!(peer_id = %state_peer, "Connection failed for peer");
                }
                Box::pin(async {})
            },
        ));

        let ice_monitor = monitor.clone();
        let ice_state_peer = peer_id.clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |s: RTCIceConnectionState| {
                ice_monitor.update_ice_state(s);
                debug!(peer_id = %ice_state_peer, "ICE state changed: {}", s);
                if s == RTCIceConnectionState::Failed {
                    warn!(peer_id = %ice_state_peer, "ICE connection failed for peer");
                }
                Box::pin(async {})
            },
        ));

        let signaling_monitor = monitor.clone();
        peer_connection.on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
            signaling_monitor.update_signaling_state(s);
            Box::pin(async {})
        }));

        for track in local_tracks {
            peer_connection
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }

        Ok(Self {
            peer_id,
            peer_connection,
            monitor,
            pending_candidates: Vec::new(),
            has_remote_description: false,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn state(&self) -> LinkState {
        self.monitor.state()
    }

    pub fn monitor(&self) -> &LinkMonitor {
        &self.monitor
    }

    /// Offerer side: synthesize the local offer and relay it.
    pub async fn start_offer(&mut self, channel: &NegotiationChannel) -> Result<()> {
        if !self.monitor.begin_negotiation(NegotiationRole::Offering) {
            warn!(peer_id = %self.peer_id, state = %self.state(), "Negotiation already started");
            return Ok(());
        }
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        channel.send(ClientEvent::RelaySdp {
            peer_id: self.peer_id.clone(),
            session_description: serde_json::to_value(&offer)?,
        })?;
        info!(peer_id = %self.peer_id, "Offer sent");
        Ok(())
    }

    /// Apply a remote description. Offers are answered and the answer is
    /// relayed back; answers complete the exchange.
    pub async fn apply_remote_description(
        &mut self,
        description: RTCSessionDescription,
        channel: &NegotiationChannel,
    ) -> Result<()> {
        let is_offer = description.sdp_type == RTCSdpType::Offer;
        if is_offer {
            match self.state() {
                LinkState::Negotiating(NegotiationRole::Offering) => {
                    warn!(peer_id = %self.peer_id, "Dropping offer received while offering");
                    return Ok(());
                }
                LinkState::New => {
                    self.monitor.begin_negotiation(NegotiationRole::Answering);
                }
                _ => {}
            }
        }

        let sdp_type = description.sdp_type;
        self.peer_connection
            .set_remote_description(description)
            .await?;
        self.has_remote_description = true;
        debug!(peer_id = %self.peer_id, "Set remote description: {}", sdp_type);
        self.flush_candidates().await;

        if is_offer {
            let answer = self.peer_connection.create_answer(None).await?;
            self.peer_connection
                .set_local_description(answer.clone())
                .await?;
            channel.send(ClientEvent::RelaySdp {
                peer_id: self.peer_id.clone(),
                session_description: serde_json::to_value(&answer)?,
            })?;
            info!(peer_id = %self.peer_id, "Answer sent");
        }
        Ok(())
    }

    /// Candidates that beat the remote description are held until it lands.
    pub async fn apply_remote_candidate(&mut self, candidate: RTCIceCandidateInit) -> Result<()> {
        if !self.has_remote_description {
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    async fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.peer_connection.add_ice_candidate(candidate).await {
                warn!(peer_id = %self.peer_id, "Failed to apply buffered ICE candidate: {}", e);
            }
        }
    }

    pub async fn close(self) {
        self.monitor.close();
        if let Err(e) = self.peer_connection.close().await {
            debug!(peer_id = %self.peer_id, "Error closing peer connection: {}", e);
        }
    }
}

/// Hand remote media to the roster unless the link was already closed, so a
/// late track cannot bring back a removed peer.
fn deliver_remote(
    monitor: &LinkMonitor,
    roster: &Roster,
    peer_id: &PeerId,
    media: SinkMedia,
) -> bool {
    if monitor.state() == LinkState::Closed {
        debug!(peer_id = %peer_id, "Ignoring track for closed link");
        return false;
    }
    roster.attach(ClientId::Remote(peer_id.clone()), media);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_for_open_link_is_attached() {
        let monitor = LinkMonitor::new();
        let roster = Roster::new();
        let peer = PeerId::from("remote");

        assert!(deliver_remote(&monitor, &roster, &peer, SinkMedia::Local(Vec::new())));
        assert_eq!(roster.clients(), vec![ClientId::Remote(peer.clone())]);
        assert_eq!(roster.pending_count(&ClientId::Remote(peer)), 1);
    }

    #[test]
    fn test_track_after_close_does_not_revive_peer() {
        let monitor = LinkMonitor::new();
        let roster = Roster::new();
        let peer = PeerId::from("remote");
        roster.add(ClientId::Local);
        monitor.close();

        assert!(!deliver_remote(&monitor, &roster, &peer, SinkMedia::Local(Vec::new())));
        assert_eq!(roster.clients(), vec![ClientId::Local]);
        assert_eq!(roster.pending_count(&ClientId::Remote(peer)), 0);
    }
}
