use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offering,
    Answering,
}

/// Lifecycle of one peer link. `New` is only ever the initial state and
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Negotiating(NegotiationRole),
    Connected,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::New => write!(f, "new"),
            LinkState::Negotiating(NegotiationRole::Offering) => write!(f, "offering"),
            LinkState::Negotiating(NegotiationRole::Answering) => write!(f, "answering"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub state: LinkState,
    pub signaling_state: RTCSignalingState,
    pub ice_state: RTCIceConnectionState,
    pub peer_state: RTCPeerConnectionState,
    pub last_error: Option<String>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: LinkState::New,
            signaling_state: RTCSignalingState::Stable,
            ice_state: RTCIceConnectionState::New,
            peer_state: RTCPeerConnectionState::New,
            last_error: None,
        }
    }
}

/// Shared view of a link's status. Updated from the peer connection
/// callbacks and from the mesh worker.
#[derive(Clone)]
pub struct LinkMonitor {
    status: Arc<watch::Sender<LinkStatus>>,
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMonitor {
    pub fn new() -> Self {
        let (status, _) = watch::channel(LinkStatus::default());
        Self {
            status: Arc::new(status),
        }
    }

    pub fn state(&self) -> LinkState {
        self.status.borrow().state
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    /// Move out of `New`. Returns false if negotiation already started.
    pub fn begin_negotiation(&self, role: NegotiationRole) -> bool {
        self.status.send_if_modified(|status| {
            if status.state == LinkState::New {
                status.state = LinkState::Negotiating(role);
                true
            } else {
                false
            }
        })
    }

    pub fn update_signaling_state(&self, state: RTCSignalingState) {
        self.status.send_modify(|status| {
            status.signaling_state = state;
        });
    }

    pub fn update_ice_state(&self, state: RTCIceConnectionState) {
        self.status.send_modify(|status| {
            status.ice_state = state;
            if state == RTCIceConnectionState::Failed {
                status.last_error = Some("ICE connection failed".to_owned());
            }
        });
    }

    pub fn update_peer_state(&self, state: RTCPeerConnectionState) {
        self.status.send_modify(|status| {
            status.peer_state = state;
            match state {
                RTCPeerConnectionState::Connected
                    if matches!(status.state, LinkState::Negotiating(_)) =>
                {
                    status.state = LinkState::Connected;
                }
                RTCPeerConnectionState::Failed => {
                    status.last_error = Some("peer connection failed".to_owned());
                }
                _ => {}
            }
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
        });
    }

    pub fn close(&self) {
        self.status.send_modify(|status| {
            status.state = LinkState::Closed;
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }
}
