use crate::protocol::{PeerId, RoomId, ServerEvent};
use tokio::sync::mpsc;
use tracing::debug;

pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

/// Relay-side state of one open connection, created on connect and dropped
/// on disconnect.
#[derive(Debug)]
pub struct ConnectionSession {
    id: PeerId,
    room: Option<RoomId>,
    outbound: Outbound,
}

impl ConnectionSession {
    pub fn new(id: PeerId, outbound: Outbound) -> Self {
        Self {
            id,
            room: None,
            outbound,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub fn set_room(&mut self, room: Option<RoomId>) {
        self.room = room;
    }

    /// Best effort: a connection whose writer already went away just misses
    /// the event.
    pub fn emit(&self, event: ServerEvent) {
        if self.outbound.send(event).is_err() {
            debug!(peer_id = %self.id, "Dropping event for closed connection");
        }
    }
}
