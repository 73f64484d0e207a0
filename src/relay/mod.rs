//! Signaling relay: room membership plus targeted forwarding of negotiation
//! messages between connections.
//!
//! [`SignalingRelay`] is a plain state machine. It is owned by exactly one
//! dispatch task (see [`server`]) so every inbound event is applied to
//! completion, registry mutation and fan-out included, before the next one.

mod registry;
pub mod server;
mod session;

pub use registry::RoomRegistry;
pub use server::{RelayHandle, RelayServer};
pub use session::{ConnectionSession, Outbound};

use crate::protocol::{ClientEvent, PeerId, RoomId, ServerEvent};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct SignalingRelay {
    registry: RoomRegistry,
    sessions: HashMap<PeerId, ConnectionSession>,
}

impl SignalingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Register a freshly opened connection and hand it the current room list.
    pub fn connect(&mut self, id: PeerId, outbound: Outbound) {
        info!(peer_id = %id, "User connected");
        let session = ConnectionSession::new(id.clone(), outbound);
        session.emit(ServerEvent::ShareRooms {
            rooms: self.registry.list_advertisable_rooms(),
        });
        self.sessions.insert(id, session);
    }

    /// Transport closed. Performs the same cleanup as an explicit LEAVE.
    pub fn disconnect(&mut self, id: &PeerId) {
        if !self.sessions.contains_key(id) {
            return;
        }
        self.leave(id);
        self.sessions.remove(id);
        info!(peer_id = %id, "User disconnected");
    }

    pub fn handle(&mut self, id: &PeerId, event: ClientEvent) {
        if !self.sessions.contains_key(id) {
            debug!(peer_id = %id, event = event.name(), "Event from unknown connection");
            return;
        }
        match event {
            ClientEvent::Join { id: room } => self.join(id, room),
            ClientEvent::Leave => self.leave(id),
            ClientEvent::RelaySdp {
                peer_id,
                session_description,
            } => self.relay_sdp(id, &peer_id, session_description),
            ClientEvent::RelayIce {
                peer_id,
                ice_candidate,
            } => self.relay_ice(id, &peer_id, ice_candidate),
        }
    }

    fn join(&mut self, id: &PeerId, room: RoomId) {
        let current = self.sessions.get(id).and_then(|s| s.room().cloned());
        match current {
            Some(ref current) if *current == room => {
                debug!(peer_id = %id, room_id = %room, "Already in room");
                return;
            }
            Some(_) => self.leave(id),
            None => {}
        }

        info!(peer_id = %id, room_id = %room, "join room");
        self.registry.join(id, &room);
        if let Some(session) = self.sessions.get_mut(id) {
            session.set_room(Some(room.clone()));
        }
        self.share_rooms();

        let clients = self.registry.members_of(&room);
        debug!(room_id = %room, ?clients, "clients");
        for member in clients.iter().filter(|member| *member != id) {
            self.emit(
                member,
                ServerEvent::AddPeer {
                    peer_id: id.clone(),
                    create_offer: false,
                },
            );
            self.emit(
                id,
                ServerEvent::AddPeer {
                    peer_id: member.clone(),
                    create_offer: true,
                },
            );
        }
    }

    fn leave(&mut self, id: &PeerId) {
        let Some(room) = self.sessions.get_mut(id).and_then(|s| {
            let room = s.room().cloned();
            s.set_room(None);
            room
        }) else {
            return;
        };

        info!(peer_id = %id, room_id = %room, "leave room");
        for member in self.registry.members_of(&room) {
            if member == *id {
                continue;
            }
            self.emit(
                &member,
                ServerEvent::RemovePeer {
                    peer_id: id.clone(),
                },
            );
            self.emit(id, ServerEvent::RemovePeer { peer_id: member });
        }

        self.registry.leave(id, &room);
        self.share_rooms();
    }

    fn relay_sdp(&self, from: &PeerId, to: &PeerId, session_description: Value) {
        self.emit(
            to,
            ServerEvent::SessionDescription {
                peer_id: from.clone(),
                session_description,
            },
        );
    }

    fn relay_ice(&self, from: &PeerId, to: &PeerId, ice_candidate: Value) {
        self.emit(
            to,
            ServerEvent::IceCandidate {
                peer_id: from.clone(),
                ice_candidate,
            },
        );
    }

    fn share_rooms(&self) {
        let rooms = self.registry.list_advertisable_rooms();
        for session in self.sessions.values() {
            session.emit(ServerEvent::ShareRooms {
                rooms: rooms.clone(),
            });
        }
    }

    fn emit(&self, to: &PeerId, event: ServerEvent) {
        match self.sessions.get(to) {
            Some(session) => session.emit(event),
            None => debug!(peer_id = %to, "Dropping event for unknown peer"),
        }
    }
}
