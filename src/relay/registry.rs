use crate::protocol::{PeerId, RoomId};
use std::collections::{BTreeMap, BTreeSet};

/// Room membership bookkeeping.
///
/// A connection belongs to at most one room at a time and a room only exists
/// while it has members.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: BTreeMap<RoomId, BTreeSet<PeerId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to `room`, dropping it from any other room first.
    /// Returns the room it was moved out of, if any.
    pub fn join(&mut self, connection: &PeerId, room: &RoomId) -> Option<RoomId> {
        let previous = self
            .room_of(connection)
            .filter(|current| *current != room)
            .cloned();
        if let Some(ref previous) = previous {
            self.leave(connection, previous);
        }

        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(connection.clone());
        previous
    }

    /// Remove `connection` from `room`. Returns false if it was not a member.
    pub fn leave(&mut self, connection: &PeerId, room: &RoomId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(connection);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    pub fn members_of(&self, room: &RoomId) -> Vec<PeerId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_of(&self, connection: &PeerId) -> Option<&RoomId> {
        self.rooms
            .iter()
            .find(|(_, members)| members.contains(connection))
            .map(|(room, _)| room)
    }

    /// Rooms published to clients. Unlisted ids are filtered out, never
    /// reported as errors.
    pub fn list_advertisable_rooms(&self) -> Vec<RoomId> {
        self.rooms
            .keys()
            .filter(|room| room.is_advertisable())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
