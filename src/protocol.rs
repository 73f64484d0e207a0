//! Wire events exchanged between clients and the signaling relay.
//!
//! Every frame is a JSON object `{"action": "<EVENT>", "payload": {...}}`.
//! Session descriptions and ICE candidates are carried as opaque JSON values
//! so the relay never has to understand them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::{Uuid, Variant, Version};

/// Relay-assigned identity of one transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Fresh connection id. Rendered unhyphenated so it can never be
    /// mistaken for an advertisable room id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-chosen room identifier. Any string may be joined, only random
/// (v4) UUIDs are advertised.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// A brand-new public room.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id is a hyphenated RFC 4122 version 4 UUID.
    pub fn is_advertisable(&self) -> bool {
        if self.0.len() != 36 {
            return false;
        }
        match Uuid::parse_str(&self.0) {
            Ok(uuid) => {
                uuid.get_version() == Some(Version::Random)
                    && uuid.get_variant() == Variant::RFC4122
            }
            Err(_) => false,
        }
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client to relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    Join {
        id: RoomId,
    },
    Leave,
    RelaySdp {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(rename = "sessionDescription")]
        session_description: Value,
    },
    RelayIce {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(rename = "iceCandidate")]
        ice_candidate: Value,
    },
}

/// Relay to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    ShareRooms {
        rooms: Vec<RoomId>,
    },
    AddPeer {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(rename = "createOffer")]
        create_offer: bool,
    },
    RemovePeer {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    SessionDescription {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(rename = "sessionDescription")]
        session_description: Value,
    },
    IceCandidate {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(rename = "iceCandidate")]
        ice_candidate: Value,
    },
}

/// Discriminant of a [`ServerEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ShareRooms,
    AddPeer,
    RemovePeer,
    SessionDescription,
    IceCandidate,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ShareRooms { .. } => EventKind::ShareRooms,
            Self::AddPeer { .. } => EventKind::AddPeer,
            Self::RemovePeer { .. } => EventKind::RemovePeer,
            Self::SessionDescription { .. } => EventKind::SessionDescription,
            Self::IceCandidate { .. } => EventKind::IceCandidate,
        }
    }
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "JOIN",
            Self::Leave => "LEAVE",
            Self::RelaySdp { .. } => "RELAY_SDP",
            Self::RelayIce { .. } => "RELAY_ICE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_shape() {
        let event = ClientEvent::Join {
            id: RoomId::from("lobby"),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"action": "JOIN", "payload": {"id": "lobby"}})
        );
    }

    #[test]
    fn test_leave_without_payload() {
        let event: ClientEvent = serde_json::from_str(r#"{"action":"LEAVE"}"#).unwrap();
        assert_eq!(event, ClientEvent::Leave);
    }

    #[test]
    fn test_add_peer_uses_browser_field_names() {
        let event = ServerEvent::AddPeer {
            peer_id: PeerId::from("abc"),
            create_offer: true,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"action": "ADD_PEER", "payload": {"peerId": "abc", "createOffer": true}})
        );
        assert_eq!(event.kind(), EventKind::AddPeer);
    }

    #[test]
    fn test_relay_sdp_payload_is_opaque() {
        let raw = concat!(
            r#"{"action":"RELAY_SDP","payload":{"peerId":"p1","#,
            r#""sessionDescription":{"type":"offer","sdp":"v=0","extra":[1,2]}}}"#
        );
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::RelaySdp {
                peer_id,
                session_description,
            } => {
                assert_eq!(peer_id.as_str(), "p1");
                assert_eq!(session_description["extra"], json!([1, 2]));
            }
            other => panic!("Expected RelaySdp, got {:?}", other),
        }
    }

    #[test]
    fn test_room_advertisable_only_for_v4_uuid() {
        assert!(RoomId::from("3fa85f64-5717-4562-b3fc-2c963f66afa6").is_advertisable());
        assert!(RoomId::generate().is_advertisable());
        assert!(!RoomId::from("not-a-uuid").is_advertisable());
        // version 1
        assert!(!RoomId::from("6ba7b810-9dad-11d1-80b4-00c04fd430c8").is_advertisable());
        // simple form of a v4 uuid
        assert!(!RoomId::from("3fa85f6457174562b3fc2c963f66afa6").is_advertisable());
    }

    #[test]
    fn test_peer_ids_are_never_advertisable() {
        let peer = PeerId::generate();
        assert!(!RoomId::from(peer.as_str()).is_advertisable());
        assert_ne!(peer, PeerId::generate());
    }
}
