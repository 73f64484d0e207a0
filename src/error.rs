use crate::protocol::RoomId;
use anyhow::Error as AnyhowError;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Local capture could not be started (permission denied, no device).
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// The orchestrator already has a live session in this room.
    #[error("already in room {0}")]
    AlreadyInRoom(RoomId),

    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("Other error: {0}")]
    Other(#[from] AnyhowError),
}

pub type Result<T> = std::result::Result<T, Error>;
