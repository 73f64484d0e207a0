//! WebSocket front end of the relay.
//!
//! Each accepted socket gets its own task. Inbound frames are decoded and
//! forwarded as commands to the single dispatch task that owns the
//! [`SignalingRelay`].

use super::SignalingRelay;
use crate::error::Result;
use crate::protocol::{ClientEvent, PeerId, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
enum RelayCommand {
    Connect {
        id: PeerId,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    },
    Event {
        id: PeerId,
        event: ClientEvent,
    },
    Disconnect {
        id: PeerId,
    },
}

/// Cloneable entry point into the dispatch task.
#[derive(Clone, Debug)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayCommand>,
}

impl RelayHandle {
    /// Move `relay` into a dispatch task. The task ends once every handle
    /// has been dropped.
    pub fn spawn(relay: SignalingRelay) -> (Self, JoinHandle<SignalingRelay>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut relay = relay;
            while let Some(command) = rx.recv().await {
                match command {
                    RelayCommand::Connect { id, outbound } => relay.connect(id, outbound),
                    RelayCommand::Event { id, event } => relay.handle(&id, event),
                    RelayCommand::Disconnect { id } => relay.disconnect(&id),
                }
            }
            relay
        });
        (Self { tx }, task)
    }

    /// Open a new logical connection. Returns its assigned id and the stream
    /// of events addressed to it.
    pub fn connect(&self) -> (PeerId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = PeerId::generate();
        let (outbound, rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(RelayCommand::Connect {
            id: id.clone(),
            outbound,
        });
        (id, rx)
    }

    pub fn event(&self, id: &PeerId, event: ClientEvent) {
        let _ = self.tx.send(RelayCommand::Event {
            id: id.clone(),
            event,
        });
    }

    pub fn disconnect(&self, id: &PeerId) {
        let _ = self.tx.send(RelayCommand::Disconnect { id: id.clone() });
    }
}

pub struct RelayServer {
    listener: TcpListener,
    handle: RelayHandle,
}

impl RelayServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (handle, _dispatch) = RelayHandle::spawn(SignalingRelay::new());
        Ok(Self { listener, handle })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        info!("Signaling relay listening on {}", self.listener.local_addr()?);
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let handle = self.handle.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handle).await {
                    warn!("Connection from {} ended with error: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, handle: RelayHandle) -> Result<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (id, mut events) = handle.connect();
    info!(peer_id = %id, "New WebSocket connection from: {}", addr);

    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!(peer_id = %writer_id, "Failed to encode event: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                debug!(peer_id = %writer_id, "Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => handle.event(&id, event),
                Err(e) => warn!(peer_id = %id, "Ignoring malformed frame: {}", e),
            },
            Ok(Message::Close(_)) => {
                info!(peer_id = %id, "WebSocket connection closed by client");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(peer_id = %id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    // Dropping the session on the dispatch side closes `events`, which ends
    // the writer once the last REMOVE_PEER notices have been flushed.
    handle.disconnect(&id);
    let _ = writer.await;
    Ok(())
}
