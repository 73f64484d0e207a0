use crate::error::{Error, Result};
use crate::protocol::{ClientEvent, EventKind, RoomId, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Token returned by [`NegotiationChannel::on`], needed to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type HandlerTable = HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>;

/// Typed send/receive over the signaling transport.
///
/// Delivery and ordering come from the underlying channel; this layer adds
/// no retries. Cloning shares the same connection and handler table.
#[derive(Clone)]
pub struct NegotiationChannel {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    handlers: Arc<RwLock<HandlerTable>>,
    next_id: Arc<AtomicU64>,
    rooms: watch::Receiver<Option<Vec<RoomId>>>,
}

impl NegotiationChannel {
    /// Open a WebSocket to the relay.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<ServerEvent>();

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(event) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", event.name(), e);
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if incoming_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed frame: {}", e),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            debug!("Signaling connection closed");
        });

        Ok(Self::from_parts(outgoing_tx, incoming_rx))
    }

    /// Build a channel over an arbitrary ordered event transport.
    pub fn from_parts(
        outbound: mpsc::UnboundedSender<ClientEvent>,
        mut inbound: mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Self {
        let handlers: Arc<RwLock<HandlerTable>> = Arc::default();
        let (rooms_tx, rooms) = watch::channel(None);

        let table = Arc::clone(&handlers);
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                if let ServerEvent::ShareRooms { rooms } = &event {
                    rooms_tx.send_replace(Some(rooms.clone()));
                }
                let targets: Vec<EventHandler> = table
                    .read()
                    .get(&event.kind())
                    .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                    .unwrap_or_default();
                if targets.is_empty() {
                    debug!(kind = ?event.kind(), "No handler for event");
                }
                for handler in targets {
                    handler(&event);
                }
            }
        });

        Self {
            outbound,
            handlers,
            next_id: Arc::new(AtomicU64::new(1)),
            rooms,
        }
    }

    pub fn send(&self, event: ClientEvent) -> Result<()> {
        debug!(event = event.name(), "send");
        self.outbound.send(event).map_err(|_| Error::ChannelClosed)
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns false if the subscription was not registered.
    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut table = self.handlers.write();
        let Some(list) = table.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        let removed = list.len() != before;
        if list.is_empty() {
            table.remove(&kind);
        }
        removed
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Latest advertised room list, `None` until the first SHARE_ROOMS.
    pub fn rooms(&self) -> watch::Receiver<Option<Vec<RoomId>>> {
        self.rooms.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PeerId, RoomId};
    use std::time::Duration;
    use tokio::time::timeout;

    fn channel() -> (
        NegotiationChannel,
        mpsc::UnboundedReceiver<ClientEvent>,
        mpsc::UnboundedSender<ServerEvent>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (NegotiationChannel::from_parts(out_tx, in_rx), out_rx, in_tx)
    }

    #[tokio::test]
    async fn test_send_reaches_transport() {
        let (channel, mut out_rx, _in_tx) = channel();
        channel
            .send(ClientEvent::Join {
                id: RoomId::from("r"),
            })
            .unwrap();
        assert_eq!(
            out_rx.recv().await,
            Some(ClientEvent::Join {
                id: RoomId::from("r")
            })
        );
    }

    #[tokio::test]
    async fn test_handlers_receive_only_their_kind() {
        let (channel, _out_rx, in_tx) = channel();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        channel.on(EventKind::RemovePeer, move |event| {
            let _ = seen_tx.send(event.clone());
        });

        in_tx
            .send(ServerEvent::ShareRooms { rooms: vec![] })
            .unwrap();
        in_tx
            .send(ServerEvent::RemovePeer {
                peer_id: PeerId::from("p"),
            })
            .unwrap();

        let event = timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind(), EventKind::RemovePeer);
    }

    #[tokio::test]
    async fn test_off_removes_handler() {
        let (channel, _out_rx, _in_tx) = channel();
        let first = channel.on(EventKind::AddPeer, |_| {});
        let second = channel.on(EventKind::AddPeer, |_| {});
        assert_eq!(channel.handler_count(EventKind::AddPeer), 2);

        assert!(channel.off(EventKind::AddPeer, first));
        assert!(!channel.off(EventKind::AddPeer, first));
        assert!(!channel.off(EventKind::IceCandidate, second));
        assert_eq!(channel.handler_count(EventKind::AddPeer), 1);
        assert!(channel.off(EventKind::AddPeer, second));
        assert_eq!(channel.handler_count(EventKind::AddPeer), 0);
    }

    #[tokio::test]
    async fn test_send_after_transport_closed() {
        let (channel, out_rx, _in_tx) = channel();
        drop(out_rx);
        assert!(channel.is_closed());
        assert!(matches!(
            channel.send(ClientEvent::Leave),
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_room_list_is_cached() {
        let (channel, _out_rx, in_tx) = channel();
        let mut rooms = channel.rooms();
        assert!(rooms.borrow().is_none());

        in_tx
            .send(ServerEvent::ShareRooms {
                rooms: vec![RoomId::from("3fa85f64-5717-4562-b3fc-2c963f66afa6")],
            })
            .unwrap();

        let listed = timeout(Duration::from_secs(1), rooms.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(listed.map(|r| r.len()), Some(1));
        // no subscriber was registered for SHARE_ROOMS, the cache still fills
        assert_eq!(channel.handler_count(EventKind::ShareRooms), 0);
    }
}
