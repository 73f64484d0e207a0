//! The visible-client list and deferred media attachment.
//!
//! Media may become ready before whatever renders a client has bound a sink
//! for it. Attachments for an entry without a sink are queued and delivered
//! as soon as [`Roster::provide_sink`] is called for that entry.

use crate::protocol::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientId {
    Local,
    Remote(PeerId),
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientId::Local => write!(f, "LOCAL_VIDEO"),
            ClientId::Remote(peer_id) => write!(f, "{}", peer_id),
        }
    }
}

pub enum SinkMedia {
    /// The local capture. Sinks should not play its audio back.
    Local(Vec<Arc<TrackLocalStaticSample>>),
    Remote(Arc<TrackRemote>),
}

impl fmt::Debug for SinkMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkMedia::Local(tracks) => write!(f, "Local({} tracks)", tracks.len()),
            SinkMedia::Remote(track) => write!(f, "Remote({})", track.id()),
        }
    }
}

/// Rendering side of one roster entry.
pub trait MediaSink: Send + Sync {
    fn attach(&self, media: SinkMedia);
}

#[derive(Default)]
struct RosterState {
    entries: Vec<ClientId>,
    sinks: HashMap<ClientId, Arc<dyn MediaSink>>,
    pending: HashMap<ClientId, Vec<SinkMedia>>,
}

#[derive(Clone)]
pub struct Roster {
    state: Arc<Mutex<RosterState>>,
    changes: Arc<watch::Sender<Vec<ClientId>>>,
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

impl Roster {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(Vec::new());
        Self {
            state: Arc::default(),
            changes: Arc::new(changes),
        }
    }

    /// Add an entry if absent. Returns true if it was added.
    pub fn add(&self, id: ClientId) -> bool {
        let mut state = self.state.lock();
        if state.entries.contains(&id) {
            return false;
        }
        state.entries.push(id);
        self.changes.send_replace(state.entries.clone());
        true
    }

    /// Ensure the entry exists, then hand `media` to its sink now or once
    /// one is provided.
    pub fn attach(&self, id: ClientId, media: SinkMedia) {
        let sink = {
            let mut state = self.state.lock();
            if !state.entries.contains(&id) {
                state.entries.push(id.clone());
                self.changes.send_replace(state.entries.clone());
            }
            let bound = state.sinks.get(&id).cloned();
            match bound {
                Some(sink) => sink,
                None => {
                    state.pending.entry(id).or_default().push(media);
                    return;
                }
            }
        };
        sink.attach(media);
    }

    /// Bind the sink for an entry and flush anything queued for it.
    pub fn provide_sink(&self, id: ClientId, sink: Arc<dyn MediaSink>) {
        let queued = {
            let mut state = self.state.lock();
            state.sinks.insert(id.clone(), Arc::clone(&sink));
            state.pending.remove(&id).unwrap_or_default()
        };
        for media in queued {
            sink.attach(media);
        }
    }

    pub fn remove(&self, id: &ClientId) -> bool {
        let mut state = self.state.lock();
        state.sinks.remove(id);
        state.pending.remove(id);
        let before = state.entries.len();
        state.entries.retain(|entry| entry != id);
        let removed = state.entries.len() != before;
        if removed {
            self.changes.send_replace(state.entries.clone());
        }
        removed
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        *state = RosterState::default();
        self.changes.send_replace(Vec::new());
    }

    pub fn clients(&self) -> Vec<ClientId> {
        self.state.lock().entries.clone()
    }

    pub fn pending_count(&self, id: &ClientId) -> usize {
        self.state.lock().pending.get(id).map_or(0, Vec::len)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ClientId>> {
        self.changes.subscribe()
    }
}
