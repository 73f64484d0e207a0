use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use webrtc_mesh::config::{DEFAULT_SIGNALING_URL, DEFAULT_STUN_SERVER};
use webrtc_mesh::mesh::{ClientId, MediaSink, SinkMedia};
use webrtc_mesh::{
    MediaConstraints, MediaDevices, MeshConfig, NegotiationChannel, PeerMeshOrchestrator, RoomId,
    RoomSession, SyntheticDevices,
};

const ROOM_LIST_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about = "Full-mesh WebRTC room client", long_about = None)]
struct Args {
    /// WebSocket address of the signaling relay.
    #[arg(long, env = "MESH_SIGNALING_URL", default_value = DEFAULT_SIGNALING_URL)]
    signaling_url: String,
    /// STUN servers, comma separated. Pass an empty value for host candidates only.
    #[arg(
        long = "stun",
        env = "MESH_STUN_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_SERVER
    )]
    stun_servers: Vec<String>,
    /// Don't capture audio.
    #[arg(long)]
    no_audio: bool,
    /// Don't send video.
    #[arg(long)]
    no_video: bool,
    /// Send silence instead of opening the microphone.
    #[arg(long)]
    synthetic_media: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the rooms the relay advertises.
    Rooms,
    /// Create a new advertised room and join it.
    Create,
    /// Join an existing room.
    Join { room: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,webrtc=warn")),
        )
        .init();

    let args = Args::parse();
    let channel = NegotiationChannel::connect(&args.signaling_url)
        .await
        .with_context(|| format!("failed to connect to {}", args.signaling_url))?;
    info!("Connected to signaling relay at {}", args.signaling_url);

    let room = match &args.command {
        Command::Rooms => return list_rooms(&channel).await,
        Command::Create => {
            let room = RoomId::generate();
            println!("{}", room);
            room
        }
        Command::Join { room } => RoomId::from(room.as_str()),
    };

    let config = MeshConfig {
        ice_servers: args
            .stun_servers
            .iter()
            .filter(|url| !url.is_empty())
            .cloned()
            .collect(),
        constraints: MediaConstraints {
            audio: !args.no_audio,
            video: !args.no_video,
        },
    };
    let devices = media_devices(args.synthetic_media);
    let mesh = PeerMeshOrchestrator::new(channel, config)?;
    let session = mesh.enter(room, devices.as_ref()).await?;
    info!(room = %session.room(), "Entered room, press Ctrl+C to leave");

    run_until_interrupted(&session).await;
    session.leave().await?;
    info!("Left room");
    Ok(())
}

async fn list_rooms(channel: &NegotiationChannel) -> Result<()> {
    let mut rooms = channel.rooms();
    let rooms = match timeout(ROOM_LIST_TIMEOUT, rooms.wait_for(Option::is_some)).await {
        Ok(Ok(rooms)) => rooms.clone().unwrap_or_default(),
        Ok(Err(_)) => bail!("signaling connection closed"),
        Err(_) => bail!("relay did not share its room list"),
    };
    if rooms.is_empty() {
        println!("No open rooms");
    }
    for room in rooms {
        println!("{}", room);
    }
    Ok(())
}

#[cfg(feature = "capture")]
fn media_devices(synthetic: bool) -> Box<dyn MediaDevices> {
    if synthetic {
        Box::new(SyntheticDevices)
    } else {
        Box::new(webrtc_mesh::audio::HostDevices)
    }
}

#[cfg(not(feature = "capture"))]
fn media_devices(synthetic: bool) -> Box<dyn MediaDevices> {
    if !synthetic {
        tracing::warn!("Built without the capture feature, sending synthetic media");
    }
    Box::new(SyntheticDevices)
}

async fn run_until_interrupted(session: &RoomSession) {
    let mut roster = session.roster().subscribe();
    let mut visible = HashSet::new();
    let clients = roster.borrow_and_update().clone();
    bind_sinks(session, &clients, &mut visible);

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                let clients = roster.borrow_and_update().clone();
                bind_sinks(session, &clients, &mut visible);
            }
            _ = status.tick() => {
                for peer_id in session.peers() {
                    if let Some(link) = session.link_status(&peer_id) {
                        info!(
                            peer_id = %peer_id,
                            state = %link.state,
                            ice = %link.ice_state,
                            error = ?link.last_error,
                            "Link status"
                        );
                    }
                }
            }
        }
    }
}

fn bind_sinks(session: &RoomSession, clients: &[ClientId], visible: &mut HashSet<ClientId>) {
    for id in clients {
        if visible.insert(id.clone()) {
            info!(client = %id, "Client visible");
            session
                .roster()
                .provide_sink(id.clone(), Arc::new(PacketCounter { client: id.clone() }));
        }
    }
    visible.retain(|id| {
        let present = clients.contains(id);
        if !present {
            info!(client = %id, "Client gone");
        }
        present
    });
}

/// Drains remote tracks and reports how much media arrived.
struct PacketCounter {
    client: ClientId,
}

impl MediaSink for PacketCounter {
    fn attach(&self, media: SinkMedia) {
        match media {
            SinkMedia::Local(tracks) => {
                debug!(client = %self.client, "Local preview with {} tracks", tracks.len());
            }
            SinkMedia::Remote(track) => {
                let client = self.client.clone();
                tokio::spawn(async move {
                    let kind = track.kind();
                    let mut packets = 0u64;
                    while track.read_rtp().await.is_ok() {
                        packets += 1;
                        if packets % 500 == 0 {
                            debug!(client = %client, %kind, packets, "Receiving media");
                        }
                    }
                    info!(client = %client, %kind, packets, "Remote track ended");
                });
            }
        }
    }
}
