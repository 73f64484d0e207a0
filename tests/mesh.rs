use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc_mesh::mesh::{ClientId, LinkState};
use webrtc_mesh::{
    MeshConfig, NegotiationChannel, PeerMeshOrchestrator, RelayServer, RoomId, RoomSession,
    SyntheticDevices,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_relay() -> String {
    init_tracing();
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    format!("ws://{}", addr)
}

async fn orchestrator(url: &str) -> PeerMeshOrchestrator {
    let channel = NegotiationChannel::connect(url).await.unwrap();
    let config = MeshConfig {
        ice_servers: Vec::new(),
        ..Default::default()
    };
    PeerMeshOrchestrator::new(channel, config).unwrap()
}

async fn wait_until<F>(what: &str, mut ready: F)
where
    F: FnMut() -> bool,
{
    let polled = timeout(Duration::from_secs(20), async {
        while !ready() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

fn connected(session: &RoomSession) -> bool {
    let peers = session.peers();
    peers.len() == 1
        && session.link_status(&peers[0]).is_some_and(|status| {
            status.state == LinkState::Connected
                && status.signaling_state == RTCSignalingState::Stable
                && status.last_error.is_none()
        })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_clients_connect_one_link() {
    let url = start_relay().await;
    let room = RoomId::generate();
    let first = orchestrator(&url).await;
    let second = orchestrator(&url).await;

    let first_session = first.enter(room.clone(), &SyntheticDevices).await.unwrap();
    let second_session = second.enter(room, &SyntheticDevices).await.unwrap();

    wait_until("both links to connect", || {
        connected(&first_session) && connected(&second_session)
    })
    .await;

    let first_peer = first_session.peers()[0].clone();
    let second_peer = second_session.peers()[0].clone();
    assert_ne!(first_peer, second_peer);
    assert!(first_session
        .roster()
        .clients()
        .contains(&ClientId::Local));

    second_session.leave().await.unwrap();
    wait_until("the departed peer to be removed", || {
        first_session.peers().is_empty()
    })
    .await;
    assert!(!first_session
        .roster()
        .clients()
        .contains(&ClientId::Remote(first_peer)));

    first_session.leave().await.unwrap();
}
