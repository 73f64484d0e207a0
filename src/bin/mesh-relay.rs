use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use webrtc_mesh::config::DEFAULT_RELAY_ADDRESS;
use webrtc_mesh::{RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Signaling relay for full-mesh WebRTC rooms", long_about = None)]
struct Args {
    /// Address to accept WebSocket connections on.
    #[arg(long, env = "MESH_RELAY_ADDRESS", default_value = DEFAULT_RELAY_ADDRESS)]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = RelayConfig {
        bind_address: args.bind,
    };
    let server = RelayServer::bind(&config.bind_address).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
