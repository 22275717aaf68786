//! session-relay: run a replication node for one room.
//!
//! The host owns the canonical session document and serves it to every
//! client in the room; clients mirror it. Ctrl-C persists (host) and
//! leaves cleanly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use session_relay::assets::policy::PassthroughTranscoder;
use session_relay::assets::AssetStore;
use session_relay::config::Config;
use session_relay::storage::SessionStore;
use session_relay::transport::p2p::P2pTransport;
use session_relay::{EngineSettings, ReplicationEngine, Role};

#[derive(Parser)]
#[command(name = "session-relay")]
#[command(about = "Host-authoritative session replication over a P2P mesh")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "session-relay.toml")]
    config: String,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "SESSION_RELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Room to join (overrides config file)
    #[arg(long, env = "SESSION_RELAY_ROOM")]
    room: Option<String>,

    /// Join as a client instead of hosting
    #[arg(long)]
    client: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_relay=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = PathBuf::from(&cli.config);
    let mut config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        info!(path = %config_path.display(), "No config file, using defaults");
        Config::default()
    };
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(room) = cli.room {
        config.room.room_id = room;
    }

    let role = if cli.client { Role::Client } else { Role::Host };
    info!(room = %config.room.room_id, ?role, "Starting session-relay");

    let assets = Arc::new(
        AssetStore::open(&config.node.data_dir, Box::new(PassthroughTranscoder))
            .context("opening asset store")?,
    );
    let sessions = match role {
        Role::Host => Some(Arc::new(
            SessionStore::open(&config.node.data_dir).context("opening session store")?,
        )),
        Role::Client => None,
    };
    let transport = Arc::new(P2pTransport::new(config.p2p.clone()));

    let handle = ReplicationEngine::start(
        transport,
        assets,
        sessions,
        EngineSettings {
            role,
            app_id: config.room.app_id.clone(),
            room_id: config.room.room_id.clone(),
            replication: config.replication.clone(),
            guard: config.guard.clone(),
        },
    )
    .await
    .context("starting replication engine")?;

    info!(peer = %handle.local_peer(), "Engine running, Ctrl-C to leave");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    info!("Shutting down");
    handle.leave().await.context("leaving room")?;
    Ok(())
}
