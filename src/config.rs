//! Engine configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::guard::GuardConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub room: RoomConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub p2p: P2pConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory for the asset and session databases.
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Application namespace on the transport.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Room to join.
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Delay before the first envelope to a freshly joined peer, letting
    /// the transport finish its handshake.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Retry delay when a peer joins before the canonical document is
    /// initialized. One retry only.
    #[serde(default = "default_deferred_retry")]
    pub deferred_retry_ms: u64,

    /// Membership poll interval.
    #[serde(default = "default_membership_poll")]
    pub membership_poll_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
            deferred_retry_ms: default_deferred_retry(),
            membership_poll_ms: default_membership_poll(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Listen addresses for the libp2p transport.
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,

    /// Enable mDNS local discovery.
    #[serde(default = "default_true")]
    pub mdns_enabled: bool,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            mdns_enabled: true,
        }
    }
}

fn default_app_id() -> String {
    "session-relay".to_string()
}
fn default_settle_delay() -> u64 {
    500
}
fn default_deferred_retry() -> u64 {
    3000
}
fn default_membership_poll() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_listen_addrs() -> Vec<String> {
    vec![
        "/ip4/0.0.0.0/tcp/4201".to_string(),
        "/ip4/0.0.0.0/udp/4201/quic-v1".to_string(),
    ]
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config at {}", path.display()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                data_dir: PathBuf::from("./session-relay-data"),
            },
            room: RoomConfig {
                app_id: default_app_id(),
                room_id: "default".to_string(),
            },
            replication: ReplicationConfig::default(),
            guard: GuardConfig::default(),
            p2p: P2pConfig::default(),
        }
    }
}
