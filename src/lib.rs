//! session-relay: host-authoritative session replication over a P2P mesh
//!
//! One host owns the canonical session document; clients receive tailored
//! state broadcasts and send discrete mutation requests back. The engine
//! layers, leaves first:
//!
//! - [`assets`]: content-addressable asset store with a per-peer
//!   knowledge ledger
//! - [`membership`]: room membership tracking (transport events + poll)
//! - [`guard`]: anomaly detection vetoing updates that look like data loss
//! - [`engine`]: the replication engine tying it all together
//!
//! The transport is consumed as a black box through [`transport`]; a
//! libp2p adapter and an in-process test mesh are provided.

pub mod assets;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod guard;
pub mod membership;
pub mod protocol;
pub mod storage;
pub mod transport;

pub use engine::{ConnectionStatus, EngineSettings, ReplicationEngine, Role, SessionHandle};
pub use error::EngineError;
