//! Transport boundary
//!
//! The engine consumes a pre-existing P2P layer as a black box: join/leave
//! a named room, observe peer connection state, and exchange named-channel
//! messages with at-least-once, unordered delivery. Everything above this
//! module is transport-agnostic; the libp2p adapter and the in-process
//! test mesh both implement the same pair of traits.

pub mod memory;
pub mod p2p;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::EngineError;

/// Opaque peer identifier, stable for the lifetime of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection state as reported by the transport's own bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Connecting,
    Disconnected,
}

/// Transport-native peer connection change. These are not fully reliable
/// for silent drops, which is why the membership tracker also polls.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Up(PeerId),
    Down(PeerId),
}

/// One inbound named-channel message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub from: PeerId,
    pub payload: Bytes,
}

/// Factory for joining rooms.
#[async_trait]
pub trait RoomTransport: Send + Sync + 'static {
    /// Join a named room. Failure is terminal for the caller; reconnection
    /// is a fresh `join`. Returns the room handle plus the single inbound
    /// message stream for this membership.
    async fn join(
        &self,
        app_id: &str,
        room_id: &str,
    ) -> Result<(std::sync::Arc<dyn RoomHandle>, mpsc::Receiver<InboundMessage>), EngineError>;
}

/// A live room membership.
#[async_trait]
pub trait RoomHandle: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Send a named-channel message to one peer, or to every connected
    /// peer when `target` is `None`. At-least-once, unordered.
    async fn send(
        &self,
        channel: &str,
        target: Option<&PeerId>,
        payload: Bytes,
    ) -> Result<(), EngineError>;

    /// Current connection state per known remote peer.
    fn peers(&self) -> Vec<(PeerId, ConnectionState)>;

    /// Subscribe to transport-native connection changes.
    fn peer_events(&self) -> broadcast::Receiver<PeerEvent>;

    /// Leave the room. In-flight outbound sends are discarded, not flushed.
    async fn leave(&self);
}
