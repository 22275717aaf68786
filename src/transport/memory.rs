//! In-process mesh transport
//!
//! A loopback implementation of the transport traits: every joined peer
//! gets an mpsc inbound queue, sends are routed synchronously through a
//! shared room table. Used by integration tests to drive multiple engines
//! inside one process without sockets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::EngineError;

use super::{ConnectionState, InboundMessage, PeerEvent, PeerId, RoomHandle, RoomTransport};

const INBOUND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 64;

struct PeerPort {
    inbound: mpsc::Sender<InboundMessage>,
    events: broadcast::Sender<PeerEvent>,
}

#[derive(Default)]
struct MeshInner {
    /// room id -> connected peers
    rooms: Mutex<HashMap<String, HashMap<PeerId, PeerPort>>>,
}

/// Shared mesh. Clone-cheap; all clones route through the same rooms.
#[derive(Clone, Default)]
pub struct MemoryMesh {
    inner: Arc<MeshInner>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forcibly drop a peer from a room without it calling `leave`,
    /// simulating a silent disconnect. Remaining peers observe `Down`.
    pub fn kill_peer(&self, room_id: &str, peer: &PeerId) {
        let mut rooms = self.inner.rooms.lock().unwrap();
        if let Some(room) = rooms.get_mut(room_id) {
            if room.remove(peer).is_some() {
                for port in room.values() {
                    let _ = port.events.send(PeerEvent::Down(peer.clone()));
                }
            }
        }
    }
}

#[async_trait]
impl RoomTransport for MemoryMesh {
    async fn join(
        &self,
        _app_id: &str,
        room_id: &str,
    ) -> Result<(Arc<dyn RoomHandle>, mpsc::Receiver<InboundMessage>), EngineError> {
        let peer = PeerId(format!("mem-{}", uuid::Uuid::new_v4()));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE);

        {
            let mut rooms = self.inner.rooms.lock().unwrap();
            let room = rooms.entry(room_id.to_string()).or_default();
            // Announce both directions: existing peers see the newcomer,
            // the newcomer sees everyone already present.
            for (existing, port) in room.iter() {
                let _ = port.events.send(PeerEvent::Up(peer.clone()));
                let _ = events_tx.send(PeerEvent::Up(existing.clone()));
            }
            room.insert(
                peer.clone(),
                PeerPort {
                    inbound: inbound_tx,
                    events: events_tx.clone(),
                },
            );
        }
        debug!(%peer, room_id, "joined memory mesh");

        let handle = Arc::new(MemoryRoomHandle {
            mesh: self.inner.clone(),
            room_id: room_id.to_string(),
            peer,
            events: events_tx,
        });
        Ok((handle, inbound_rx))
    }
}

pub struct MemoryRoomHandle {
    mesh: Arc<MeshInner>,
    room_id: String,
    peer: PeerId,
    events: broadcast::Sender<PeerEvent>,
}

#[async_trait]
impl RoomHandle for MemoryRoomHandle {
    fn local_peer(&self) -> PeerId {
        self.peer.clone()
    }

    async fn send(
        &self,
        channel: &str,
        target: Option<&PeerId>,
        payload: Bytes,
    ) -> Result<(), EngineError> {
        let targets: Vec<mpsc::Sender<InboundMessage>> = {
            let rooms = self.mesh.rooms.lock().unwrap();
            let room = rooms
                .get(&self.room_id)
                .ok_or_else(|| EngineError::Transport("room no longer exists".into()))?;
            match target {
                Some(peer) => {
                    let port = room.get(peer).ok_or_else(|| {
                        EngineError::Transport(format!("peer {} not in room", peer))
                    })?;
                    vec![port.inbound.clone()]
                }
                None => room
                    .iter()
                    .filter(|(id, _)| **id != self.peer)
                    .map(|(_, p)| p.inbound.clone())
                    .collect(),
            }
        };

        for tx in targets {
            let msg = InboundMessage {
                channel: channel.to_string(),
                from: self.peer.clone(),
                payload: payload.clone(),
            };
            tx.send(msg)
                .await
                .map_err(|_| EngineError::Transport("peer inbound queue closed".into()))?;
        }
        Ok(())
    }

    fn peers(&self) -> Vec<(PeerId, ConnectionState)> {
        let rooms = self.mesh.rooms.lock().unwrap();
        rooms
            .get(&self.room_id)
            .map(|room| {
                room.keys()
                    .filter(|id| **id != self.peer)
                    .map(|id| (id.clone(), ConnectionState::Connected))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    async fn leave(&self) {
        let mut rooms = self.mesh.rooms.lock().unwrap();
        if let Some(room) = rooms.get_mut(&self.room_id) {
            room.remove(&self.peer);
            for port in room.values() {
                let _ = port.events.send(PeerEvent::Down(self.peer.clone()));
            }
            if room.is_empty() {
                rooms.remove(&self.room_id);
            }
        }
        debug!(peer = %self.peer, room = %self.room_id, "left memory mesh");
    }
}
