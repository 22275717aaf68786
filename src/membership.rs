//! Room membership tracking
//!
//! Maintains one deduplicated "currently connected" set per room from two
//! sources: transport-native connection events and a short-interval poll
//! of the transport's connection table. The transport's own events are
//! not fully reliable for silent drops, so the poll is authoritative and
//! the events merely shorten detection latency. Every actual change
//! produces exactly one `Changed` emission with the full new set.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::transport::{ConnectionState, PeerEvent, PeerId, RoomHandle};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    /// Full connected set after a change. Also emitted once, empty, on
    /// `stop`.
    Changed(Vec<PeerId>),
}

pub struct MembershipTracker {
    events: broadcast::Sender<MembershipEvent>,
    connected: Arc<Mutex<BTreeSet<PeerId>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl MembershipTracker {
    /// Start tracking membership for a joined room.
    pub fn start(room: Arc<dyn RoomHandle>, poll_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let connected = Arc::new(Mutex::new(BTreeSet::new()));

        let task = tokio::spawn(run_poll(
            room,
            poll_interval,
            connected.clone(),
            events.clone(),
        ));

        Self {
            events,
            connected,
            poll_task: Mutex::new(Some(task)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the current connected set.
    pub fn current(&self) -> Vec<PeerId> {
        self.connected.lock().unwrap().iter().cloned().collect()
    }

    /// Cancel the poll and clear the set with a final empty `Changed`.
    pub fn stop(&self) {
        if let Some(task) = self.poll_task.lock().unwrap().take() {
            task.abort();
        }
        self.connected.lock().unwrap().clear();
        // Always emitted, even when the set was already empty, so
        // subscribers can tell a stop apart from quiescence.
        let _ = self.events.send(MembershipEvent::Changed(Vec::new()));
        info!("Membership tracking stopped");
    }
}

impl Drop for MembershipTracker {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn run_poll(
    room: Arc<dyn RoomHandle>,
    poll_interval: Duration,
    connected: Arc<Mutex<BTreeSet<PeerId>>>,
    events: broadcast::Sender<MembershipEvent>,
) {
    let mut transport_events = room.peer_events();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let observed: BTreeSet<PeerId> = tokio::select! {
            _ = ticker.tick() => room
                .peers()
                .into_iter()
                .filter(|(_, state)| *state == ConnectionState::Connected)
                .map(|(id, _)| id)
                .collect(),
            event = transport_events.recv() => {
                let mut set = connected.lock().unwrap().clone();
                match event {
                    Ok(PeerEvent::Up(id)) => { set.insert(id); }
                    Ok(PeerEvent::Down(id)) => { set.remove(&id); }
                    // Lagged or closed: the next poll re-establishes truth.
                    Err(_) => continue,
                }
                set
            }
        };

        reconcile(&connected, &observed, &events);
    }
}

/// Diff the observed set against the tracked one, emitting join/leave
/// deltas and a single `Changed` when anything moved.
fn reconcile(
    connected: &Mutex<BTreeSet<PeerId>>,
    observed: &BTreeSet<PeerId>,
    events: &broadcast::Sender<MembershipEvent>,
) {
    let (joined, left): (Vec<PeerId>, Vec<PeerId>) = {
        let mut current = connected.lock().unwrap();
        if *current == *observed {
            return;
        }
        let joined = observed.difference(&current).cloned().collect();
        let left = current.difference(observed).cloned().collect();
        *current = observed.clone();
        (joined, left)
    };

    for peer in joined {
        debug!(%peer, "Peer joined");
        let _ = events.send(MembershipEvent::PeerJoined(peer));
    }
    for peer in left {
        debug!(%peer, "Peer left");
        let _ = events.send(MembershipEvent::PeerLeft(peer));
    }
    let _ = events.send(MembershipEvent::Changed(
        observed.iter().cloned().collect(),
    ));
}
