//! Replication engine — owns the canonical document
//!
//! One actor task per process. The host holds the system of record and
//! diff-broadcasts tailored envelopes; clients request state on join,
//! run every inbound document through the safety guard, and only replace
//! their snapshot on a safe verdict. All mutation is whole-document
//! replacement: readers take an immutable `Arc` snapshot, writers install
//! a brand-new one.

pub mod envelope;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::assets::policy::AssetCategory;
use crate::assets::{AssetRef, AssetStore};
use crate::config::ReplicationConfig;
use crate::document::{now_millis, AssetId, Document};
use crate::error::EngineError;
use crate::guard::{self, GuardConfig};
use crate::membership::{MembershipEvent, MembershipTracker};
use crate::protocol::{
    self, AssetAckMessage, MutateMessage, MutateOp, RequestStateMessage, StateMessage,
    CHANNEL_IMAGE_ACK, CHANNEL_MUTATE, CHANNEL_REQUEST_STATE, CHANNEL_STATE,
};
use crate::storage::{SessionRecord, SessionStore};
use crate::transport::{InboundMessage, PeerId, RoomHandle, RoomTransport};

const COMMAND_QUEUE: usize = 64;
const INTERNAL_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// User-visible connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error(String),
}

/// Immutable view of the canonical state at one instant.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub document: Arc<Document>,
    pub stamp: u64,
}

/// Engine construction parameters.
pub struct EngineSettings {
    pub role: Role,
    pub app_id: String,
    pub room_id: String,
    pub replication: ReplicationConfig,
    pub guard: GuardConfig,
}

/// Host-side sync phase for one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerPhase {
    AwaitingJoin,
    Synced,
}

enum Command {
    ApplyEdit {
        transform: Box<dyn FnOnce(&Document) -> Document + Send>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Mutate {
        op: MutateOp,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    UploadAsset {
        bytes: Bytes,
        category: AssetCategory,
        existing: Option<AssetId>,
        reply: oneshot::Sender<Result<AssetRef, EngineError>>,
    },
    RequestAsset {
        id: AssetId,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    DeleteAsset {
        id: AssetId,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Save {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Leave {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

enum InternalEvent {
    /// Settle delay for a freshly joined peer elapsed.
    SettledJoin { peer: PeerId, attempt: u8 },
}

enum Flow {
    Continue,
    Stop,
}

/// Handle exposed to the UI layer. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    doc_rx: watch::Receiver<Snapshot>,
    status_rx: watch::Receiver<ConnectionStatus>,
    local: PeerId,
}

impl SessionHandle {
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    /// Current document snapshot.
    pub fn document(&self) -> Arc<Document> {
        self.doc_rx.borrow().document.clone()
    }

    pub fn stamp(&self) -> u64 {
        self.doc_rx.borrow().stamp
    }

    /// Watch channel delivering every installed snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.doc_rx.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_updates(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Apply a pure transform to the document. On the host this installs
    /// and broadcasts the new canonical value; on a client it is an
    /// optimistic local prediction overwritten by the next authoritative
    /// broadcast.
    pub async fn apply_edit<F>(&self, transform: F) -> Result<(), EngineError>
    where
        F: FnOnce(&Document) -> Document + Send + 'static,
    {
        self.roundtrip(|reply| Command::ApplyEdit {
            transform: Box::new(transform),
            reply,
        })
        .await
    }

    /// Send a discrete mutation. Clients forward it to the host, which
    /// applies it to the canonical document and rebroadcasts.
    pub async fn mutate(&self, op: MutateOp) -> Result<(), EngineError> {
        self.roundtrip(|reply| Command::Mutate { op, reply }).await
    }

    pub async fn upload_asset(
        &self,
        bytes: Bytes,
        category: AssetCategory,
    ) -> Result<AssetRef, EngineError> {
        self.roundtrip(|reply| Command::UploadAsset {
            bytes,
            category,
            existing: None,
            reply,
        })
        .await
    }

    /// Re-upload under an existing id, preserving referential identity.
    pub async fn replace_asset(
        &self,
        id: AssetId,
        bytes: Bytes,
        category: AssetCategory,
    ) -> Result<AssetRef, EngineError> {
        self.roundtrip(|reply| Command::UploadAsset {
            bytes,
            category,
            existing: Some(id),
            reply,
        })
        .await
    }

    /// Hint the host to inline one asset immediately rather than waiting
    /// for the next broadcast.
    pub async fn request_asset(&self, id: AssetId) -> Result<(), EngineError> {
        self.roundtrip(|reply| Command::RequestAsset { id, reply })
            .await
    }

    /// Delete an asset from the catalog, nulling every document reference.
    pub async fn delete_asset(&self, id: AssetId) -> Result<bool, EngineError> {
        self.roundtrip(|reply| Command::DeleteAsset { id, reply })
            .await
    }

    /// Persist the session record (host only; a no-op elsewhere).
    pub async fn save(&self) -> Result<(), EngineError> {
        self.roundtrip(|reply| Command::Save { reply }).await
    }

    /// Persist (host) and leave the room, stopping the engine.
    pub async fn leave(&self) -> Result<(), EngineError> {
        self.roundtrip(|reply| Command::Leave { reply }).await
    }

    async fn roundtrip<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> Command,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)?
    }
}

pub struct ReplicationEngine;

impl ReplicationEngine {
    /// Join the room and start the engine actor.
    pub async fn start(
        transport: Arc<dyn RoomTransport>,
        assets: Arc<AssetStore>,
        sessions: Option<Arc<SessionStore>>,
        settings: EngineSettings,
    ) -> Result<SessionHandle, EngineError> {
        let (room, inbound) = transport.join(&settings.app_id, &settings.room_id).await?;
        let local = room.local_peer();
        info!(role = ?settings.role, peer = %local, room = %settings.room_id, "Joined room");

        // Host: load the persisted record for this room, or start fresh.
        let (document, stamp, initialized) = match settings.role {
            Role::Host => {
                let record = match &sessions {
                    Some(store) => store.load(&settings.room_id).await?,
                    None => None,
                };
                match record {
                    Some(record) => (record.document, record.last_modified, true),
                    None => (Document::new(settings.room_id.clone()), now_millis(), true),
                }
            }
            Role::Client => (Document::default(), 0, false),
        };

        let membership = Arc::new(MembershipTracker::start(
            room.clone(),
            Duration::from_millis(settings.replication.membership_poll_ms),
        ));
        let member_rx = membership.subscribe();

        let snapshot = Snapshot {
            document: Arc::new(document),
            stamp,
        };
        let (doc_tx, doc_rx) = watch::channel(snapshot.clone());
        let initial_status = match settings.role {
            Role::Host => ConnectionStatus::Connected,
            Role::Client => ConnectionStatus::Connecting,
        };
        let (status_tx, status_rx) = watch::channel(initial_status);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_QUEUE);

        let actor = EngineActor {
            role: settings.role,
            room,
            local: local.clone(),
            room_id: settings.room_id,
            assets,
            sessions,
            guard: settings.guard,
            settle: Duration::from_millis(settings.replication.settle_delay_ms),
            retry: Duration::from_millis(settings.replication.deferred_retry_ms),
            snapshot,
            initialized,
            host_peer: None,
            peer_phase: HashMap::new(),
            doc_tx,
            status_tx,
            internal_tx,
            membership,
        };
        tokio::spawn(actor.run(cmd_rx, inbound, member_rx, internal_rx));

        Ok(SessionHandle {
            cmd_tx,
            doc_rx,
            status_rx,
            local,
        })
    }
}

struct EngineActor {
    role: Role,
    room: Arc<dyn RoomHandle>,
    local: PeerId,
    room_id: String,
    assets: Arc<AssetStore>,
    sessions: Option<Arc<SessionStore>>,
    guard: GuardConfig,
    settle: Duration,
    retry: Duration,
    snapshot: Snapshot,
    /// Whether the canonical document is usable. Hosts initialize at
    /// startup; clients only after the first safe inbound state.
    initialized: bool,
    /// Client side: where authoritative state comes from.
    host_peer: Option<PeerId>,
    peer_phase: HashMap<PeerId, PeerPhase>,
    doc_tx: watch::Sender<Snapshot>,
    status_tx: watch::Sender<ConnectionStatus>,
    internal_tx: mpsc::Sender<InternalEvent>,
    membership: Arc<MembershipTracker>,
}

impl EngineActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut member_rx: broadcast::Receiver<MembershipEvent>,
        mut internal_rx: mpsc::Receiver<InternalEvent>,
    ) {
        if self.role == Role::Client {
            self.send_state_request(None).await;
        }

        let mut membership_open = true;
        loop {
            let flow = tokio::select! {
                Some(cmd) = cmd_rx.recv() => self.handle_command(cmd).await,
                Some(msg) = inbound.recv() => self.handle_inbound(msg).await,
                Some(event) = internal_rx.recv() => self.handle_internal(event).await,
                event = member_rx.recv(), if membership_open => match event {
                    Ok(event) => self.handle_membership(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Membership events lagged");
                        Flow::Continue
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        membership_open = false;
                        Flow::Continue
                    }
                },
                else => break,
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }
        debug!(peer = %self.local, "Engine actor stopped");
    }

    // ------------------------------------------------------------------
    // Commands from the UI handle
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::ApplyEdit { transform, reply } => {
                let next = transform(&self.snapshot.document);
                match self.role {
                    Role::Host => {
                        self.install(next, now_millis());
                        self.broadcast_to_synced().await;
                    }
                    Role::Client => {
                        // Optimistic prediction: keep the current stamp so
                        // any authoritative broadcast wins.
                        let stamp = self.snapshot.stamp;
                        self.install(next, stamp);
                    }
                }
                let _ = reply.send(Ok(()));
                Flow::Continue
            }

            Command::Mutate { op, reply } => {
                match self.role {
                    Role::Host => {
                        let result = self.apply_mutation(op, self.local.clone()).await;
                        let _ = reply.send(result);
                    }
                    Role::Client => {
                        let msg = MutateMessage {
                            sender: self.local.clone(),
                            op,
                        };
                        let result = self
                            .send_message(CHANNEL_MUTATE, self.host_peer.clone().as_ref(), &msg)
                            .await;
                        let _ = reply.send(result);
                    }
                }
                Flow::Continue
            }

            Command::UploadAsset {
                bytes,
                category,
                existing,
                reply,
            } => {
                let result = self.assets.put(bytes, category, existing).await;
                let _ = reply.send(result);
                Flow::Continue
            }

            Command::RequestAsset { id, reply } => {
                let result = match self.role {
                    Role::Client => {
                        let msg = RequestStateMessage {
                            sender: self.local.clone(),
                            want: Some(id),
                        };
                        self.send_message(
                            CHANNEL_REQUEST_STATE,
                            self.host_peer.clone().as_ref(),
                            &msg,
                        )
                        .await
                    }
                    // The host already holds every asset it references.
                    Role::Host => Ok(()),
                };
                let _ = reply.send(result);
                Flow::Continue
            }

            Command::DeleteAsset { id, reply } => {
                let result = self.delete_asset(id).await;
                let _ = reply.send(result);
                Flow::Continue
            }

            Command::Save { reply } => {
                let _ = reply.send(self.persist().await);
                Flow::Continue
            }

            Command::Leave { reply } => {
                let result = self.persist().await;
                self.shutdown(ConnectionStatus::Disconnected).await;
                let _ = reply.send(result);
                Flow::Stop
            }
        }
    }

    async fn delete_asset(&mut self, id: AssetId) -> Result<bool, EngineError> {
        let deleted = self.assets.delete(&id).await?;
        // Explicit catalog deletion must null out every dangling
        // reference in the document.
        if self.role == Role::Host && self.snapshot.document.references_asset(&id) {
            let next = self.snapshot.document.drop_asset_refs(&id);
            self.install(next, now_millis());
            self.broadcast_to_synced().await;
        }
        Ok(deleted)
    }

    async fn persist(&self) -> Result<(), EngineError> {
        match (self.role, &self.sessions) {
            (Role::Host, Some(store)) => {
                let record = SessionRecord {
                    document: (*self.snapshot.document).clone(),
                    last_modified: self.snapshot.stamp,
                    host_id: self.local.clone(),
                };
                store.save(&self.room_id, &record).await
            }
            (Role::Host, None) => Ok(()),
            (Role::Client, _) => {
                debug!("Save ignored: clients do not persist sessions");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    async fn handle_membership(&mut self, event: MembershipEvent) -> Flow {
        match event {
            MembershipEvent::PeerJoined(peer) => {
                if self.role == Role::Host {
                    self.peer_phase.insert(peer.clone(), PeerPhase::AwaitingJoin);
                    self.schedule_settled_join(peer, 1, self.settle);
                }
            }
            MembershipEvent::PeerLeft(peer) => {
                self.peer_phase.remove(&peer);
                self.assets.clear_peer_knowledge(&peer);
                if self.role == Role::Host {
                    // Release anything the departed peer had claimed and
                    // let the remaining peers know.
                    let next = self.snapshot.document.clear_claims_by(&peer);
                    if *self.snapshot.document != next {
                        info!(%peer, "Clearing claims held by departed peer");
                        self.install(next, now_millis());
                        self.broadcast_to_synced().await;
                    }
                } else if Some(&peer) == self.host_peer.as_ref() {
                    warn!(%peer, "Host connection lost");
                    let _ = self.status_tx.send(ConnectionStatus::Reconnecting);
                }
            }
            MembershipEvent::Changed(set) => {
                debug!(peers = set.len(), "Membership changed");
            }
        }
        Flow::Continue
    }

    fn schedule_settled_join(&self, peer: PeerId, attempt: u8, delay: Duration) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(InternalEvent::SettledJoin { peer, attempt }).await;
        });
    }

    async fn handle_internal(&mut self, event: InternalEvent) -> Flow {
        match event {
            InternalEvent::SettledJoin { peer, attempt } => {
                if self.role != Role::Host || !self.peer_phase.contains_key(&peer) {
                    return Flow::Continue;
                }
                if !self.initialized {
                    if attempt == 1 {
                        debug!(%peer, "Document uninitialized, deferring initial envelope");
                        self.schedule_settled_join(peer, 2, self.retry);
                    } else {
                        error!(%peer, "Document still uninitialized, cannot send initial state");
                    }
                    return Flow::Continue;
                }
                self.send_envelope_to(&peer).await;
                self.peer_phase.insert(peer, PeerPhase::Synced);
            }
        }
        Flow::Continue
    }

    // ------------------------------------------------------------------
    // Inbound channel messages
    // ------------------------------------------------------------------

    async fn handle_inbound(&mut self, msg: InboundMessage) -> Flow {
        match msg.channel.as_str() {
            CHANNEL_STATE => self.handle_state(msg).await,
            CHANNEL_REQUEST_STATE => {
                self.handle_request_state(msg).await;
                Flow::Continue
            }
            CHANNEL_IMAGE_ACK => {
                self.handle_image_ack(msg);
                Flow::Continue
            }
            CHANNEL_MUTATE => {
                self.handle_mutate(msg).await;
                Flow::Continue
            }
            other => {
                warn!(channel = other, from = %msg.from, "Message on unknown channel dropped");
                Flow::Continue
            }
        }
    }

    async fn handle_state(&mut self, msg: InboundMessage) -> Flow {
        if self.role == Role::Host {
            warn!(from = %msg.from, "Host ignoring inbound state broadcast");
            return Flow::Continue;
        }
        let state: StateMessage = match protocol::decode(&msg.payload) {
            Ok(state) => state,
            Err(e) => {
                warn!(from = %msg.from, error = %e, "Dropping malformed state message");
                return Flow::Continue;
            }
        };

        // Unordered delivery: never regress to an older snapshot, and
        // never merge two snapshots.
        if self.initialized && state.stamp < self.snapshot.stamp {
            debug!(
                inbound = state.stamp,
                applied = self.snapshot.stamp,
                "Discarding stale snapshot"
            );
            return Flow::Continue;
        }

        let verdict = guard::evaluate(
            &self.guard,
            &self.snapshot.document,
            &state.envelope.document,
        );
        if !verdict.safe {
            let err = EngineError::UnsafeState(
                verdict
                    .reason
                    .unwrap_or_else(|| "anomalous document churn".to_string()),
            );
            error!(from = %msg.from, error = %err, "Unsafe inbound state, leaving room");
            // Fail closed: applying (or retrying) could replay the same
            // unsafe payload. Terminate the connection instead.
            self.shutdown(ConnectionStatus::Error(err.to_string())).await;
            return Flow::Stop;
        }

        let result = envelope::ingest(state.envelope, &self.assets).await;
        if !result.held.is_empty() {
            let ack = AssetAckMessage {
                sender: self.local.clone(),
                assets: result.held,
            };
            if let Err(e) = self
                .send_message(CHANNEL_IMAGE_ACK, Some(&state.sender), &ack)
                .await
            {
                warn!(error = %e, "Failed to acknowledge received assets");
            }
        }

        self.host_peer = Some(state.sender);
        self.initialized = true;
        self.install(result.document, state.stamp);
        let _ = self.status_tx.send(ConnectionStatus::Connected);
        Flow::Continue
    }

    async fn handle_request_state(&mut self, msg: InboundMessage) {
        if self.role != Role::Host {
            return;
        }
        let request: RequestStateMessage = match protocol::decode(&msg.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(from = %msg.from, error = %e, "Dropping malformed state request");
                return;
            }
        };
        if !self.initialized {
            warn!(from = %msg.from, "State requested before document initialized");
            return;
        }
        if let Some(want) = &request.want {
            // Force the asset back into this peer's next envelope.
            self.assets.forget_peer_asset(want, &request.sender);
        }
        self.send_envelope_to(&request.sender).await;
        self.peer_phase.insert(request.sender, PeerPhase::Synced);
    }

    fn handle_image_ack(&mut self, msg: InboundMessage) {
        let ack: AssetAckMessage = match protocol::decode(&msg.payload) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(from = %msg.from, error = %e, "Dropping malformed asset ack");
                return;
            }
        };
        for id in &ack.assets {
            self.assets.mark_known_by_peer(id, &ack.sender);
        }
        debug!(from = %ack.sender, count = ack.assets.len(), "Assets acknowledged");
    }

    async fn handle_mutate(&mut self, msg: InboundMessage) {
        if self.role != Role::Host {
            return;
        }
        let mutate: MutateMessage = match protocol::decode(&msg.payload) {
            Ok(mutate) => mutate,
            Err(e) => {
                warn!(from = %msg.from, error = %e, "Dropping malformed mutation");
                return;
            }
        };
        if let Err(e) = self.apply_mutation(mutate.op, mutate.sender.clone()).await {
            warn!(from = %mutate.sender, error = %e, "Mutation rejected");
        }
    }

    /// Apply a discrete mutation to the canonical document (host only),
    /// then rebroadcast.
    async fn apply_mutation(&mut self, op: MutateOp, origin: PeerId) -> Result<(), EngineError> {
        let doc = &self.snapshot.document;
        let next = match op {
            MutateOp::UpsertEntity { collection, entity } => {
                let mut next = (**doc).clone();
                next.collections.entry(collection).or_default().upsert(entity);
                next
            }
            MutateOp::RemoveEntity { collection, entity } => {
                let mut next = (**doc).clone();
                let removed = next
                    .collections
                    .get_mut(&collection)
                    .map_or(false, |c| c.remove(&entity));
                if !removed {
                    return Err(EngineError::Protocol(format!(
                        "no entity {} in {}",
                        entity,
                        collection.name()
                    )));
                }
                next
            }
            MutateOp::SetNotes(notes) => {
                let mut next = (**doc).clone();
                next.notes = notes;
                next
            }
            MutateOp::ClaimSeat { seat } => {
                let mut next = (**doc).clone();
                match next.seats.get_mut(&seat) {
                    Some(claim @ None) => *claim = Some(origin),
                    Some(Some(holder)) => {
                        return Err(EngineError::Protocol(format!(
                            "seat {} already claimed by {}",
                            seat, holder
                        )))
                    }
                    None => {
                        next.seats.insert(seat, Some(origin));
                    }
                }
                next
            }
            MutateOp::ReleaseSeat { seat } => {
                let mut next = (**doc).clone();
                match next.seats.get_mut(&seat) {
                    Some(claim) if claim.as_ref() == Some(&origin) => *claim = None,
                    _ => {
                        return Err(EngineError::Protocol(format!(
                            "seat {} not held by {}",
                            seat, origin
                        )))
                    }
                }
                next
            }
        };
        self.install(next, now_millis());
        self.broadcast_to_synced().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    async fn send_state_request(&self, want: Option<AssetId>) {
        let msg = RequestStateMessage {
            sender: self.local.clone(),
            want,
        };
        // Host identity is unknown before the first broadcast, so the
        // request goes to everyone; only the host answers.
        if let Err(e) = self.send_message(CHANNEL_REQUEST_STATE, None, &msg).await {
            warn!(error = %e, "State request failed");
        }
    }

    async fn send_envelope_to(&self, peer: &PeerId) {
        let envelope =
            match envelope::build(&self.snapshot.document, &self.assets, peer).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(%peer, error = %e, "Envelope construction failed");
                    return;
                }
            };
        let inline = envelope.inline_bytes();
        let msg = StateMessage {
            sender: self.local.clone(),
            stamp: self.snapshot.stamp,
            envelope,
        };
        match self.send_message(CHANNEL_STATE, Some(peer), &msg).await {
            Ok(()) => debug!(%peer, stamp = msg.stamp, inline_bytes = inline, "Envelope sent"),
            Err(e) => warn!(%peer, error = %e, "Envelope send failed"),
        }
    }

    /// Diff-broadcast the current canonical document to every peer that
    /// completed its join handshake. Each peer gets its own envelope,
    /// tailored by the knowledge ledger.
    async fn broadcast_to_synced(&self) {
        for peer in self.membership.current() {
            if self.peer_phase.get(&peer) == Some(&PeerPhase::Synced) {
                self.send_envelope_to(&peer).await;
            }
        }
    }

    async fn send_message<T: serde::Serialize>(
        &self,
        channel: &str,
        target: Option<&PeerId>,
        msg: &T,
    ) -> Result<(), EngineError> {
        let payload = protocol::encode(msg)?;
        self.room.send(channel, target, payload).await
    }

    // ------------------------------------------------------------------
    // State installation and shutdown
    // ------------------------------------------------------------------

    fn install(&mut self, next: Document, stamp: u64) {
        self.snapshot = Snapshot {
            document: Arc::new(next),
            stamp,
        };
        let _ = self.doc_tx.send(self.snapshot.clone());
    }

    async fn shutdown(&mut self, status: ConnectionStatus) {
        self.membership.stop();
        self.room.leave().await;
        self.peer_phase.clear();
        let _ = self.status_tx.send(status);
        info!(peer = %self.local, "Left room");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_carries_reason() {
        let status = ConnectionStatus::Error("unsafe state rejected: roster".into());
        match status {
            ConnectionStatus::Error(reason) => assert!(reason.contains("roster")),
            _ => unreachable!(),
        }
    }
}
