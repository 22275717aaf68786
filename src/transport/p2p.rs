//! libp2p transport adapter
//!
//! Maps the engine's named-channel room abstraction onto a libp2p swarm:
//! TCP/QUIC with Noise + Yamux, mDNS local discovery, and request-response
//! for channel frames. Room scoping rides on the protocol id: peers only
//! count as room members once identify shows they speak this room's frame
//! protocol.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::StreamExt;
use libp2p::{
    identify, identity, mdns, noise, request_response, tcp, yamux, Multiaddr, StreamProtocol,
    SwarmBuilder,
};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::P2pConfig;
use crate::error::EngineError;

use super::{ConnectionState, InboundMessage, PeerEvent, PeerId, RoomHandle, RoomTransport};

const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 256;
const COMMAND_QUEUE: usize = 64;

/// One named-channel message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Empty acknowledgement; delivery tracking happens at the engine layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameAck;

/// Length-prefixed MessagePack codec for channel frames.
#[derive(Clone, Default)]
pub struct FrameCodec;

async fn read_prefixed<T: AsyncRead + Unpin + Send>(io: &mut T) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_prefixed<T: AsyncWrite + Unpin + Send>(io: &mut T, data: &[u8]) -> io::Result<()> {
    io.write_all(&(data.len() as u32).to_be_bytes()).await?;
    io.write_all(data).await?;
    io.close().await
}

fn encode_io<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn decode_io<T: serde::de::DeserializeOwned>(data: &[u8]) -> io::Result<T> {
    rmp_serde::from_slice(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[async_trait]
impl request_response::Codec for FrameCodec {
    type Protocol = StreamProtocol;
    type Request = ChannelFrame;
    type Response = FrameAck;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<ChannelFrame>
    where
        T: AsyncRead + Unpin + Send,
    {
        decode_io(&read_prefixed(io).await?)
    }

    async fn read_response<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<FrameAck>
    where
        T: AsyncRead + Unpin + Send,
    {
        decode_io(&read_prefixed(io).await?)
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        req: ChannelFrame,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_prefixed(io, &encode_io(&req)?).await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        res: FrameAck,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_prefixed(io, &encode_io(&res)?).await
    }
}

#[derive(NetworkBehaviour)]
struct RelayBehaviour {
    request_response: request_response::Behaviour<FrameCodec>,
    mdns: Toggle<mdns::tokio::Behaviour>,
    identify: identify::Behaviour,
}

enum SwarmCommand {
    Send {
        target: Option<libp2p::PeerId>,
        frame: ChannelFrame,
    },
    Leave,
}

/// Factory configured once per process.
pub struct P2pTransport {
    config: P2pConfig,
}

impl P2pTransport {
    pub fn new(config: P2pConfig) -> Self {
        Self { config }
    }
}

fn room_protocol(app_id: &str, room_id: &str) -> Result<StreamProtocol, EngineError> {
    StreamProtocol::try_from_owned(format!("/{}/{}/frames/1.0.0", app_id, room_id))
        .map_err(|e| EngineError::Transport(format!("invalid room protocol: {}", e)))
}

#[async_trait]
impl RoomTransport for P2pTransport {
    async fn join(
        &self,
        app_id: &str,
        room_id: &str,
    ) -> Result<(Arc<dyn RoomHandle>, mpsc::Receiver<InboundMessage>), EngineError> {
        let keypair = identity::Keypair::generate_ed25519();
        let local_libp2p = libp2p::PeerId::from(keypair.public());
        let protocol = room_protocol(app_id, room_id)?;
        let protocol_for_behaviour = protocol.clone();
        let mdns_enabled = self.config.mdns_enabled;

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| EngineError::Transport(format!("tcp transport: {}", e)))?
            .with_quic()
            .with_behaviour(move |key| {
                let rr_config =
                    request_response::Config::default().with_request_timeout(REQUEST_TIMEOUT);
                let request_response = request_response::Behaviour::with_codec(
                    FrameCodec,
                    [(
                        protocol_for_behaviour.clone(),
                        request_response::ProtocolSupport::Full,
                    )],
                    rr_config,
                );

                let mdns = if mdns_enabled {
                    Some(
                        mdns::tokio::Behaviour::new(
                            mdns::Config::default(),
                            key.public().to_peer_id(),
                        )
                        .expect("mDNS behaviour"),
                    )
                } else {
                    None
                };

                let identify = identify::Behaviour::new(
                    identify::Config::new("/session-relay/id/1.0.0".to_string(), key.public())
                        .with_agent_version(format!("session-relay/{}", env!("CARGO_PKG_VERSION"))),
                );

                RelayBehaviour {
                    request_response,
                    mdns: Toggle::from(mdns),
                    identify,
                }
            })
            .map_err(|e| EngineError::Transport(format!("swarm behaviour: {}", e)))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        for addr_str in &self.config.listen_addrs {
            let addr: Multiaddr = addr_str
                .parse()
                .map_err(|e| EngineError::Transport(format!("listen addr {}: {}", addr_str, e)))?;
            swarm
                .listen_on(addr)
                .map_err(|e| EngineError::Transport(format!("listen on {}: {}", addr_str, e)))?;
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let members: Arc<DashMap<PeerId, libp2p::PeerId>> = Arc::new(DashMap::new());

        let task = SwarmTask {
            swarm,
            protocol,
            inbound_tx,
            events_tx: events_tx.clone(),
            members: members.clone(),
        };
        tokio::spawn(task.run(cmd_rx));
        info!(peer = %local_libp2p, room = room_id, "P2P room joined");

        let handle = Arc::new(P2pRoomHandle {
            local: PeerId(local_libp2p.to_string()),
            cmd_tx,
            events: events_tx,
            members,
        });
        Ok((handle, inbound_rx))
    }
}

pub struct P2pRoomHandle {
    local: PeerId,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    events: broadcast::Sender<PeerEvent>,
    members: Arc<DashMap<PeerId, libp2p::PeerId>>,
}

#[async_trait]
impl RoomHandle for P2pRoomHandle {
    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    async fn send(
        &self,
        channel: &str,
        target: Option<&PeerId>,
        payload: Bytes,
    ) -> Result<(), EngineError> {
        let target = match target {
            Some(peer) => Some(
                self.members
                    .get(peer)
                    .map(|entry| *entry.value())
                    .ok_or_else(|| {
                        EngineError::Transport(format!("peer {} not in room", peer))
                    })?,
            ),
            None => None,
        };
        let frame = ChannelFrame {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        };
        self.cmd_tx
            .send(SwarmCommand::Send { target, frame })
            .await
            .map_err(|_| EngineError::Transport("swarm task stopped".into()))
    }

    fn peers(&self) -> Vec<(PeerId, ConnectionState)> {
        self.members
            .iter()
            .map(|entry| (entry.key().clone(), ConnectionState::Connected))
            .collect()
    }

    fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    async fn leave(&self) {
        let _ = self.cmd_tx.send(SwarmCommand::Leave).await;
    }
}

struct SwarmTask {
    swarm: libp2p::Swarm<RelayBehaviour>,
    protocol: StreamProtocol,
    inbound_tx: mpsc::Sender<InboundMessage>,
    events_tx: broadcast::Sender<PeerEvent>,
    members: Arc<DashMap<PeerId, libp2p::PeerId>>,
}

impl SwarmTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SwarmCommand>) {
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => match cmd {
                    SwarmCommand::Send { target, frame } => self.send_frame(target, frame),
                    SwarmCommand::Leave => break,
                },
                Some(event) = self.swarm.next() => self.handle_swarm_event(event),
                else => break,
            }
        }
        // Dropping the swarm closes every connection; in-flight sends are
        // discarded, not flushed.
        debug!("Swarm task stopped");
    }

    fn send_frame(&mut self, target: Option<libp2p::PeerId>, frame: ChannelFrame) {
        match target {
            Some(peer) => {
                self.swarm
                    .behaviour_mut()
                    .request_response
                    .send_request(&peer, frame);
            }
            None => {
                let peers: Vec<libp2p::PeerId> =
                    self.members.iter().map(|entry| *entry.value()).collect();
                for peer in peers {
                    self.swarm
                        .behaviour_mut()
                        .request_response
                        .send_request(&peer, frame.clone());
                }
            }
        }
    }

    fn handle_swarm_event(
        &mut self,
        event: libp2p::swarm::SwarmEvent<RelayBehaviourEvent>,
    ) {
        use libp2p::swarm::SwarmEvent as Ev;
        match event {
            Ev::Behaviour(RelayBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                let mut dialed: HashMap<libp2p::PeerId, ()> = HashMap::new();
                for (peer_id, addr) in peers {
                    debug!(%peer_id, %addr, "mDNS: peer discovered");
                    self.swarm
                        .behaviour_mut()
                        .request_response
                        .add_address(&peer_id, addr);
                    if dialed.insert(peer_id, ()).is_none() {
                        let _ = self.swarm.dial(peer_id);
                    }
                }
            }

            // Membership is decided by identify: only peers speaking this
            // room's frame protocol count as members.
            Ev::Behaviour(RelayBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
            })) => {
                if info.protocols.iter().any(|p| *p == self.protocol) {
                    let member = PeerId(peer_id.to_string());
                    if self.members.insert(member.clone(), peer_id).is_none() {
                        debug!(%peer_id, "Peer joined room");
                        let _ = self.events_tx.send(PeerEvent::Up(member));
                    }
                }
            }

            Ev::Behaviour(RelayBehaviourEvent::RequestResponse(
                request_response::Event::Message { peer, message },
            )) => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let _ = self
                        .swarm
                        .behaviour_mut()
                        .request_response
                        .send_response(channel, FrameAck);
                    let msg = InboundMessage {
                        channel: request.channel,
                        from: PeerId(peer.to_string()),
                        payload: Bytes::from(request.payload),
                    };
                    if let Err(e) = self.inbound_tx.try_send(msg) {
                        warn!(%peer, error = %e, "Inbound queue full, frame dropped");
                    }
                }
                request_response::Message::Response { .. } => {}
            },

            Ev::Behaviour(RelayBehaviourEvent::RequestResponse(
                request_response::Event::OutboundFailure { peer, error, .. },
            )) => {
                warn!(%peer, ?error, "Outbound frame failed");
            }

            Ev::ConnectionClosed { peer_id, num_established, .. } => {
                if num_established == 0 {
                    let member = PeerId(peer_id.to_string());
                    if self.members.remove(&member).is_some() {
                        debug!(%peer_id, "Peer left room");
                        let _ = self.events_tx.send(PeerEvent::Down(member));
                    }
                }
            }

            Ev::NewListenAddr { address, .. } => {
                info!(%address, "Listening on");
            }

            _ => {}
        }
    }
}
