//! Replication wire protocol
//!
//! One message type per named channel, encoded as MessagePack. Transit
//! envelopes are ephemeral per-peer projections of the document: asset
//! references the destination already acknowledged stay references, the
//! rest travel with inlined bytes. The envelope is discarded after
//! send/receive and is never the authoritative representation.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::assets::AssetMeta;
use crate::document::{AssetId, Document};
use crate::error::EngineError;
use crate::transport::PeerId;

/// Channel names used on the transport.
pub const CHANNEL_STATE: &str = "state";
pub const CHANNEL_REQUEST_STATE: &str = "request_state";
pub const CHANNEL_IMAGE_ACK: &str = "image_ack";
pub const CHANNEL_MUTATE: &str = "mutate";

/// Transit form of one asset reference. An explicit tagged variant rather
/// than presence-sniffing of a bytes field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssetTransit {
    /// Destination already holds this asset.
    Reference { id: AssetId },
    /// Destination lacks this asset; bytes ride along once.
    Inline {
        id: AssetId,
        meta: AssetMeta,
        bytes: Vec<u8>,
    },
}

impl AssetTransit {
    pub fn inline_len(&self) -> usize {
        match self {
            AssetTransit::Reference { .. } => 0,
            AssetTransit::Inline { bytes, .. } => bytes.len(),
        }
    }
}

/// Per-peer projection of the document plus selectively inlined assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub document: Document,
    pub assets: Vec<AssetTransit>,
}

impl Envelope {
    /// Total inlined payload bytes, for logging and tests.
    pub fn inline_bytes(&self) -> usize {
        self.assets.iter().map(AssetTransit::inline_len).sum()
    }
}

/// Host broadcast on the `state` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    pub sender: PeerId,
    /// Document logical clock (Unix millis at last host edit).
    pub stamp: u64,
    pub envelope: Envelope,
}

/// Client -> host on `request_state`. `want` is the optional hint to
/// prioritize one asset immediately rather than waiting for the next
/// broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStateMessage {
    pub sender: PeerId,
    #[serde(default)]
    pub want: Option<AssetId>,
}

/// Receiver -> sender on `image_ack`: asset ids now held locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetAckMessage {
    pub sender: PeerId,
    pub assets: Vec<AssetId>,
}

/// Discrete client edit request on `mutate`. The host applies it to the
/// canonical document and rebroadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutateMessage {
    pub sender: PeerId,
    pub op: MutateOp,
}

/// The small vocabulary of client-originated edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MutateOp {
    UpsertEntity {
        collection: crate::document::CollectionKey,
        entity: crate::document::Entity,
    },
    RemoveEntity {
        collection: crate::document::CollectionKey,
        entity: crate::document::EntityId,
    },
    SetNotes(String),
    ClaimSeat {
        seat: String,
    },
    ReleaseSeat {
        seat: String,
    },
}

/// Encode a channel message.
pub fn encode<T: Serialize>(msg: &T) -> Result<bytes::Bytes, EngineError> {
    rmp_serde::to_vec_named(msg)
        .map(bytes::Bytes::from)
        .map_err(|e| EngineError::Protocol(format!("encode: {}", e)))
}

/// Decode a channel message. Garbage is a `ProtocolError`; the caller
/// drops the message and the connection is otherwise unaffected.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, EngineError> {
    rmp_serde::from_slice(payload).map_err(|e| EngineError::Protocol(format!("decode: {}", e)))
}
