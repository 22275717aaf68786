//! Envelope construction and ingestion
//!
//! An envelope is tailored per destination: the document travels whole,
//! asset bytes travel only when the knowledge ledger says the destination
//! lacks them. Ingestion persists inlined assets and reports which ids
//! are now held so the receiver can acknowledge them.

use std::future::Future;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::assets::{AssetMeta, AssetStore};
use crate::document::{AssetId, Document};
use crate::error::EngineError;
use crate::protocol::{AssetTransit, Envelope};
use crate::transport::PeerId;

/// Build the transit envelope for one destination peer.
///
/// An asset whose bytes cannot be read locally (after one retry) stays a
/// bare reference; the document keeps the dangling id rather than
/// silently dropping it.
pub async fn build(
    document: &Document,
    assets: &AssetStore,
    dest: &PeerId,
) -> Result<Envelope, EngineError> {
    let mut transit = Vec::new();
    for id in document.asset_ids() {
        if assets.peer_has_asset(&id, dest) {
            transit.push(AssetTransit::Reference { id });
            continue;
        }
        match with_one_retry(|| fetch_asset(assets, &id)).await {
            Ok(Some((bytes, meta))) => transit.push(AssetTransit::Inline {
                id,
                meta,
                bytes: bytes.to_vec(),
            }),
            Ok(None) => {
                warn!(asset = %id, "Referenced asset missing locally, sending bare reference");
                transit.push(AssetTransit::Reference { id });
            }
            Err(e) => {
                warn!(asset = %id, error = %e, "Asset read failed twice, sending bare reference");
                transit.push(AssetTransit::Reference { id });
            }
        }
    }
    Ok(Envelope {
        document: document.clone(),
        assets: transit,
    })
}

async fn fetch_asset(
    assets: &AssetStore,
    id: &AssetId,
) -> Result<Option<(Bytes, AssetMeta)>, EngineError> {
    let bytes = assets.get(id).await?;
    let meta = assets.meta(id).await?;
    Ok(bytes.zip(meta))
}

/// Run a fallible read, retrying exactly once on error.
async fn with_one_retry<T, F, Fut>(mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(first) => {
            debug!(error = %first, "Read failed, retrying once");
            op().await
        }
    }
}

/// Result of ingesting an inbound envelope.
pub struct IngestResult {
    pub document: Document,
    /// Asset ids now held locally as a result of this envelope, to be
    /// acknowledged back to the sender.
    pub held: Vec<AssetId>,
}

/// Persist every inlined asset and hand back the document. Asset store
/// failures degrade that one asset to a dangling reference; they never
/// fail the whole envelope.
pub async fn ingest(envelope: Envelope, assets: &AssetStore) -> IngestResult {
    let mut held = Vec::new();
    for transit in envelope.assets {
        if let AssetTransit::Inline { id, meta, bytes } = transit {
            match assets.put_received(id.clone(), Bytes::from(bytes), meta).await {
                Ok(_) => held.push(id),
                Err(e) => {
                    warn!(asset = %id, error = %e, "Failed to persist received asset");
                }
            }
        }
    }
    IngestResult {
        document: envelope.document,
        held,
    }
}
