//! Content-addressable asset store
//!
//! Local store for binary assets referenced by the document. Three layers:
//! - durable blob table (SQLite, WAL mode), keyed by asset id
//! - hot byte cache and always-resident thumbnail cache (DashMap)
//! - per-peer knowledge ledger used to avoid re-sending assets a peer
//!   already acknowledged
//!
//! Thumbnails are derived once at ingest and preloaded at open, so UI
//! read paths never touch the durable store.

pub mod policy;

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::document::AssetId;
use crate::error::EngineError;
use crate::transport::PeerId;

use policy::{AssetCategory, CategoryPolicy, ImageTranscoder};

/// Metadata carried with every stored asset and with inline transit
/// payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMeta {
    pub category: AssetCategory,
    /// Hex sha256 of the stored bytes, integrity metadata only.
    pub content_hash: String,
    /// Byte length as declared by the producer.
    pub declared_len: u64,
    pub created_at: u64,
}

/// Handle returned by ingest operations.
#[derive(Debug, Clone)]
pub struct AssetRef {
    pub id: AssetId,
    pub meta: AssetMeta,
    pub thumbnail: Option<Bytes>,
}

/// Result of ingesting a peer-supplied asset.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub asset: AssetRef,
    /// False when the id was already stored (or another ingest of the same
    /// id was in flight) and no write happened.
    pub newly_stored: bool,
}

pub struct AssetStore {
    db: Mutex<Connection>,
    /// Hot byte cache, capped; value carries an access stamp for eviction.
    hot: DashMap<AssetId, (Bytes, u64)>,
    hot_bytes: AtomicU64,
    hot_cap_bytes: u64,
    thumbs: DashMap<AssetId, Bytes>,
    /// peer -> asset ids acknowledged by that peer.
    ledger: DashMap<PeerId, HashSet<AssetId>>,
    /// Ids currently being ingested via `put_received`; duplicate inbound
    /// copies of the same id coalesce instead of double-writing.
    in_flight: DashMap<AssetId, ()>,
    transcoder: Box<dyn ImageTranscoder>,
    opened_at: Instant,
}

const DEFAULT_HOT_CAP_BYTES: u64 = 64 * 1024 * 1024;
const INGEST_POLL: Duration = Duration::from_millis(10);

impl AssetStore {
    /// Open or create the asset database and preload thumbnails.
    pub fn open(
        data_dir: &Path,
        transcoder: Box<dyn ImageTranscoder>,
    ) -> Result<Self, EngineError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| EngineError::AssetIo(format!("creating data directory: {}", e)))?;
        let db_path = data_dir.join("assets.db");
        let db = Connection::open(&db_path)
            .map_err(|e| EngineError::AssetIo(format!("opening {}: {}", db_path.display(), e)))?;

        db.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(sql_err)?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS assets (
                asset_id TEXT PRIMARY KEY,
                bytes BLOB NOT NULL,
                thumb BLOB,
                content_hash TEXT NOT NULL,
                category TEXT NOT NULL,
                declared_len INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );",
        )
        .map_err(sql_err)?;

        let thumbs = DashMap::new();
        {
            let mut stmt = db
                .prepare("SELECT asset_id, thumb FROM assets WHERE thumb IS NOT NULL")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let thumb: Vec<u8> = row.get(1)?;
                    Ok((id, thumb))
                })
                .map_err(sql_err)?;
            for row in rows {
                let (id, thumb) = row.map_err(sql_err)?;
                thumbs.insert(AssetId(id), Bytes::from(thumb));
            }
        }
        info!(path = %db_path.display(), thumbnails = thumbs.len(), "Asset store opened");

        Ok(Self {
            db: Mutex::new(db),
            hot: DashMap::new(),
            hot_bytes: AtomicU64::new(0),
            hot_cap_bytes: DEFAULT_HOT_CAP_BYTES,
            thumbs,
            ledger: DashMap::new(),
            in_flight: DashMap::new(),
            transcoder,
            opened_at: Instant::now(),
        })
    }

    /// Ingest a locally uploaded asset. `existing` preserves referential
    /// identity on re-upload.
    pub async fn put(
        &self,
        bytes: Bytes,
        category: AssetCategory,
        existing: Option<AssetId>,
    ) -> Result<AssetRef, EngineError> {
        let policy = CategoryPolicy::for_category(category);
        let processed = self.transcoder.process(&bytes, &policy)?;
        let id = existing.unwrap_or_else(AssetId::generate);
        let meta = AssetMeta {
            category,
            content_hash: hex_sha256(&processed.bytes),
            declared_len: processed.bytes.len() as u64,
            created_at: crate::document::now_millis(),
        };
        self.write_row(&id, &processed.bytes, processed.thumbnail.as_ref(), &meta)
            .await?;
        self.populate_caches(&id, &processed.bytes, processed.thumbnail.clone());
        debug!(asset = %id, category = category.name(), bytes = processed.bytes.len(), "Asset stored");
        Ok(AssetRef {
            id,
            meta,
            thumbnail: processed.thumbnail,
        })
    }

    /// Ingest an asset received from a peer, keyed by the sender-supplied
    /// id. Idempotent: an id already stored, or concurrently being stored,
    /// is not written again.
    pub async fn put_received(
        &self,
        id: AssetId,
        bytes: Bytes,
        declared: AssetMeta,
    ) -> Result<IngestOutcome, EngineError> {
        loop {
            if let Some(meta) = self.meta(&id).await? {
                return Ok(IngestOutcome {
                    asset: AssetRef {
                        thumbnail: self.thumbnail(&id),
                        id,
                        meta,
                    },
                    newly_stored: false,
                });
            }
            if self.in_flight.insert(id.clone(), ()).is_none() {
                break;
            }
            // Another copy of the same id is mid-ingest. Wait for it
            // instead of reporting the asset held before anything was
            // written; if the winner fails, the next pass takes over.
            tokio::time::sleep(INGEST_POLL).await;
        }

        let result = self.ingest_received(&id, bytes, &declared).await;
        self.in_flight.remove(&id);
        result.map(|asset| IngestOutcome {
            asset,
            newly_stored: true,
        })
    }

    async fn ingest_received(
        &self,
        id: &AssetId,
        bytes: Bytes,
        declared: &AssetMeta,
    ) -> Result<AssetRef, EngineError> {
        let policy = CategoryPolicy::for_category(declared.category);
        let processed = self.transcoder.process(&bytes, &policy)?;
        let hash = hex_sha256(&processed.bytes);
        if hash != declared.content_hash {
            warn!(asset = %id, "Received asset hash differs from declared metadata");
        }
        let meta = AssetMeta {
            category: declared.category,
            content_hash: hash,
            declared_len: processed.bytes.len() as u64,
            created_at: declared.created_at,
        };
        self.write_row(id, &processed.bytes, processed.thumbnail.as_ref(), &meta)
            .await?;
        self.populate_caches(id, &processed.bytes, processed.thumbnail.clone());
        debug!(asset = %id, "Received asset stored");
        Ok(AssetRef {
            id: id.clone(),
            meta,
            thumbnail: processed.thumbnail,
        })
    }

    /// Fetch asset bytes: hot cache first, durable store on miss.
    pub async fn get(&self, id: &AssetId) -> Result<Option<Bytes>, EngineError> {
        if let Some(mut entry) = self.hot.get_mut(id) {
            entry.1 = self.stamp();
            return Ok(Some(entry.0.clone()));
        }
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare_cached("SELECT bytes FROM assets WHERE asset_id = ?1")
            .map_err(sql_err)?;
        match stmt.query_row([&id.0], |row| row.get::<_, Vec<u8>>(0)) {
            Ok(data) => {
                drop(stmt);
                drop(db);
                let bytes = Bytes::from(data);
                self.cache_hot(id, bytes.clone());
                Ok(Some(bytes))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(sql_err(e)),
        }
    }

    /// Thumbnail lookup, cache-only. Never touches the durable store.
    pub fn thumbnail(&self, id: &AssetId) -> Option<Bytes> {
        self.thumbs.get(id).map(|t| t.clone())
    }

    pub async fn contains(&self, id: &AssetId) -> Result<bool, EngineError> {
        Ok(self.meta(id).await?.is_some())
    }

    /// Stored metadata for an asset, if present.
    pub async fn meta(&self, id: &AssetId) -> Result<Option<AssetMeta>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare_cached(
                "SELECT content_hash, category, declared_len, created_at
                 FROM assets WHERE asset_id = ?1",
            )
            .map_err(sql_err)?;
        match stmt.query_row([&id.0], |row| {
            let hash: String = row.get(0)?;
            let category: String = row.get(1)?;
            let declared_len: u64 = row.get(2)?;
            let created_at: u64 = row.get(3)?;
            Ok((hash, category, declared_len, created_at))
        }) {
            Ok((content_hash, category, declared_len, created_at)) => Ok(Some(AssetMeta {
                category: parse_category(&category)?,
                content_hash,
                declared_len,
                created_at,
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(sql_err(e)),
        }
    }

    /// Delete an asset everywhere. The caller is responsible for nulling
    /// document references afterwards.
    pub async fn delete(&self, id: &AssetId) -> Result<bool, EngineError> {
        let db = self.db.lock().await;
        let changed = db
            .execute("DELETE FROM assets WHERE asset_id = ?1", [&id.0])
            .map_err(sql_err)?;
        drop(db);
        if let Some((_, (bytes, _))) = self.hot.remove(id) {
            self.hot_bytes.fetch_sub(bytes.len() as u64, Ordering::Relaxed);
        }
        self.thumbs.remove(id);
        Ok(changed > 0)
    }

    /// Record that `peer` acknowledged holding `id`. Idempotent.
    pub fn mark_known_by_peer(&self, id: &AssetId, peer: &PeerId) {
        self.ledger
            .entry(peer.clone())
            .or_default()
            .insert(id.clone());
    }

    pub fn peer_has_asset(&self, id: &AssetId, peer: &PeerId) -> bool {
        self.ledger
            .get(peer)
            .map_or(false, |known| known.contains(id))
    }

    /// Drop everything known about a peer. Acknowledgements are not
    /// assumed durable across reconnection.
    pub fn clear_peer_knowledge(&self, peer: &PeerId) {
        self.ledger.remove(peer);
    }

    /// Forget a single acknowledgement, forcing the next envelope for
    /// `peer` to inline this asset again. Used for explicit re-fetch
    /// requests.
    pub fn forget_peer_asset(&self, id: &AssetId, peer: &PeerId) {
        if let Some(mut known) = self.ledger.get_mut(peer) {
            known.remove(id);
        }
    }

    async fn write_row(
        &self,
        id: &AssetId,
        bytes: &Bytes,
        thumb: Option<&Bytes>,
        meta: &AssetMeta,
    ) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO assets (asset_id, bytes, thumb, content_hash, category, declared_len, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(asset_id) DO UPDATE SET
                 bytes = ?2, thumb = ?3, content_hash = ?4,
                 category = ?5, declared_len = ?6, created_at = ?7",
            rusqlite::params![
                id.0,
                bytes.as_ref(),
                thumb.map(|t| t.as_ref()),
                meta.content_hash,
                meta.category.name(),
                meta.declared_len,
                meta.created_at,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn populate_caches(&self, id: &AssetId, bytes: &Bytes, thumb: Option<Bytes>) {
        self.cache_hot(id, bytes.clone());
        if let Some(thumb) = thumb {
            self.thumbs.insert(id.clone(), thumb);
        }
    }

    fn cache_hot(&self, id: &AssetId, bytes: Bytes) {
        let len = bytes.len() as u64;
        if let Some((_, (old, _))) = self.hot.remove(id) {
            self.hot_bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
        }
        self.hot.insert(id.clone(), (bytes, self.stamp()));
        let total = self.hot_bytes.fetch_add(len, Ordering::Relaxed) + len;
        if total > self.hot_cap_bytes {
            self.evict_hot();
        }
    }

    /// Evict least-recently-stamped entries until under the cap. Linear
    /// scan per eviction; the hot set is small.
    fn evict_hot(&self) {
        while self.hot_bytes.load(Ordering::Relaxed) > self.hot_cap_bytes {
            let oldest = self
                .hot
                .iter()
                .min_by_key(|entry| entry.value().1)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(id) => {
                    if let Some((_, (bytes, _))) = self.hot.remove(&id) {
                        self.hot_bytes.fetch_sub(bytes.len() as u64, Ordering::Relaxed);
                    }
                }
                None => break,
            }
        }
    }

    fn stamp(&self) -> u64 {
        self.opened_at.elapsed().as_micros() as u64
    }
}

fn sql_err(e: rusqlite::Error) -> EngineError {
    EngineError::AssetIo(e.to_string())
}

fn hex_sha256(bytes: &Bytes) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn parse_category(name: &str) -> Result<AssetCategory, EngineError> {
    match name {
        "token" => Ok(AssetCategory::Token),
        "portrait" => Ok(AssetCategory::Portrait),
        "handout" => Ok(AssetCategory::Handout),
        "scene" => Ok(AssetCategory::Scene),
        other => Err(EngineError::AssetIo(format!(
            "unknown asset category in store: {}",
            other
        ))),
    }
}
