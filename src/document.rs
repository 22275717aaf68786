//! Canonical session document
//!
//! The document is the single replicated value for a room. It decomposes
//! into a fixed set of named entity collections plus scalar metadata, and
//! is only ever replaced wholesale: edits are pure transforms producing a
//! brand-new snapshot, never in-place mutations. That keeps "diff against
//! previous" well-defined for the safety guard and avoids per-field locks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::transport::PeerId;

/// Stable unique identifier for an entity within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier for a binary asset. Not a content hash: re-uploads
/// under the same id must preserve referential identity for entities
/// pointing at it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The fixed set of top-level collections. The safety guard evaluates
/// churn per collection, so the set is closed rather than free-form.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum CollectionKey {
    /// Player characters. The most sensitive collection.
    Roster,
    /// Items, creatures, reference entries.
    Catalog,
    /// Shared handout documents.
    Handouts,
    /// Scene/map entries.
    Scenes,
    /// Session log entries.
    Journal,
}

impl CollectionKey {
    pub const ALL: [CollectionKey; 5] = [
        CollectionKey::Roster,
        CollectionKey::Catalog,
        CollectionKey::Handouts,
        CollectionKey::Scenes,
        CollectionKey::Journal,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CollectionKey::Roster => "roster",
            CollectionKey::Catalog => "catalog",
            CollectionKey::Handouts => "handouts",
            CollectionKey::Scenes => "scenes",
            CollectionKey::Journal => "journal",
        }
    }
}

/// One entity in a collection. Domain fields are opaque to the engine;
/// the only parts it interprets are the id and the asset reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    /// Reference to an asset by id, never inlined bytes.
    #[serde(default)]
    pub asset: Option<AssetId>,
    /// Opaque domain payload.
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: EntityId::generate(),
            name: name.into(),
            asset: None,
            fields: serde_json::Map::new(),
        }
    }
}

/// An ordered sequence of entities with unique ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub entities: Vec<Entity>,
}

impl Collection {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.iter().find(|e| &e.id == id)
    }

    /// Insert or replace by entity id, preserving position on replace.
    pub fn upsert(&mut self, entity: Entity) {
        match self.entities.iter_mut().find(|e| e.id == entity.id) {
            Some(slot) => *slot = entity,
            None => self.entities.push(entity),
        }
    }

    pub fn remove(&mut self, id: &EntityId) -> bool {
        let before = self.entities.len();
        self.entities.retain(|e| &e.id != id);
        self.entities.len() != before
    }
}

/// The canonical session document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub session_name: String,
    #[serde(default)]
    pub notes: String,
    /// Claimable seats (roles) keyed by seat name. A seat claimed by a
    /// peer is cleared by the host when that peer disconnects.
    #[serde(default)]
    pub seats: BTreeMap<String, Option<PeerId>>,
    #[serde(default)]
    pub collections: BTreeMap<CollectionKey, Collection>,
}

impl Document {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            ..Default::default()
        }
    }

    pub fn collection(&self, key: CollectionKey) -> Option<&Collection> {
        self.collections.get(&key)
    }

    pub fn collection_len(&self, key: CollectionKey) -> usize {
        self.collections.get(&key).map_or(0, Collection::len)
    }

    /// Every asset id referenced anywhere in the document, deduplicated.
    pub fn asset_ids(&self) -> Vec<AssetId> {
        let mut ids: Vec<AssetId> = self
            .collections
            .values()
            .flat_map(|c| c.entities.iter().filter_map(|e| e.asset.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// New document with every seat claimed by `peer` released. Returns
    /// the unchanged document if the peer held nothing.
    pub fn clear_claims_by(&self, peer: &PeerId) -> Document {
        let mut next = self.clone();
        for claim in next.seats.values_mut() {
            if claim.as_ref() == Some(peer) {
                *claim = None;
            }
        }
        next
    }

    /// New document with every reference to `asset` nulled out. Used
    /// after explicit catalog deletion so no dangling reference survives.
    pub fn drop_asset_refs(&self, asset: &AssetId) -> Document {
        let mut next = self.clone();
        for collection in next.collections.values_mut() {
            for entity in &mut collection.entities {
                if entity.asset.as_ref() == Some(asset) {
                    entity.asset = None;
                }
            }
        }
        next
    }

    /// Whether any entity still references `asset`.
    pub fn references_asset(&self, asset: &AssetId) -> bool {
        self.collections
            .values()
            .any(|c| c.entities.iter().any(|e| e.asset.as_ref() == Some(asset)))
    }
}

/// Current Unix time in milliseconds, the document's logical clock.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
