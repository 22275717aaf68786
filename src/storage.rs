//! Host-side session persistence
//!
//! One record per room id: the canonical document, its logical clock, and
//! the host identity that wrote it. Loaded at room join, written only on
//! explicit save. SQLite in WAL mode, same connection discipline as the
//! asset store.

use std::path::Path;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::document::Document;
use crate::error::EngineError;
use crate::transport::PeerId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub document: Document,
    pub last_modified: u64,
    pub host_id: PeerId,
}

pub struct SessionStore {
    db: Mutex<Connection>,
}

impl SessionStore {
    pub fn open(data_dir: &Path) -> Result<Self, EngineError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| EngineError::AssetIo(format!("creating data directory: {}", e)))?;
        let db_path = data_dir.join("sessions.db");
        let db = Connection::open(&db_path)?;

        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                room_id TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                last_modified INTEGER NOT NULL,
                host_id TEXT NOT NULL
            );",
        )?;
        info!(path = %db_path.display(), "Session store opened");

        Ok(Self { db: Mutex::new(db) })
    }

    pub async fn load(&self, room_id: &str) -> Result<Option<SessionRecord>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare_cached(
            "SELECT document, last_modified, host_id FROM sessions WHERE room_id = ?1",
        )?;
        match stmt.query_row([room_id], |row| {
            let document: String = row.get(0)?;
            let last_modified: u64 = row.get(1)?;
            let host_id: String = row.get(2)?;
            Ok((document, last_modified, host_id))
        }) {
            Ok((document_json, last_modified, host_id)) => {
                let document: Document = serde_json::from_str(&document_json)
                    .map_err(|e| EngineError::Protocol(format!("stored document: {}", e)))?;
                debug!(room_id, last_modified, "Loaded session record");
                Ok(Some(SessionRecord {
                    document,
                    last_modified,
                    host_id: PeerId(host_id),
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, room_id: &str, record: &SessionRecord) -> Result<(), EngineError> {
        let document_json = serde_json::to_string(&record.document)
            .map_err(|e| EngineError::Protocol(format!("serializing document: {}", e)))?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO sessions (room_id, document, last_modified, host_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(room_id) DO UPDATE SET
                 document = ?2, last_modified = ?3, host_id = ?4",
            rusqlite::params![
                room_id,
                document_json,
                record.last_modified,
                record.host_id.0
            ],
        )?;
        debug!(room_id, bytes = document_json.len(), "Saved session record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Collection, CollectionKey, Entity};
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let mut document = Document::new("friday night");
        let mut roster = Collection::default();
        roster.upsert(Entity::new("ranger"));
        document.collections.insert(CollectionKey::Roster, roster);

        let record = SessionRecord {
            document: document.clone(),
            last_modified: 1234,
            host_id: PeerId::from("host-1"),
        };
        store.save("room-7", &record).await.unwrap();

        let loaded = store.load("room-7").await.unwrap().unwrap();
        assert_eq!(loaded.document, document);
        assert_eq!(loaded.last_modified, 1234);
        assert_eq!(loaded.host_id, PeerId::from("host-1"));
    }

    #[tokio::test]
    async fn load_missing_room_is_none() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        assert!(store.load("nowhere").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_existing_record() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let record = SessionRecord {
            document: Document::new("v1"),
            last_modified: 1,
            host_id: PeerId::from("host-1"),
        };
        store.save("room", &record).await.unwrap();

        let updated = SessionRecord {
            document: Document::new("v2"),
            last_modified: 2,
            host_id: PeerId::from("host-1"),
        };
        store.save("room", &updated).await.unwrap();

        let loaded = store.load("room").await.unwrap().unwrap();
        assert_eq!(loaded.document.session_name, "v2");
        assert_eq!(loaded.last_modified, 2);
    }
}
