//! Replication engine integration tests
//!
//! Drives real host + client engines over the in-process mesh transport:
//! - initial sync (document + inlined assets) on client join
//! - per-peer envelope tailoring and ack-driven shrinkage
//! - disconnect handling (claim clearing, ledger reset)
//! - safety guard rejection terminating the client connection

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use session_relay::assets::policy::{AssetCategory, PassthroughTranscoder};
use session_relay::assets::AssetStore;
use session_relay::config::ReplicationConfig;
use session_relay::document::{Collection, CollectionKey, Document, Entity};
use session_relay::engine::Snapshot;
use session_relay::guard::GuardConfig;
use session_relay::protocol::{self, Envelope, MutateOp, StateMessage, CHANNEL_STATE};
use session_relay::storage::{SessionRecord, SessionStore};
use session_relay::transport::memory::MemoryMesh;
use session_relay::transport::{PeerId, RoomHandle, RoomTransport};
use session_relay::{ConnectionStatus, EngineSettings, ReplicationEngine, Role, SessionHandle};

const ROOM: &str = "test-room";

fn fast_settings(role: Role) -> EngineSettings {
    EngineSettings {
        role,
        app_id: "session-relay-test".into(),
        room_id: ROOM.into(),
        replication: ReplicationConfig {
            settle_delay_ms: 30,
            deferred_retry_ms: 100,
            membership_poll_ms: 20,
        },
        guard: GuardConfig::default(),
    }
}

async fn start_host(
    mesh: &MemoryMesh,
    dir: &TempDir,
) -> (SessionHandle, Arc<AssetStore>, Arc<SessionStore>) {
    let assets = Arc::new(
        AssetStore::open(&dir.path().join("host"), Box::new(PassthroughTranscoder)).unwrap(),
    );
    let sessions = Arc::new(SessionStore::open(&dir.path().join("host")).unwrap());
    let handle = ReplicationEngine::start(
        Arc::new(mesh.clone()),
        assets.clone(),
        Some(sessions.clone()),
        fast_settings(Role::Host),
    )
    .await
    .unwrap();
    (handle, assets, sessions)
}

async fn start_client(
    mesh: &MemoryMesh,
    dir: &TempDir,
    name: &str,
) -> (SessionHandle, Arc<AssetStore>) {
    let assets = Arc::new(
        AssetStore::open(&dir.path().join(name), Box::new(PassthroughTranscoder)).unwrap(),
    );
    let handle = ReplicationEngine::start(
        Arc::new(mesh.clone()),
        assets.clone(),
        None,
        fast_settings(Role::Client),
    )
    .await
    .unwrap();
    (handle, assets)
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {}", what);
}

fn catalog_with(n: usize) -> Collection {
    let mut collection = Collection::default();
    for i in 0..n {
        collection.upsert(Entity::new(format!("entry-{}", i)));
    }
    collection
}

// =============================================================================
// Initial sync
// =============================================================================

#[tokio::test]
async fn client_receives_document_and_assets_on_join() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    let (host, _host_assets, _) = start_host(&mesh, &dir).await;

    let art = host
        .upload_asset(Bytes::from_static(b"goblin art"), AssetCategory::Token)
        .await
        .unwrap();
    let art_id = art.id.clone();
    host.apply_edit(move |doc| {
        let mut next = doc.clone();
        let mut entity = Entity::new("goblin");
        entity.asset = Some(art_id.clone());
        next.collections
            .entry(CollectionKey::Catalog)
            .or_default()
            .upsert(entity);
        next
    })
    .await
    .unwrap();

    let (client, client_assets) = start_client(&mesh, &dir, "client").await;
    wait_until("client sync", || {
        client.document().collection_len(CollectionKey::Catalog) == 1
    })
    .await;

    assert_eq!(client.status(), ConnectionStatus::Connected);
    assert_eq!(client.document().collections, host.document().collections);

    // Every asset reference resolves to usable bytes on the client side.
    let bytes = client_assets.get(&art.id).await.unwrap().unwrap();
    assert_eq!(bytes, Bytes::from_static(b"goblin art"));
}

#[tokio::test]
async fn host_resumes_persisted_session() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::open(&dir.path().join("host")).unwrap();
    let mut document = Document::new("saved campaign");
    document
        .collections
        .insert(CollectionKey::Roster, catalog_with(3));
    store
        .save(
            ROOM,
            &SessionRecord {
                document,
                last_modified: 777,
                host_id: PeerId::from("previous-host"),
            },
        )
        .await
        .unwrap();
    drop(store);

    let mesh = MemoryMesh::new();
    let (host, _, _) = start_host(&mesh, &dir).await;
    assert_eq!(host.document().session_name, "saved campaign");
    assert_eq!(host.document().collection_len(CollectionKey::Roster), 3);
    assert_eq!(host.stamp(), 777);
}

// =============================================================================
// Envelope tailoring and acknowledgements
// =============================================================================

#[tokio::test]
async fn acknowledged_assets_are_not_resent() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    let (host, host_assets, _) = start_host(&mesh, &dir).await;

    let art = host
        .upload_asset(Bytes::from_static(b"map art"), AssetCategory::Scene)
        .await
        .unwrap();
    let art_id = art.id.clone();
    host.apply_edit(move |doc| {
        let mut next = doc.clone();
        let mut entity = Entity::new("cave map");
        entity.asset = Some(art_id.clone());
        next.collections
            .entry(CollectionKey::Scenes)
            .or_default()
            .upsert(entity);
        next
    })
    .await
    .unwrap();

    let (client, _client_assets) = start_client(&mesh, &dir, "client").await;
    wait_until("client sync", || {
        client.document().collection_len(CollectionKey::Scenes) == 1
    })
    .await;

    // The ack travels back and lands in the host ledger.
    let client_id = client.local_peer().clone();
    wait_until("host ledger update", || {
        host_assets.peer_has_asset(&art.id, &client_id)
    })
    .await;

    // A second client joining later still gets the bytes: knowledge is
    // tracked per peer.
    let (client_b, client_b_assets) = start_client(&mesh, &dir, "client-b").await;
    wait_until("client-b sync", || {
        client_b.document().collection_len(CollectionKey::Scenes) == 1
    })
    .await;
    assert!(client_b_assets.get(&art.id).await.unwrap().is_some());
}

#[tokio::test]
async fn request_asset_reinlines_for_requester() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    let (host, _host_assets, _) = start_host(&mesh, &dir).await;

    let art = host
        .upload_asset(Bytes::from_static(b"portrait art"), AssetCategory::Portrait)
        .await
        .unwrap();
    let art_id = art.id.clone();
    host.apply_edit(move |doc| {
        let mut next = doc.clone();
        let mut entity = Entity::new("wizard");
        entity.asset = Some(art_id.clone());
        next.collections
            .entry(CollectionKey::Roster)
            .or_default()
            .upsert(entity);
        next
    })
    .await
    .unwrap();

    let (client, client_assets) = start_client(&mesh, &dir, "client").await;
    wait_until("client sync", || {
        client.document().collection_len(CollectionKey::Roster) == 1
    })
    .await;

    // Simulate local loss of the blob, then ask for it again.
    client_assets.delete(&art.id).await.unwrap();
    assert!(client_assets.get(&art.id).await.unwrap().is_none());
    client.request_asset(art.id.clone()).await.unwrap();

    let mut refetched = false;
    for _ in 0..200 {
        if client_assets.get(&art.id).await.unwrap().is_some() {
            refetched = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(refetched, "asset was not re-inlined after the request");
}

#[tokio::test]
async fn stale_stamped_snapshot_is_discarded() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    // Hand-driven sender speaking the wire protocol directly, so stamps
    // can arrive out of order.
    let (feeder, _feeder_rx) = mesh.join("session-relay-test", ROOM).await.unwrap();
    let (client, _) = start_client(&mesh, &dir, "client").await;

    let mut newer = Document::new(ROOM);
    newer.notes = "first".into();
    let msg = StateMessage {
        sender: feeder.local_peer(),
        stamp: 100,
        envelope: Envelope {
            document: newer,
            assets: Vec::new(),
        },
    };
    feeder
        .send(
            CHANNEL_STATE,
            Some(client.local_peer()),
            protocol::encode(&msg).unwrap(),
        )
        .await
        .unwrap();
    wait_until("newer snapshot applied", || {
        client.document().notes == "first"
    })
    .await;
    assert_eq!(client.stamp(), 100);

    let mut older = Document::new(ROOM);
    older.notes = "second".into();
    let msg = StateMessage {
        sender: feeder.local_peer(),
        stamp: 50,
        envelope: Envelope {
            document: older,
            assets: Vec::new(),
        },
    };
    feeder
        .send(
            CHANNEL_STATE,
            Some(client.local_peer()),
            protocol::encode(&msg).unwrap(),
        )
        .await
        .unwrap();

    // The older stamp must be discarded, never applied or merged.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.document().notes, "first");
    assert_eq!(client.stamp(), 100);
}

// =============================================================================
// Asset lifecycle
// =============================================================================

#[tokio::test]
async fn replace_asset_preserves_referential_identity() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    let (host, host_assets, _) = start_host(&mesh, &dir).await;

    let first = host
        .upload_asset(Bytes::from_static(b"draft art"), AssetCategory::Handout)
        .await
        .unwrap();
    let second = host
        .replace_asset(
            first.id.clone(),
            Bytes::from_static(b"final art"),
            AssetCategory::Handout,
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(
        host_assets.get(&first.id).await.unwrap().unwrap(),
        Bytes::from_static(b"final art")
    );
}

#[tokio::test]
async fn delete_asset_nulls_references_everywhere() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    let (host, host_assets, _) = start_host(&mesh, &dir).await;

    let art = host
        .upload_asset(Bytes::from_static(b"old map"), AssetCategory::Scene)
        .await
        .unwrap();
    let art_id = art.id.clone();
    host.apply_edit(move |doc| {
        let mut next = doc.clone();
        let mut entity = Entity::new("old cave");
        entity.asset = Some(art_id.clone());
        next.collections
            .entry(CollectionKey::Scenes)
            .or_default()
            .upsert(entity);
        next
    })
    .await
    .unwrap();

    let (client, _) = start_client(&mesh, &dir, "client").await;
    wait_until("client sync", || {
        client.document().collection_len(CollectionKey::Scenes) == 1
    })
    .await;

    assert!(host.delete_asset(art.id.clone()).await.unwrap());
    assert!(host_assets.get(&art.id).await.unwrap().is_none());
    assert!(!host.document().references_asset(&art.id));

    // The nulled reference propagates to the client.
    wait_until("client sees nulled reference", || {
        !client.document().references_asset(&art.id)
    })
    .await;
    assert_eq!(client.document().collection_len(CollectionKey::Scenes), 1);
}

// =============================================================================
// Client mutations
// =============================================================================

#[tokio::test]
async fn client_mutation_is_applied_by_host_and_rebroadcast() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    let (host, _, _) = start_host(&mesh, &dir).await;
    let (client, _) = start_client(&mesh, &dir, "client").await;
    wait_until("client connect", || {
        client.status() == ConnectionStatus::Connected
    })
    .await;

    client
        .mutate(MutateOp::ClaimSeat {
            seat: "navigator".into(),
        })
        .await
        .unwrap();

    let client_id = client.local_peer().clone();
    wait_until("host applies claim", || {
        host.document().seats.get("navigator") == Some(&Some(client_id.clone()))
    })
    .await;
    let client_id = client.local_peer().clone();
    wait_until("client sees claim", || {
        client.document().seats.get("navigator") == Some(&Some(client_id.clone()))
    })
    .await;
}

// =============================================================================
// Disconnect handling
// =============================================================================

#[tokio::test]
async fn disconnect_clears_claims_and_ledger() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    let (host, host_assets, _) = start_host(&mesh, &dir).await;

    let art = host
        .upload_asset(Bytes::from_static(b"token art"), AssetCategory::Token)
        .await
        .unwrap();
    let art_id = art.id.clone();
    host.apply_edit(move |doc| {
        let mut next = doc.clone();
        let mut entity = Entity::new("rogue");
        entity.asset = Some(art_id.clone());
        next.collections
            .entry(CollectionKey::Roster)
            .or_default()
            .upsert(entity);
        next
    })
    .await
    .unwrap();

    let (client, _) = start_client(&mesh, &dir, "client").await;
    wait_until("client connect", || {
        client.status() == ConnectionStatus::Connected
    })
    .await;
    client
        .mutate(MutateOp::ClaimSeat {
            seat: "captain".into(),
        })
        .await
        .unwrap();
    let client_id = client.local_peer().clone();
    wait_until("claim visible on host", || {
        host.document().seats.get("captain") == Some(&Some(client_id.clone()))
    })
    .await;
    let client_id = client.local_peer().clone();
    wait_until("ack in ledger", || {
        host_assets.peer_has_asset(&art.id, &client_id)
    })
    .await;

    // Silent drop: no leave message, the poll has to notice.
    mesh.kill_peer(ROOM, client.local_peer());

    wait_until("claim cleared", || {
        host.document().seats.get("captain") == Some(&None)
    })
    .await;
    assert!(!host_assets.peer_has_asset(&art.id, client.local_peer()));
}

// =============================================================================
// Safety guard
// =============================================================================

#[tokio::test]
async fn unsafe_broadcast_terminates_client() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    let (host, _, _) = start_host(&mesh, &dir).await;

    host.apply_edit(|doc| {
        let mut next = doc.clone();
        next.collections
            .insert(CollectionKey::Catalog, catalog_with(20));
        next
    })
    .await
    .unwrap();

    let (client, _) = start_client(&mesh, &dir, "client").await;
    wait_until("client sync", || {
        client.document().collection_len(CollectionKey::Catalog) == 20
    })
    .await;

    // Wipe the catalog: 100% churn on a 20-entity collection, far over
    // the 60% ceiling. The client must refuse and leave, not apply.
    host.apply_edit(|doc| {
        let mut next = doc.clone();
        next.collections
            .insert(CollectionKey::Catalog, Collection::default());
        next
    })
    .await
    .unwrap();

    wait_until("client rejects", || {
        matches!(client.status(), ConnectionStatus::Error(_))
    })
    .await;
    // The local copy was never touched.
    assert_eq!(client.document().collection_len(CollectionKey::Catalog), 20);

    match client.status() {
        ConnectionStatus::Error(reason) => assert!(reason.contains("unsafe state")),
        other => panic!("expected error status, got {:?}", other),
    }
}

#[tokio::test]
async fn moderate_churn_is_applied() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    let (host, _, _) = start_host(&mesh, &dir).await;
    host.apply_edit(|doc| {
        let mut next = doc.clone();
        next.collections
            .insert(CollectionKey::Catalog, catalog_with(20));
        next
    })
    .await
    .unwrap();

    let (client, _) = start_client(&mesh, &dir, "client").await;
    wait_until("client sync", || {
        client.document().collection_len(CollectionKey::Catalog) == 20
    })
    .await;

    // 7 of 20 removed: 35% churn, below the ceiling.
    host.apply_edit(|doc| {
        let mut next = doc.clone();
        next.collections
            .insert(CollectionKey::Catalog, catalog_with(13));
        next
    })
    .await
    .unwrap();

    wait_until("client applies update", || {
        client.document().collection_len(CollectionKey::Catalog) == 13
    })
    .await;
    assert_eq!(client.status(), ConnectionStatus::Connected);
}

// =============================================================================
// Snapshot and status subscription
// =============================================================================

#[tokio::test]
async fn client_status_transitions_to_connected() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    let (_host, _, _) = start_host(&mesh, &dir).await;

    let (client, _) = start_client(&mesh, &dir, "client").await;
    let mut status = client.status_updates();
    assert!(matches!(
        *status.borrow(),
        ConnectionStatus::Connecting | ConnectionStatus::Connected
    ));
    while *status.borrow() != ConnectionStatus::Connected {
        tokio::time::timeout(Duration::from_secs(2), status.changed())
            .await
            .expect("status update")
            .unwrap();
    }
}

// =============================================================================
// Snapshot subscription
// =============================================================================

#[tokio::test]
async fn subscribers_observe_installed_snapshots() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    let (host, _, _) = start_host(&mesh, &dir).await;
    let mut watcher = host.subscribe();

    host.apply_edit(|doc| {
        let mut next = doc.clone();
        next.notes = "session zero".into();
        next
    })
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), watcher.changed())
        .await
        .expect("snapshot update")
        .unwrap();
    let snapshot: Snapshot = watcher.borrow().clone();
    assert_eq!(snapshot.document.notes, "session zero");
    assert!(snapshot.stamp > 0);
}

#[tokio::test]
async fn leave_persists_and_stops_engine() {
    let dir = TempDir::new().unwrap();
    let mesh = MemoryMesh::new();
    let (host, _, sessions) = start_host(&mesh, &dir).await;
    host.apply_edit(|doc| {
        let mut next = doc.clone();
        next.session_name = "to be saved".into();
        next
    })
    .await
    .unwrap();

    host.leave().await.unwrap();
    assert_eq!(host.status(), ConnectionStatus::Disconnected);

    let record = sessions.load(ROOM).await.unwrap().unwrap();
    assert_eq!(record.document.session_name, "to be saved");

    // Engine is gone; further commands fail closed.
    assert!(host.save().await.is_err());
}
