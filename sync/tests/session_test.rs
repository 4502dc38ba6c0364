//! Session facade behavior: events, durable persistence across sessions,
//! migration gating with full resync, and tenant scoping.

mod common;

use common::{fast_config, wait_for_drain, wait_for_status, Delivery, SimApi};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether_engine::MigrationStep;
use tether_sync::{
    ChangeKind, JsonFileBackend, MigrationOutcome, OperationKind, RemoteEntity, SyncError,
    SyncSession,
};

fn sale(entity_id: &str, version: u64, amount: i64) -> RemoteEntity {
    RemoteEntity {
        entity_type: "sales".to_string(),
        entity_id: entity_id.to_string(),
        version,
        data: json!({"amount": amount}),
        deleted: false,
    }
}

async fn open_file_session(
    dir: &std::path::Path,
    api: Arc<SimApi>,
    tenant: &str,
    schema_version: u32,
    steps: &[MigrationStep],
) -> Result<(SyncSession, MigrationOutcome), SyncError> {
    SyncSession::open(
        Box::new(JsonFileBackend::for_tenant(dir, tenant)),
        api,
        tenant,
        schema_version,
        steps,
        fast_config(),
    )
    .await
}

#[tokio::test]
async fn enqueue_emits_event_then_replay_confirms() {
    let api = Arc::new(SimApi::new());
    let (session, _) = SyncSession::open(
        Box::new(tether_engine::MemoryBackend::new()),
        { let api = Arc::clone(&api); api },
        "clinic-a",
        1,
        &[],
        fast_config(),
    )
    .await
    .unwrap();

    let mut events = session.subscribe();

    session
        .enqueue("sales", "sale-local-1", OperationKind::Create, json!({"amount": 100}), None)
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.entity_id, "sale-local-1");
    assert_eq!(first.change, ChangeKind::Enqueued);

    // The replay confirms under the server-assigned id; watchers of the
    // temporary id are notified too.
    let mut saw_temp = false;
    let mut saw_server = false;
    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.change, ChangeKind::Applied);
        saw_temp |= event.entity_id == "sale-local-1";
        saw_server |= event.entity_id == "srv-1";
    }
    assert!(saw_temp && saw_server);
    session.shutdown().await;
}

#[tokio::test]
async fn pending_operations_survive_session_restart() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(SimApi::with_entities(vec![sale("sale-42", 1, 100)]));
    // Enough failures to keep the operation parked while we shut down.
    api.script(&[Delivery::Unreachable; 5]);

    let op_id = {
        let (session, _) = open_file_session(dir.path(), Arc::clone(&api), "clinic-a", 1, &[])
            .await
            .unwrap();
        let op_id = session
            .enqueue("sales", "sale-42", OperationKind::Update, json!({"amount": 150}), Some(1))
            .await
            .unwrap();
        wait_for_status(&session, |s| s.failed == 1).await;
        session.shutdown().await;
        op_id
    };

    // New session over the same file: the operation is still there, same
    // idempotency key, and a manual retry against a healthy server drains.
    let healthy = Arc::new(SimApi::with_entities(vec![sale("sale-42", 1, 100)]));
    let (session, outcome) = open_file_session(dir.path(), Arc::clone(&healthy), "clinic-a", 1, &[])
        .await
        .unwrap();
    assert_eq!(outcome, MigrationOutcome::AlreadyCurrent);

    let pending = session.list_pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation_id, op_id);
    assert_eq!(pending[0].payload, json!({"amount": 150}));

    session.retry(&op_id).await.unwrap();
    wait_for_drain(&session).await;
    assert_eq!(healthy.entity("sales", "sale-42").unwrap().data, json!({"amount": 150}));
    session.shutdown().await;
}

#[tokio::test]
async fn cleared_migration_resyncs_from_server() {
    fn unmigratable(_raw: &mut serde_json::Value) -> Result<(), String> {
        Err("records cannot be mapped".to_string())
    }

    let dir = tempfile::tempdir().unwrap();

    // Establish a schema-1 store on disk with one confirmed entity.
    {
        let api = Arc::new(SimApi::new());
        let (session, _) = open_file_session(dir.path(), Arc::clone(&api), "clinic-a", 1, &[])
            .await
            .unwrap();
        session
            .enqueue("sales", "sale-local-1", OperationKind::Create, json!({"amount": 100}), None)
            .await
            .unwrap();
        wait_for_drain(&session).await;
        session.shutdown().await;
    }

    // Reopen expecting schema 2 with a step that cannot run: the store is
    // cleared and repopulated from a full server fetch before the session is
    // handed out.
    let api = Arc::new(SimApi::with_entities(vec![
        sale("srv-1", 1, 100),
        sale("sale-77", 4, 900),
    ]));
    let steps = [MigrationStep::new(2, unmigratable)];
    let (session, outcome) = open_file_session(dir.path(), Arc::clone(&api), "clinic-a", 2, &steps)
        .await
        .unwrap();

    assert!(matches!(outcome, MigrationOutcome::Cleared { .. }));
    assert_eq!(session.status().await.total(), 0);
    assert_eq!(session.snapshot("sales", "srv-1").await.unwrap().data, json!({"amount": 100}));
    assert_eq!(session.snapshot("sales", "sale-77").await.unwrap().version, 4);
    session.shutdown().await;
}

#[tokio::test]
async fn clean_migration_keeps_local_data() {
    fn add_channel(raw: &mut serde_json::Value) -> Result<(), String> {
        let snapshots = raw
            .get_mut("snapshots")
            .and_then(|s| s.as_object_mut())
            .ok_or("snapshots missing")?;
        for by_id in snapshots.values_mut() {
            for snap in by_id.as_object_mut().ok_or("bad shape")?.values_mut() {
                snap["data"]["channel"] = json!("store");
            }
        }
        Ok(())
    }

    let dir = tempfile::tempdir().unwrap();

    {
        let api = Arc::new(SimApi::new());
        let (session, _) = open_file_session(dir.path(), Arc::clone(&api), "clinic-a", 1, &[])
            .await
            .unwrap();
        session
            .enqueue("sales", "sale-local-1", OperationKind::Create, json!({"amount": 100}), None)
            .await
            .unwrap();
        wait_for_drain(&session).await;
        session.shutdown().await;
    }

    let api = Arc::new(SimApi::new());
    let steps = [MigrationStep::new(2, add_channel)];
    let (session, outcome) = open_file_session(dir.path(), Arc::clone(&api), "clinic-a", 2, &steps)
        .await
        .unwrap();

    assert_eq!(outcome, MigrationOutcome::Migrated { from: 1, to: 2 });
    let snap = session.snapshot("sales", "srv-1").await.unwrap();
    assert_eq!(snap.data, json!({"amount": 100, "channel": "store"}));
    session.shutdown().await;
}

#[tokio::test]
async fn tenants_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(SimApi::new());
    // Keep the operation parked so it is observable from the other session.
    api.script(&[Delivery::Unreachable; 20]);

    let (session_a, _) = open_file_session(dir.path(), Arc::clone(&api), "clinic-a", 1, &[])
        .await
        .unwrap();
    session_a
        .enqueue("patients", "p-1", OperationKind::Create, json!({"name": "Ayse"}), None)
        .await
        .unwrap();

    let (session_b, _) = open_file_session(dir.path(), Arc::clone(&api), "clinic-b", 1, &[])
        .await
        .unwrap();

    // Tenant B sees none of tenant A's queue or entities.
    assert!(session_b.list_pending().await.is_empty());
    assert!(session_b.snapshot("patients", "p-1").await.is_none());

    session_a.shutdown().await;
    session_b.shutdown().await;
}

#[tokio::test]
async fn opening_a_foreign_tenant_store_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(SimApi::new());
    api.script(&[Delivery::Unreachable; 20]);

    {
        let (session, _) = open_file_session(dir.path(), Arc::clone(&api), "clinic-a", 1, &[])
            .await
            .unwrap();
        session
            .enqueue("patients", "p-1", OperationKind::Create, json!({"name": "Ayse"}), None)
            .await
            .unwrap();
        session.shutdown().await;
    }

    // Same backing file, different session tenant: refused before anything
    // can replay under the wrong context.
    let result = SyncSession::open(
        Box::new(JsonFileBackend::for_tenant(dir.path(), "clinic-a")),
        { let api = Arc::clone(&api); api },
        "clinic-b",
        1,
        &[],
        fast_config(),
    )
    .await;

    assert!(matches!(
        result,
        Err(SyncError::Engine(tether_engine::Error::TenantMismatch { .. }))
    ));
}

#[tokio::test]
async fn discard_reverts_the_optimistic_snapshot() {
    let api = Arc::new(SimApi::with_entities(vec![sale("sale-42", 2, 100)]));
    let (session, _) = SyncSession::open(
        Box::new(tether_engine::MemoryBackend::new()),
        { let api = Arc::clone(&api); api },
        "clinic-a",
        1,
        &[],
        fast_config(),
    )
    .await
    .unwrap();

    // Stale edit: parks as conflict with the server state confirmed locally.
    let op_id = session
        .enqueue("sales", "sale-42", OperationKind::Update, json!({"amount": 150}), Some(1))
        .await
        .unwrap();
    wait_for_status(&session, |s| s.conflict == 1).await;
    assert_eq!(session.snapshot("sales", "sale-42").await.unwrap().data, json!({"amount": 150}));

    // Take theirs by discarding: the snapshot reverts to the confirmed state
    // and the payload comes back for potential editing.
    let discarded = session.discard(&op_id).await.unwrap();
    assert_eq!(discarded.payload, json!({"amount": 150}));
    assert_eq!(session.snapshot("sales", "sale-42").await.unwrap().data, json!({"amount": 100}));
    session.shutdown().await;
}
