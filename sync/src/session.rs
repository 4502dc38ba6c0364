//! The embeddable session facade.
//!
//! A [`SyncSession`] is one tenant's engine plus its background replayer.
//! Opening a session runs migrations before anything else touches storage,
//! performs a full resync when the store demands one, and only then spawns
//! the replayer. UI collaborators enqueue intents and read derived snapshots
//! here; they never talk to the network themselves.

use crate::api::RemoteApi;
use crate::clock::SystemClock;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::replayer::Replayer;
use dashmap::DashSet;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tether_engine::{
    ConflictChoice, EntityKey, EntitySnapshot, MigrationOutcome, MigrationStep, Operation,
    OperationKind, Outbox, OutboxStatus, SchemaVersion, StorageBackend, Version,
};

/// Capacity of the change-event channel; slow subscribers lag, they do not
/// block the engine.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    /// A local intent was enqueued; the optimistic snapshot changed.
    Enqueued,
    /// A replay completed and the confirmed snapshot changed.
    Applied,
    /// A replay was parked as a conflict awaiting user resolution.
    Conflict,
    /// An operation failed permanently and awaits retry or discard.
    Failed,
    /// A pending operation was discarded; the snapshot reverted.
    Discarded,
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub entity_type: String,
    pub entity_id: String,
    pub change: ChangeKind,
}

/// State shared between the session facade and the replayer task.
pub(crate) struct Shared {
    /// Single serialization point for UI reads and engine writes.
    pub(crate) outbox: Mutex<Outbox>,
    pub(crate) api: Arc<dyn RemoteApi>,
    pub(crate) config: SyncConfig,
    /// Entities with an operation currently on the wire.
    pub(crate) in_flight: DashSet<EntityKey>,
    /// Wakes the replayer on enqueue/retry/resolve.
    pub(crate) notify: Notify,
    pub(crate) events: broadcast::Sender<ChangeEvent>,
    pub(crate) stopped: AtomicBool,
}

impl Shared {
    pub(crate) fn emit(&self, entity_type: &str, entity_id: &str, change: ChangeKind) {
        // No receivers is fine; events are best-effort.
        let _ = self.events.send(ChangeEvent {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            change,
        });
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

/// One tenant's offline queue, store and background replayer.
pub struct SyncSession {
    shared: Arc<Shared>,
    worker: tokio::task::JoinHandle<()>,
}

impl SyncSession {
    /// Open the session for a tenant.
    ///
    /// Order matters and is part of the contract: the migration runner goes
    /// first (via [`Outbox::open`]), a cleared store triggers a full resync
    /// fetch, and the replayer only spawns once the store is usable. The
    /// returned [`MigrationOutcome`] tells the UI whether to show a one-time
    /// loading state instead of partial data.
    pub async fn open(
        backend: Box<dyn StorageBackend>,
        api: Arc<dyn RemoteApi>,
        tenant_id: impl Into<String>,
        schema_version: SchemaVersion,
        steps: &[MigrationStep],
        config: SyncConfig,
    ) -> Result<(Self, MigrationOutcome)> {
        config.validate().map_err(SyncError::Config)?;
        let tenant_id = tenant_id.into();

        let (mut outbox, outcome) = Outbox::open(
            backend,
            Box::new(SystemClock::new()),
            tenant_id.clone(),
            schema_version,
            steps,
        )?;

        match &outcome {
            MigrationOutcome::AlreadyCurrent => {}
            MigrationOutcome::Migrated { from, to } => {
                tracing::info!(tenant = %tenant_id, from, to, "store schema migrated");
            }
            MigrationOutcome::Cleared { failed_at, reason } => {
                tracing::warn!(
                    tenant = %tenant_id,
                    failed_at,
                    reason = %reason,
                    "migration failed; store cleared, full resync required"
                );
            }
        }

        if outbox.resync_required() {
            let entities = api.fetch_all(&tenant_id).await?;
            let loaded = outbox.complete_resync(entities)?;
            tracing::info!(tenant = %tenant_id, loaded, "full resync completed");
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            outbox: Mutex::new(outbox),
            api,
            config,
            in_flight: DashSet::new(),
            notify: Notify::new(),
            events,
            stopped: AtomicBool::new(false),
        });

        let worker = tokio::spawn(Replayer::new(Arc::clone(&shared)).run());

        Ok((Self { shared, worker }, outcome))
    }

    /// Enqueue a write intent; durable before this returns, optimistically
    /// visible immediately, and never blocked on the network.
    pub async fn enqueue(
        &self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        kind: OperationKind,
        payload: serde_json::Value,
        base_version: Option<Version>,
    ) -> Result<String> {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();

        let operation_id = {
            let mut outbox = self.shared.outbox.lock().await;
            outbox.enqueue(
                entity_type.clone(),
                entity_id.clone(),
                kind,
                payload,
                base_version,
            )?
        };

        self.shared.emit(&entity_type, &entity_id, ChangeKind::Enqueued);
        self.shared.notify.notify_one();
        Ok(operation_id)
    }

    /// Subscribe to change events. Receivers filter by entity as needed.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.shared.events.subscribe()
    }

    /// Optimistic snapshot of one entity.
    pub async fn snapshot(&self, entity_type: &str, entity_id: &str) -> Option<EntitySnapshot> {
        self.shared.outbox.lock().await.snapshot(entity_type, entity_id)
    }

    /// Optimistic snapshots of every entity of a type.
    pub async fn snapshots(&self, entity_type: &str) -> Vec<EntitySnapshot> {
        self.shared.outbox.lock().await.snapshots(entity_type)
    }

    /// Every live operation, for sync-status UI.
    pub async fn list_pending(&self) -> Vec<Operation> {
        self.shared
            .outbox
            .lock()
            .await
            .list_pending()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Live operation counts by status; answered without touching the network.
    pub async fn status(&self) -> OutboxStatus {
        self.shared.outbox.lock().await.status()
    }

    /// Re-arm a permanently failed operation, keeping its idempotency key.
    pub async fn retry(&self, operation_id: &str) -> Result<()> {
        self.shared.outbox.lock().await.retry(operation_id)?;
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Drop a failed or conflicted operation. Returns it so the caller can
    /// reuse the payload for an edited resubmission (which is a new enqueue
    /// with a new operation id).
    pub async fn discard(&self, operation_id: &str) -> Result<Operation> {
        let discarded = self.shared.outbox.lock().await.discard(operation_id)?;
        self.shared.emit(
            &discarded.entity_type,
            &discarded.entity_id,
            ChangeKind::Discarded,
        );
        Ok(discarded)
    }

    /// Apply the user's decision to a conflicted operation.
    pub async fn resolve_conflict(
        &self,
        operation_id: &str,
        choice: ConflictChoice,
    ) -> Result<()> {
        let (entity_type, entity_id) = {
            let mut outbox = self.shared.outbox.lock().await;
            let op = outbox
                .operation(operation_id)
                .ok_or_else(|| tether_engine::Error::UnknownOperation(operation_id.to_string()))?;
            let target = (op.entity_type.clone(), op.entity_id.clone());
            outbox.resolve_conflict(operation_id, choice)?;
            target
        };

        match choice {
            ConflictChoice::KeepMine => {
                self.shared.emit(&entity_type, &entity_id, ChangeKind::Enqueued);
                self.shared.notify.notify_one();
            }
            ConflictChoice::TakeTheirs => {
                self.shared.emit(&entity_type, &entity_id, ChangeKind::Discarded);
            }
        }
        Ok(())
    }

    /// Stop the replayer and wait for it to finish its current round.
    pub async fn shutdown(self) {
        self.shared.stopped.store(true, Ordering::Relaxed);
        self.shared.notify.notify_waiters();
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "replayer task ended abnormally");
        }
    }
}
