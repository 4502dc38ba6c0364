//! Outbox - the durable mutation queue and local store.
//!
//! The Outbox owns the persisted document (confirmed snapshots + operation
//! log), the storage backend and the clock. Enqueued operations are persisted
//! before `enqueue` returns, and the UI-visible snapshot is always derived:
//! last confirmed state with the entity's live operations applied in enqueue
//! order, so an optimistic read never needs a separate apply step.

use crate::{
    clock::Clock,
    error::Result,
    migrate::{MigrationOutcome, MigrationRunner, MigrationStep},
    operation::{Operation, OperationKind, OperationStatus},
    storage::{StorageBackend, StoreDocument},
    EntityId, EntitySnapshot, EntityType, Error, OperationId, SchemaVersion, TenantId, Timestamp,
    Version,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Key identifying one entity across collections.
pub type EntityKey = (EntityType, EntityId);

/// Counts of live operations by status, for sync-status indicators.
///
/// Answered purely from local state; no network is consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxStatus {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub conflict: usize,
}

impl OutboxStatus {
    /// Total operations still in the log.
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.failed + self.conflict
    }
}

/// The durable mutation queue for one tenant's store.
pub struct Outbox {
    pub(crate) document: StoreDocument,
    pub(crate) backend: Box<dyn StorageBackend>,
    pub(crate) clock: Box<dyn Clock>,
}

impl Outbox {
    /// Open the store for a tenant, running migrations first.
    ///
    /// No outbox exists until the migration runner reports a terminal
    /// outcome, which is how the "nothing touches storage before the version
    /// check" rule is enforced. Operations found `in_flight` (a crash between
    /// send and response) are demoted to `pending`; resending with the same
    /// idempotency key is safe.
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        clock: Box<dyn Clock>,
        tenant_id: impl Into<TenantId>,
        expected_version: SchemaVersion,
        steps: &[MigrationStep],
    ) -> Result<(Self, MigrationOutcome)> {
        let tenant_id = tenant_id.into();

        let mut runner = MigrationRunner::new(expected_version, steps);
        let outcome = runner.run(backend.as_mut())?;

        let document = match backend.load()? {
            Some(raw) => {
                let doc = StoreDocument::from_value(raw)?;
                if doc.tenant_id != tenant_id {
                    return Err(Error::TenantMismatch {
                        expected: tenant_id,
                        found: doc.tenant_id,
                    });
                }
                doc
            }
            None => {
                let mut doc = StoreDocument::new(expected_version, tenant_id);
                doc.resync_required = outcome.resync_required();
                doc
            }
        };

        let mut outbox = Self {
            document,
            backend,
            clock,
        };

        let mut dirty = outcome.resync_required();
        for op in &mut outbox.document.operations {
            if op.status == OperationStatus::InFlight {
                op.transition(OperationStatus::Pending)?;
                dirty = true;
            }
        }
        if dirty {
            outbox.persist()?;
        }

        Ok((outbox, outcome))
    }

    /// Tenant this store belongs to.
    pub fn tenant_id(&self) -> &TenantId {
        &self.document.tenant_id
    }

    /// Schema version of the open document.
    pub fn schema_version(&self) -> SchemaVersion {
        self.document.schema_version
    }

    /// Whether the next fetch must be a full resync.
    pub fn resync_required(&self) -> bool {
        self.document.resync_required
    }

    /// Enqueue a write intent.
    ///
    /// The operation is durably persisted before this returns and is
    /// immediately visible through [`Outbox::snapshot`]. Never touches the
    /// network.
    pub fn enqueue(
        &mut self,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        kind: OperationKind,
        payload: serde_json::Value,
        base_version: Option<Version>,
    ) -> Result<OperationId> {
        let enqueued_at = self.clock.now_ms();
        let operation_id = self.clock.next_operation_id();

        self.document.operations.push(Operation::new(
            operation_id.clone(),
            entity_type,
            entity_id,
            kind,
            payload,
            base_version,
            enqueued_at,
        ));
        self.persist()?;

        Ok(operation_id)
    }

    /// Oldest eligible pending operation, respecting per-entity FIFO order.
    ///
    /// An operation is skipped while its entity is in `busy` (already has an
    /// in-flight operation), while its backoff window (`not_before`) has not
    /// passed, or while an earlier non-terminal operation on the same entity
    /// exists.
    pub fn peek_next(&self, now: Timestamp, busy: &HashSet<EntityKey>) -> Option<&Operation> {
        self.peek_filtered(now, busy, None)
    }

    /// Like [`Outbox::peek_next`], restricted to one entity type.
    pub fn peek_next_for(
        &self,
        entity_type: &str,
        now: Timestamp,
        busy: &HashSet<EntityKey>,
    ) -> Option<&Operation> {
        self.peek_filtered(now, busy, Some(entity_type))
    }

    fn peek_filtered(
        &self,
        now: Timestamp,
        busy: &HashSet<EntityKey>,
        entity_type: Option<&str>,
    ) -> Option<&Operation> {
        let mut blocked: HashSet<EntityKey> = HashSet::new();

        for op in &self.document.operations {
            if let Some(ty) = entity_type {
                if op.entity_type != ty {
                    continue;
                }
            }

            let key = (op.entity_type.clone(), op.entity_id.clone());
            if blocked.contains(&key) {
                continue;
            }

            match op.status {
                OperationStatus::Pending => {
                    let deferred = op.not_before.is_some_and(|t| t > now);
                    if !deferred && !busy.contains(&key) {
                        return Some(op);
                    }
                    // A held-back head still blocks its successors.
                    blocked.insert(key);
                }
                OperationStatus::InFlight => {
                    blocked.insert(key);
                }
                // Terminal operations do not block later ones.
                _ => {}
            }
        }

        None
    }

    /// Mark an operation as sent to the network.
    pub fn mark_in_flight(&mut self, operation_id: &str) -> Result<()> {
        self.op_mut(operation_id)?
            .transition(OperationStatus::InFlight)?;
        self.persist()
    }

    /// Transient failure: re-queue with an incremented attempt count and an
    /// earliest-retry time. The operation id (idempotency key) is unchanged.
    pub fn mark_retry(
        &mut self,
        operation_id: &str,
        error: &str,
        not_before: Option<Timestamp>,
    ) -> Result<()> {
        let op = self.op_mut(operation_id)?;
        op.transition(OperationStatus::Pending)?;
        op.attempts += 1;
        op.last_error = Some(error.to_string());
        op.not_before = not_before;
        self.persist()
    }

    /// Permanent failure: surfaced for manual retry or discard.
    pub fn mark_failed(&mut self, operation_id: &str, error: &str) -> Result<()> {
        let op = self.op_mut(operation_id)?;
        op.transition(OperationStatus::Failed)?;
        op.attempts += 1;
        op.last_error = Some(error.to_string());
        op.not_before = None;
        self.persist()
    }

    /// Stale-version conflict: held for explicit user resolution.
    pub fn mark_conflict(&mut self, operation_id: &str) -> Result<()> {
        self.op_mut(operation_id)?
            .transition(OperationStatus::Conflict)?;
        self.persist()
    }

    /// Successful replay: the operation leaves the log.
    pub fn mark_done(&mut self, operation_id: &str) -> Result<Operation> {
        let index = self.index_of(operation_id)?;
        self.document.operations[index].transition(OperationStatus::Done)?;
        let op = self.document.operations.remove(index);
        self.persist()?;
        Ok(op)
    }

    /// Manually re-arm a failed operation, keeping its idempotency key.
    pub fn retry(&mut self, operation_id: &str) -> Result<()> {
        let op = self.op_mut(operation_id)?;
        if op.status != OperationStatus::Failed {
            return Err(Error::NotRetryable(operation_id.to_string()));
        }
        op.transition(OperationStatus::Pending)?;
        op.attempts = 0;
        op.last_error = None;
        op.not_before = None;
        self.persist()
    }

    /// Drop a failed or conflicted operation; the derived snapshot reverts to
    /// confirmed state automatically. Returns the discarded operation so the
    /// caller can keep its payload for editing.
    pub fn discard(&mut self, operation_id: &str) -> Result<Operation> {
        let index = self.index_of(operation_id)?;
        let status = self.document.operations[index].status;
        if !matches!(status, OperationStatus::Failed | OperationStatus::Conflict) {
            return Err(Error::NotDiscardable(operation_id.to_string()));
        }
        let op = self.document.operations.remove(index);
        self.persist()?;
        Ok(op)
    }

    /// Every live operation, in enqueue order.
    pub fn list_pending(&self) -> Vec<&Operation> {
        self.document.operations.iter().collect()
    }

    /// Live operations targeting one entity, in enqueue order.
    pub fn pending_for(&self, entity_type: &str, entity_id: &str) -> Vec<&Operation> {
        self.document
            .operations
            .iter()
            .filter(|op| op.targets(entity_type, entity_id))
            .collect()
    }

    /// Look up a live operation by id.
    pub fn operation(&self, operation_id: &str) -> Option<&Operation> {
        self.document
            .operations
            .iter()
            .find(|op| op.operation_id == operation_id)
    }

    /// Live operation counts by status.
    pub fn status(&self) -> OutboxStatus {
        let mut counts = OutboxStatus::default();
        for op in &self.document.operations {
            match op.status {
                OperationStatus::Pending => counts.pending += 1,
                OperationStatus::InFlight => counts.in_flight += 1,
                OperationStatus::Failed => counts.failed += 1,
                OperationStatus::Conflict => counts.conflict += 1,
                OperationStatus::Done => {}
            }
        }
        counts
    }

    /// Optimistic snapshot of an entity: confirmed state plus the entity's
    /// live operations applied in order. `None` if the entity does not exist
    /// locally or a pending delete hides it.
    pub fn snapshot(&self, entity_type: &str, entity_id: &str) -> Option<EntitySnapshot> {
        let mut current = self.document.snapshot(entity_type, entity_id).cloned();

        for op in &self.document.operations {
            if !op.targets(entity_type, entity_id) {
                continue;
            }
            match op.kind {
                OperationKind::Create => {
                    current = Some(EntitySnapshot::local(
                        entity_type,
                        entity_id,
                        op.payload.clone(),
                        op.enqueued_at,
                    ));
                }
                OperationKind::Update => match current.as_mut() {
                    Some(snap) => {
                        snap.data = op.payload.clone();
                        snap.updated_at = op.enqueued_at;
                    }
                    // An update queued against state we no longer hold still
                    // has to be visible somewhere.
                    None => {
                        current = Some(EntitySnapshot::local(
                            entity_type,
                            entity_id,
                            op.payload.clone(),
                            op.enqueued_at,
                        ));
                    }
                },
                OperationKind::Delete => {
                    current = None;
                }
            }
        }

        current
    }

    /// Optimistic snapshots of every entity of a type, including local-only
    /// creates and excluding entities hidden by a pending delete.
    pub fn snapshots(&self, entity_type: &str) -> Vec<EntitySnapshot> {
        let mut ids: BTreeSet<EntityId> = self
            .document
            .snapshots
            .get(entity_type)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();

        for op in &self.document.operations {
            if op.entity_type == entity_type {
                ids.insert(op.entity_id.clone());
            }
        }

        ids.iter()
            .filter_map(|id| self.snapshot(entity_type, id))
            .collect()
    }

    /// Last server-confirmed snapshot, without pending operations applied.
    pub fn confirmed(&self, entity_type: &str, entity_id: &str) -> Option<&EntitySnapshot> {
        self.document.snapshot(entity_type, entity_id)
    }

    pub(crate) fn persist(&mut self) -> Result<()> {
        let value = self.document.to_value()?;
        self.backend.save(&value)
    }

    pub(crate) fn op_mut(&mut self, operation_id: &str) -> Result<&mut Operation> {
        self.document
            .operations
            .iter_mut()
            .find(|op| op.operation_id == operation_id)
            .ok_or_else(|| Error::UnknownOperation(operation_id.to_string()))
    }

    fn index_of(&self, operation_id: &str) -> Result<usize> {
        self.document
            .operations
            .iter()
            .position(|op| op.operation_id == operation_id)
            .ok_or_else(|| Error::UnknownOperation(operation_id.to_string()))
    }
}
