//! Reconciliation of authoritative server responses into local state.
//!
//! Invoked by the replayer after every network attempt that produced a
//! definitive answer. The policy is deliberately conservative: a concurrent
//! server-side change never overwrites a local edit silently. The server
//! state becomes the new confirmed snapshot, the operation is parked in
//! `conflict`, and the pending payload stays readable until the user decides.

use crate::{
    error::Result,
    operation::{OperationKind, OperationStatus},
    outbox::Outbox,
    snapshot::RemoteEntity,
    EntityId, EntityType, Error, Version,
};
use serde::{Deserialize, Serialize};

/// What reconciliation did with a replay response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// The authoritative entity was applied and the operation completed.
    /// `entity_id` is the final id, which differs from the operation's target
    /// when the server assigned an id to a create.
    Applied {
        entity_type: EntityType,
        entity_id: EntityId,
    },
    /// A delete found the entity already gone; treated as success.
    AlreadyDeleted,
    /// The operation was parked as a conflict for explicit resolution.
    Conflicted,
}

/// Explicit user decision on a conflicted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictChoice {
    /// Re-send the local payload, rebased onto the current server version.
    KeepMine,
    /// Drop the local operation; the server state stands.
    TakeTheirs,
}

impl Outbox {
    /// Reconcile a successful replay response.
    ///
    /// Applies the authoritative entity to the confirmed snapshot, re-keys a
    /// create from its temporary client id to the server-assigned id (and
    /// re-points queued successors at it), and completes the operation.
    pub fn reconcile_applied(
        &mut self,
        operation_id: &str,
        remote: RemoteEntity,
    ) -> Result<Resolution> {
        let op = self
            .operation(operation_id)
            .ok_or_else(|| Error::UnknownOperation(operation_id.to_string()))?
            .clone();
        let now = self.clock.now_ms();

        match op.kind {
            OperationKind::Delete => {
                self.document.remove_snapshot(&op.entity_type, &op.entity_id);
                self.mark_done(operation_id)?;
                Ok(Resolution::Applied {
                    entity_type: op.entity_type,
                    entity_id: op.entity_id,
                })
            }
            OperationKind::Create | OperationKind::Update => {
                if remote.entity_id != op.entity_id {
                    let local_only = self
                        .confirmed(&op.entity_type, &op.entity_id)
                        .map_or(true, |s| s.local_only);
                    if op.kind == OperationKind::Create && local_only {
                        return self.rebind_create(&op, remote, now);
                    }
                    // An update answered with a different identity is not
                    // something the engine can interpret; park it.
                    self.document.insert_snapshot(remote.into_snapshot(now));
                    self.mark_conflict(operation_id)?;
                    return Ok(Resolution::Conflicted);
                }

                let version = remote.version;
                if remote.deleted {
                    self.document.remove_snapshot(&op.entity_type, &op.entity_id);
                } else {
                    self.document.insert_snapshot(remote.into_snapshot(now));
                }
                self.chain_base_version(&op.entity_type, &op.entity_id, version, operation_id);
                self.mark_done(operation_id)?;
                Ok(Resolution::Applied {
                    entity_type: op.entity_type,
                    entity_id: op.entity_id,
                })
            }
        }
    }

    /// Reconcile a server report that the target entity is already deleted.
    ///
    /// For a delete this is success (idempotent delete). For anything else it
    /// means another actor removed the entity underneath the local edit, which
    /// is a conflict.
    pub fn reconcile_already_deleted(&mut self, operation_id: &str) -> Result<Resolution> {
        let op = self
            .operation(operation_id)
            .ok_or_else(|| Error::UnknownOperation(operation_id.to_string()))?
            .clone();

        self.document.remove_snapshot(&op.entity_type, &op.entity_id);

        if op.kind == OperationKind::Delete {
            self.mark_done(operation_id)?;
            Ok(Resolution::AlreadyDeleted)
        } else {
            self.mark_conflict(operation_id)?;
            Ok(Resolution::Conflicted)
        }
    }

    /// Reconcile a stale-version rejection carrying the current server state.
    ///
    /// The server state becomes the confirmed snapshot; the operation is
    /// parked in `conflict` with its payload intact, so the optimistic
    /// snapshot keeps showing the local edit until the user resolves it.
    pub fn reconcile_stale(
        &mut self,
        operation_id: &str,
        server_state: RemoteEntity,
    ) -> Result<Resolution> {
        let op = self
            .operation(operation_id)
            .ok_or_else(|| Error::UnknownOperation(operation_id.to_string()))?
            .clone();
        let now = self.clock.now_ms();

        if op.kind == OperationKind::Delete && server_state.deleted {
            return self.reconcile_already_deleted(operation_id);
        }

        if server_state.deleted {
            self.document.remove_snapshot(&server_state.entity_type, &server_state.entity_id);
        } else {
            self.document.insert_snapshot(server_state.into_snapshot(now));
        }

        self.mark_conflict(operation_id)?;
        Ok(Resolution::Conflicted)
    }

    /// Apply the user's decision to a conflicted operation.
    pub fn resolve_conflict(&mut self, operation_id: &str, choice: ConflictChoice) -> Result<()> {
        let op = self
            .operation(operation_id)
            .ok_or_else(|| Error::UnknownOperation(operation_id.to_string()))?;
        if op.status != OperationStatus::Conflict {
            return Err(Error::NotInConflict(operation_id.to_string()));
        }

        match choice {
            ConflictChoice::TakeTheirs => {
                self.discard(operation_id)?;
                Ok(())
            }
            ConflictChoice::KeepMine => {
                let (entity_type, entity_id, kind) =
                    (op.entity_type.clone(), op.entity_id.clone(), op.kind);
                let confirmed_version = self
                    .confirmed(&entity_type, &entity_id)
                    .filter(|s| !s.local_only)
                    .map(|s| s.version);

                let op = self.op_mut(operation_id)?;
                op.transition(OperationStatus::Pending)?;
                op.attempts = 0;
                op.last_error = None;
                op.not_before = None;
                op.base_version = confirmed_version;
                // A create whose id is already taken server-side re-sends as
                // an update of that entity.
                if kind == OperationKind::Create && confirmed_version.is_some() {
                    op.kind = OperationKind::Update;
                }
                self.persist()
            }
        }
    }

    /// Replace all confirmed snapshots with a full server fetch and clear the
    /// resync flag. Returns the number of entities loaded.
    pub fn complete_resync(&mut self, entities: Vec<RemoteEntity>) -> Result<usize> {
        let now = self.clock.now_ms();

        self.document.snapshots.clear();
        let mut loaded = 0;
        for entity in entities {
            if entity.deleted {
                continue;
            }
            self.document.insert_snapshot(entity.into_snapshot(now));
            loaded += 1;
        }
        self.document.resync_required = false;
        self.persist()?;
        Ok(loaded)
    }

    // Re-key a confirmed create to its server-assigned id and re-point queued
    // successors (their idempotency keys never change).
    fn rebind_create(
        &mut self,
        op: &crate::Operation,
        remote: RemoteEntity,
        now: crate::Timestamp,
    ) -> Result<Resolution> {
        let temp_id = op.entity_id.clone();
        let entity_type = op.entity_type.clone();
        let server_id = remote.entity_id.clone();
        let version = remote.version;

        self.document.remove_snapshot(&entity_type, &temp_id);
        self.document.insert_snapshot(remote.into_snapshot(now));

        for queued in &mut self.document.operations {
            if queued.operation_id != op.operation_id && queued.targets(&entity_type, &temp_id) {
                queued.entity_id = server_id.clone();
            }
        }
        self.chain_base_version(&entity_type, &server_id, version, &op.operation_id);

        self.mark_done(&op.operation_id)?;
        Ok(Resolution::Applied {
            entity_type,
            entity_id: server_id,
        })
    }

    // Give the next queued operation on this entity a concrete precondition
    // if it was computed against a not-yet-confirmed state.
    fn chain_base_version(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        version: Version,
        exclude: &str,
    ) {
        if let Some(next) = self.document.operations.iter_mut().find(|o| {
            o.operation_id != exclude
                && o.targets(entity_type, entity_id)
                && o.kind != OperationKind::Create
                && o.base_version.is_none()
        }) {
            next.base_version = Some(version);
        }
    }
}
