//! Pending write intents and their status machine.
//!
//! Every local mutation is expressed as an [`Operation`] appended to the
//! outbox, never as a direct write to confirmed state. The operation id is the
//! idempotency key sent to the backend and is stable across retries.

use crate::{EntityId, EntityType, OperationId, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// What an operation does to its target entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Replay status of an operation.
///
/// `failed`, `conflict` and `done` are terminal: a later operation on the same
/// entity may be sent once the earlier one reaches any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Failed,
    Conflict,
    Done,
}

impl OperationStatus {
    /// Whether this status unblocks later operations on the same entity.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Failed | OperationStatus::Conflict | OperationStatus::Done
        )
    }

    fn allows(self, to: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, to),
            (Pending, InFlight)
                | (InFlight, Pending)   // transient failure, re-queued
                | (InFlight, Done)
                | (InFlight, Failed)
                | (InFlight, Conflict)
                | (Failed, Pending)     // manual retry
                | (Conflict, Pending)   // keep-mine rebase
        )
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::InFlight => write!(f, "in_flight"),
            OperationStatus::Failed => write!(f, "failed"),
            OperationStatus::Conflict => write!(f, "conflict"),
            OperationStatus::Done => write!(f, "done"),
        }
    }
}

/// A single pending write intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Client-minted unique id; sent verbatim as the idempotency key.
    pub operation_id: OperationId,
    /// Entity type being mutated.
    pub entity_type: EntityType,
    /// Entity id; a temporary client id for unconfirmed creates.
    pub entity_id: EntityId,
    /// Create, update or delete.
    pub kind: OperationKind,
    /// Opaque domain payload; the engine never inspects it.
    pub payload: serde_json::Value,
    /// Version the mutation was computed against; `None` for creates and for
    /// edits of a not-yet-confirmed entity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Version>,
    /// Local enqueue time; orders the per-entity replay chain.
    pub enqueued_at: Timestamp,
    /// Current replay status.
    pub status: OperationStatus,
    /// Completed-and-failed attempt count.
    pub attempts: u32,
    /// Message from the most recent failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time a retry may be attempted; backoff scheduling state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<Timestamp>,
}

impl Operation {
    /// Create a fresh pending operation.
    pub fn new(
        operation_id: impl Into<OperationId>,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        kind: OperationKind,
        payload: serde_json::Value,
        base_version: Option<Version>,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            kind,
            payload,
            base_version,
            enqueued_at,
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
            not_before: None,
        }
    }

    /// Whether this operation targets the given entity.
    pub fn targets(&self, entity_type: &str, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }

    /// Move to a new status, rejecting transitions outside the state machine.
    pub(crate) fn transition(&mut self, to: OperationStatus) -> crate::error::Result<()> {
        if !self.status.allows(to) {
            return Err(crate::Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Operations are ordered by enqueue time, ties broken by id.
impl Ord for Operation {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.enqueued_at.cmp(&other.enqueued_at) {
            std::cmp::Ordering::Equal => self.operation_id.cmp(&other.operation_id),
            other => other,
        }
    }
}

impl PartialOrd for Operation {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Operation {}
