//! Materialized entity state.
//!
//! An [`EntitySnapshot`] is the last known state of a domain entity as shown
//! to the UI. Confirmed snapshots carry a server-assigned version; entities
//! that only exist from an unconfirmed create are flagged `local_only`.

use crate::{EntityId, EntityType, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// The last known materialized state of a domain entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id; a temporary client id while `local_only` is set.
    pub entity_id: EntityId,
    /// Server-assigned version; 0 while the entity is local-only.
    pub version: Version,
    /// Opaque domain data.
    pub data: serde_json::Value,
    /// True if the entity only exists from an unconfirmed create.
    pub local_only: bool,
    /// Local time of the last write to this snapshot.
    pub updated_at: Timestamp,
}

impl EntitySnapshot {
    /// Snapshot of a server-confirmed entity.
    pub fn confirmed(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        version: Version,
        data: serde_json::Value,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            version,
            data,
            local_only: false,
            updated_at,
        }
    }

    /// Snapshot of an entity that exists only from an unconfirmed create.
    pub fn local(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        data: serde_json::Value,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            version: 0,
            data,
            local_only: true,
            updated_at,
        }
    }
}

/// Authoritative entity state as returned by the backend.
///
/// This is the payload of a successful replay response and of the structured
/// stale-version conflict response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    /// Entity type.
    pub entity_type: EntityType,
    /// Server-side entity id (may differ from a temporary client id).
    pub entity_id: EntityId,
    /// Server-assigned version.
    pub version: Version,
    /// Authoritative domain data.
    pub data: serde_json::Value,
    /// True if the entity is deleted server-side.
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteEntity {
    /// Convert into a confirmed snapshot stamped at the given local time.
    pub fn into_snapshot(self, updated_at: Timestamp) -> EntitySnapshot {
        EntitySnapshot::confirmed(
            self.entity_type,
            self.entity_id,
            self.version,
            self.data,
            updated_at,
        )
    }
}
