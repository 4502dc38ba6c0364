//! Persisted store document and the storage backend boundary.
//!
//! The engine owns the shape of persisted state; the host supplies a
//! [`StorageBackend`] that can load, save and clear one raw JSON document.
//! `schemaVersion` is read off the raw document before anything else is
//! decoded, so the migration runner can transform old shapes that no longer
//! deserialize.

use crate::{
    error::Result, EntityId, EntitySnapshot, EntityType, Error, Operation, SchemaVersion, TenantId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// JSON key of the schema version scalar in the raw document.
pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";

/// The full persisted state of one tenant's store.
///
/// Uses BTreeMap so serialization order is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDocument {
    /// Schema version of this document; checked before any other field.
    pub schema_version: SchemaVersion,
    /// Tenant the document belongs to; a store never serves another tenant.
    pub tenant_id: TenantId,
    /// Set after a cleared migration; the next fetch must be a full resync.
    pub resync_required: bool,
    /// The outbox log, in enqueue order.
    pub operations: Vec<Operation>,
    /// Confirmed snapshots by entity type, then entity id.
    pub snapshots: BTreeMap<EntityType, BTreeMap<EntityId, EntitySnapshot>>,
}

impl StoreDocument {
    /// Create an empty document for a tenant at the given schema version.
    pub fn new(schema_version: SchemaVersion, tenant_id: impl Into<TenantId>) -> Self {
        Self {
            schema_version,
            tenant_id: tenant_id.into(),
            resync_required: false,
            operations: Vec::new(),
            snapshots: BTreeMap::new(),
        }
    }

    /// Decode a raw persisted value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Corrupt(e.to_string()))
    }

    /// Encode to the raw persisted value.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::Corrupt(e.to_string()))
    }

    /// Get a confirmed snapshot.
    pub fn snapshot(&self, entity_type: &str, entity_id: &str) -> Option<&EntitySnapshot> {
        self.snapshots.get(entity_type)?.get(entity_id)
    }

    /// Insert or replace a confirmed snapshot.
    pub fn insert_snapshot(&mut self, snapshot: EntitySnapshot) {
        self.snapshots
            .entry(snapshot.entity_type.clone())
            .or_default()
            .insert(snapshot.entity_id.clone(), snapshot);
    }

    /// Remove a confirmed snapshot, returning it if present.
    pub fn remove_snapshot(&mut self, entity_type: &str, entity_id: &str) -> Option<EntitySnapshot> {
        let by_id = self.snapshots.get_mut(entity_type)?;
        let removed = by_id.remove(entity_id);
        if by_id.is_empty() {
            self.snapshots.remove(entity_type);
        }
        removed
    }

    /// Total confirmed snapshot count.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.values().map(|m| m.len()).sum()
    }
}

/// Boundary to durable storage for one tenant's document.
///
/// Implementations persist a single raw JSON value. `save` must be atomic
/// from the reader's point of view: a crash mid-save leaves either the old or
/// the new document, never a torn one.
pub trait StorageBackend: Send {
    /// Load the raw document, or `None` if the store is empty.
    fn load(&self) -> Result<Option<serde_json::Value>>;

    /// Durably persist the raw document.
    fn save(&mut self, document: &serde_json::Value) -> Result<()>;

    /// Wipe the store entirely.
    fn clear(&mut self) -> Result<()>;
}

/// In-memory backend.
///
/// Clones share the same underlying cell, which lets tests hand the "disk" to
/// a second outbox instance to simulate a process restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    cell: Arc<Mutex<Option<serde_json::Value>>>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend pre-seeded with a raw document.
    pub fn seeded(document: serde_json::Value) -> Self {
        Self {
            cell: Arc::new(Mutex::new(Some(document))),
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self) -> Result<Option<serde_json::Value>> {
        let cell = self
            .cell
            .lock()
            .map_err(|_| Error::Storage("memory backend poisoned".into()))?;
        Ok(cell.clone())
    }

    fn save(&mut self, document: &serde_json::Value) -> Result<()> {
        let mut cell = self
            .cell
            .lock()
            .map_err(|_| Error::Storage("memory backend poisoned".into()))?;
        *cell = Some(document.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        let mut cell = self
            .cell
            .lock()
            .map_err(|_| Error::Storage("memory backend poisoned".into()))?;
        *cell = None;
        Ok(())
    }
}
