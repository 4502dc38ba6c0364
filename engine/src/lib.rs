//! # Tether Engine
//!
//! The offline mutation queue and replay core for Tether clients.
//!
//! This crate lets a client keep creating, editing and deleting entities
//! while disconnected, persists those intents durably, and exposes exactly
//! the state machine a replayer needs to deliver them to a backend exactly
//! once, in per-entity FIFO order, across restarts and schema upgrades.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of files, network, or runtime;
//!   storage and time come in through [`StorageBackend`] and [`Clock`]
//! - **Deterministic**: the same enqueues and responses always produce the
//!   same store state
//! - **Testable**: every status transition is an explicit, synchronous call;
//!   no timers are needed to exercise the retry machine
//! - **Non-destructive**: a conflicting local edit is parked, never silently
//!   overwritten
//!
//! ## Core Concepts
//!
//! ### Operations
//!
//! Changes are expressed as [`Operation`]s appended to the [`Outbox`], never
//! as direct writes. Each carries a client-minted id that doubles as the
//! idempotency key for every retransmission, the `base_version` precondition
//! it was computed against, and a status in
//! `pending | in_flight | failed | conflict | done`.
//!
//! ### Snapshots
//!
//! An [`EntitySnapshot`] is the last known state of an entity. The UI-visible
//! snapshot is always derived: last confirmed state plus the entity's live
//! operations applied in enqueue order, so optimistic reads are consistent by
//! construction.
//!
//! ### Reconciliation
//!
//! When a replay gets a definitive answer, the resolver applies the
//! authoritative entity ([`Outbox::reconcile_applied`]), treats a repeated
//! delete as success, or parks the operation as a [`Resolution::Conflicted`]
//! for explicit user action ([`ConflictChoice`]). There is no silent
//! last-writer-wins.
//!
//! ### Migrations
//!
//! [`MigrationRunner`] runs before anything else touches storage. It either
//! passes the store through, upgrades it step by step, or wipes it and flags
//! a full resync; a half-migrated store is unreachable.
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{ManualClock, MemoryBackend, OperationKind, Outbox};
//! use serde_json::json;
//!
//! let (mut outbox, _outcome) = Outbox::open(
//!     Box::new(MemoryBackend::new()),
//!     Box::new(ManualClock::new(1_706_745_600_000)),
//!     "clinic-a",
//!     1,
//!     &[],
//! )
//! .unwrap();
//!
//! // Queue a create while offline; it is durable before enqueue returns.
//! let op_id = outbox
//!     .enqueue("sales", "sale-local-1", OperationKind::Create, json!({"amount": 100}), None)
//!     .unwrap();
//!
//! // The optimistic snapshot is visible immediately.
//! let snap = outbox.snapshot("sales", "sale-local-1").unwrap();
//! assert!(snap.local_only);
//! assert_eq!(snap.data, json!({"amount": 100}));
//!
//! // The replayer will pick it up from here.
//! let next = outbox.peek_next(1_706_745_600_000, &Default::default()).unwrap();
//! assert_eq!(next.operation_id, op_id);
//! ```
//!
//! ## Persistence
//!
//! State is one versioned JSON document per tenant ([`StoreDocument`]):
//! the operation log, the confirmed snapshots and the `schemaVersion`
//! scalar, which is checked before any other field is decoded.

pub mod clock;
pub mod error;
pub mod migrate;
pub mod operation;
pub mod outbox;
pub mod reconcile;
pub mod snapshot;
pub mod storage;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock};
pub use error::Error;
pub use migrate::{MigrationOutcome, MigrationRunner, MigrationState, MigrationStep, StepFn};
pub use operation::{Operation, OperationKind, OperationStatus};
pub use outbox::{EntityKey, Outbox, OutboxStatus};
pub use reconcile::{ConflictChoice, Resolution};
pub use snapshot::{EntitySnapshot, RemoteEntity};
pub use storage::{MemoryBackend, StorageBackend, StoreDocument, SCHEMA_VERSION_KEY};

/// Type aliases for clarity
pub type EntityId = String;
pub type EntityType = String;
pub type OperationId = String;
pub type TenantId = String;
pub type Version = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
