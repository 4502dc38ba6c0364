//! # Tether Sync
//!
//! Embeds the [`tether_engine`] outbox in a client runtime: a tokio-based
//! background replayer, the network API contract (plus an HTTP binding), a
//! file-backed store, configuration, and change subscriptions.
//!
//! The entry point is [`SyncSession::open`]: it runs schema migrations before
//! anything else touches storage, performs a full resync when the store
//! demands one, and spawns the replayer. From there the host application only
//! enqueues intents and reads derived snapshots; delivery, retries, backoff,
//! idempotency and conflict parking are handled here.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_sync::{
//!     HttpApi, JsonFileBackend, OperationKind, SyncConfig, SyncSession,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), tether_sync::SyncError> {
//! let config = SyncConfig::from_env()?;
//! let api = Arc::new(HttpApi::new("https://api.example.test", config.request_timeout_ms)?);
//! let backend = Box::new(JsonFileBackend::for_tenant("/var/lib/app", "clinic-a"));
//!
//! let (session, outcome) = SyncSession::open(backend, api, "clinic-a", 1, &[], config).await?;
//! if outcome.resync_required() {
//!     // Show the one-time loading state; the resync already ran.
//! }
//!
//! session
//!     .enqueue("sales", "sale-local-1", OperationKind::Create, json!({"amount": 100}), None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
mod replayer;
pub mod session;
pub mod storage;

pub use api::{ApiError, PushOutcome, RemoteApi};
pub use clock::{wall_ms, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use error::{Result, SyncError};
pub use http::{HttpApi, BASE_VERSION_HEADER, IDEMPOTENCY_KEY_HEADER};
pub use session::{ChangeEvent, ChangeKind, SyncSession};
pub use storage::JsonFileBackend;

// The engine types a host application needs alongside the session.
pub use tether_engine::{
    ConflictChoice, EntitySnapshot, MigrationOutcome, MigrationStep, Operation, OperationKind,
    OperationStatus, OutboxStatus, RemoteEntity, Resolution,
};
