//! The network API contract consumed by the replayer.
//!
//! The backend must accept the operation id as an idempotency key and replay
//! the recorded result for any retransmission of it; that makes resending
//! after an ambiguous failure (request sent, response lost) safe. Definitive
//! answers are [`PushOutcome`] variants; only transport-level trouble is an
//! [`ApiError`], and every `ApiError` is retryable.

use async_trait::async_trait;
use tether_engine::{Operation, RemoteEntity};

/// Definitive backend answer to one replayed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The effect was performed (or had already been performed under this
    /// idempotency key); here is the authoritative entity.
    Applied(RemoteEntity),
    /// The target entity is already deleted server-side.
    AlreadyDeleted,
    /// The `base_version` precondition failed; carries the current server
    /// state so the client can reconcile without another round-trip.
    StaleVersion(RemoteEntity),
    /// The payload was rejected as invalid; retrying cannot change this.
    Rejected(String),
}

/// Transport-level failure. Always retryable with the same idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("transient network failure: {0}")]
    Transient(String),

    #[error("request timed out")]
    Timeout,
}

/// Client-side view of the backend sync contract.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Deliver one mutating operation, idempotency key attached.
    async fn push(&self, operation: &Operation) -> Result<PushOutcome, ApiError>;

    /// Fetch every entity for a tenant; used for full resync only.
    async fn fetch_all(&self, tenant_id: &str) -> Result<Vec<RemoteEntity>, ApiError>;
}
