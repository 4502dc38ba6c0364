//! The background replay loop.
//!
//! Drains the outbox in rounds: each round claims up to `max_in_flight`
//! eligible operations (never two for the same entity), sends them
//! concurrently, and reconciles every definitive answer before the next round
//! starts. Transient failures re-queue with exponential backoff and jitter;
//! the operation id is reused verbatim on every retransmission.

use crate::api::{ApiError, PushOutcome};
use crate::clock::wall_ms;
use crate::session::{ChangeKind, Shared};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tether_engine::{EntityKey, Operation, Resolution};

pub(crate) struct Replayer {
    shared: Arc<Shared>,
}

impl Replayer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) async fn run(self) {
        tracing::debug!("replayer started");

        loop {
            if self.shared.is_stopped() {
                break;
            }

            let round = self.claim_round().await;
            if round.is_empty() {
                self.idle().await;
                continue;
            }

            futures::future::join_all(round.into_iter().map(|op| self.attempt(op))).await;
        }

        tracing::debug!("replayer stopped");
    }

    // Sleep until something is enqueued or the poll interval elapses; the
    // poll fallback picks up operations whose backoff window opened.
    async fn idle(&self) {
        let poll = Duration::from_millis(self.shared.config.poll_interval_ms);
        tokio::select! {
            _ = self.shared.notify.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }

    // Claim up to `max_in_flight` operations on distinct entities and mark
    // them in flight, all under the store lock.
    async fn claim_round(&self) -> Vec<Operation> {
        let now = wall_ms();
        let mut outbox = self.shared.outbox.lock().await;
        let mut claimed = Vec::new();

        let budget = self
            .shared
            .config
            .max_in_flight
            .saturating_sub(self.shared.in_flight.len());

        for _ in 0..budget {
            let busy: HashSet<EntityKey> = self
                .shared
                .in_flight
                .iter()
                .map(|key| key.clone())
                .collect();

            let Some(op) = outbox.peek_next(now, &busy) else {
                break;
            };
            let op = op.clone();

            if let Err(e) = outbox.mark_in_flight(&op.operation_id) {
                tracing::error!(operation = %op.operation_id, error = %e, "failed to claim operation");
                break;
            }
            self.shared
                .in_flight
                .insert((op.entity_type.clone(), op.entity_id.clone()));
            claimed.push(op);
        }

        claimed
    }

    // One network attempt plus reconciliation of its answer.
    async fn attempt(&self, op: Operation) {
        let timeout = Duration::from_millis(self.shared.config.request_timeout_ms);
        let result = match tokio::time::timeout(timeout, self.shared.api.push(&op)).await {
            Ok(result) => result,
            // A timed-out request may or may not have landed server-side;
            // only the idempotency key makes the retry safe.
            Err(_elapsed) => Err(ApiError::Timeout),
        };

        let mut outbox = self.shared.outbox.lock().await;

        match result {
            Ok(PushOutcome::Applied(entity)) => {
                match outbox.reconcile_applied(&op.operation_id, entity) {
                    Ok(Resolution::Applied {
                        entity_type,
                        entity_id,
                    }) => {
                        tracing::debug!(operation = %op.operation_id, entity = %entity_id, "replay applied");
                        if entity_id != op.entity_id {
                            // Create rebound to a server id: notify watchers
                            // of the temporary id as well.
                            self.shared.emit(&op.entity_type, &op.entity_id, ChangeKind::Applied);
                        }
                        self.shared.emit(&entity_type, &entity_id, ChangeKind::Applied);
                    }
                    Ok(Resolution::AlreadyDeleted) => {
                        self.shared.emit(&op.entity_type, &op.entity_id, ChangeKind::Applied);
                    }
                    Ok(Resolution::Conflicted) => {
                        tracing::warn!(operation = %op.operation_id, "replay answer could not be applied; parked as conflict");
                        self.shared.emit(&op.entity_type, &op.entity_id, ChangeKind::Conflict);
                    }
                    Err(e) => {
                        tracing::error!(operation = %op.operation_id, error = %e, "reconciliation failed");
                    }
                }
            }
            Ok(PushOutcome::AlreadyDeleted) => {
                match outbox.reconcile_already_deleted(&op.operation_id) {
                    Ok(Resolution::AlreadyDeleted) => {
                        self.shared.emit(&op.entity_type, &op.entity_id, ChangeKind::Applied);
                    }
                    Ok(_) => {
                        self.shared.emit(&op.entity_type, &op.entity_id, ChangeKind::Conflict);
                    }
                    Err(e) => {
                        tracing::error!(operation = %op.operation_id, error = %e, "reconciliation failed");
                    }
                }
            }
            Ok(PushOutcome::StaleVersion(current)) => {
                tracing::info!(operation = %op.operation_id, "stale version; holding for user resolution");
                match outbox.reconcile_stale(&op.operation_id, current) {
                    Ok(Resolution::AlreadyDeleted) => {
                        self.shared.emit(&op.entity_type, &op.entity_id, ChangeKind::Applied);
                    }
                    Ok(_) => {
                        self.shared.emit(&op.entity_type, &op.entity_id, ChangeKind::Conflict);
                    }
                    Err(e) => {
                        tracing::error!(operation = %op.operation_id, error = %e, "reconciliation failed");
                    }
                }
            }
            Ok(PushOutcome::Rejected(message)) => {
                // Repeating a rejected payload cannot change the answer.
                tracing::warn!(operation = %op.operation_id, %message, "operation rejected");
                if let Err(e) = outbox.mark_failed(&op.operation_id, &message) {
                    tracing::error!(operation = %op.operation_id, error = %e, "failed to record rejection");
                }
                self.shared.emit(&op.entity_type, &op.entity_id, ChangeKind::Failed);
            }
            Err(api_error) => {
                self.handle_transient(&mut outbox, &op, api_error);
            }
        }

        drop(outbox);
        self.shared
            .in_flight
            .remove(&(op.entity_type.clone(), op.entity_id.clone()));
        self.shared.notify.notify_one();
    }

    fn handle_transient(
        &self,
        outbox: &mut tether_engine::Outbox,
        op: &Operation,
        error: ApiError,
    ) {
        let message = error.to_string();

        if op.attempts + 1 >= self.shared.config.max_attempts {
            tracing::warn!(
                operation = %op.operation_id,
                attempts = op.attempts + 1,
                error = %message,
                "retry budget exhausted"
            );
            if let Err(e) = outbox.mark_failed(&op.operation_id, &message) {
                tracing::error!(operation = %op.operation_id, error = %e, "failed to record failure");
            }
            self.shared.emit(&op.entity_type, &op.entity_id, ChangeKind::Failed);
            return;
        }

        let delay = self.backoff_with_jitter(op.attempts);
        tracing::debug!(
            operation = %op.operation_id,
            attempts = op.attempts + 1,
            delay_ms = delay,
            error = %message,
            "transient failure; backing off"
        );
        if let Err(e) = outbox.mark_retry(&op.operation_id, &message, Some(wall_ms() + delay)) {
            tracing::error!(operation = %op.operation_id, error = %e, "failed to re-queue operation");
        }
    }

    fn backoff_with_jitter(&self, attempts: u32) -> u64 {
        let base = self.shared.config.backoff_delay_ms(attempts);
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        base + jitter
    }
}
