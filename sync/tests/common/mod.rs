//! Shared test support: a scripted in-memory backend implementing the sync
//! contract the way a real server would: idempotency-key replay map,
//! version preconditions, server-assigned ids for creates.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tether_sync::{
    ApiError, Operation, OperationKind, PushOutcome, RemoteApi, RemoteEntity, SyncConfig,
    SyncSession,
};

/// Transport behavior for the next deliveries, consumed in order; once the
/// script is empty every delivery succeeds.
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub enum Delivery {
    /// Deliver normally.
    Ok,
    /// Connection-level failure before reaching the server.
    Unreachable,
    /// The server performs the effect but the response never arrives.
    LoseResponse,
    /// The server rejects the payload as invalid.
    Reject,
    /// The request hangs until the client's attempt timeout fires.
    Stall,
}

#[derive(Default)]
struct SimState {
    entities: HashMap<(String, String), RemoteEntity>,
    /// Idempotency map: key -> recorded outcome, replayed on retransmission.
    seen: HashMap<String, PushOutcome>,
    /// Operation ids whose effect actually executed, in execution order.
    effects: Vec<String>,
    /// (entity_id, operation_id) in arrival order, for ordering assertions.
    arrivals: Vec<(String, String)>,
    script: VecDeque<Delivery>,
    next_server_id: u64,
}

/// In-memory stand-in for the backend.
#[derive(Default)]
pub struct SimApi {
    state: Mutex<SimState>,
}

#[allow(dead_code)]
impl SimApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed server-side entities.
    pub fn with_entities(entities: Vec<RemoteEntity>) -> Self {
        let api = Self::new();
        {
            let mut state = api.state.lock().unwrap();
            for entity in entities {
                state
                    .entities
                    .insert((entity.entity_type.clone(), entity.entity_id.clone()), entity);
            }
        }
        api
    }

    /// Queue transport behaviors for upcoming deliveries.
    pub fn script(&self, deliveries: &[Delivery]) {
        self.state.lock().unwrap().script.extend(deliveries.iter().copied());
    }

    /// How many times an operation's effect actually executed.
    pub fn effect_count(&self, operation_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .effects
            .iter()
            .filter(|id| id.as_str() == operation_id)
            .count()
    }

    /// Operation ids that reached the server for one entity, in order.
    pub fn arrivals_for(&self, entity_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .arrivals
            .iter()
            .filter(|(e, _)| e == entity_id)
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Current server-side entity.
    pub fn entity(&self, entity_type: &str, entity_id: &str) -> Option<RemoteEntity> {
        self.state
            .lock()
            .unwrap()
            .entities
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned()
    }

    /// Simulate another actor writing server-side.
    pub fn put_entity(&self, entity: RemoteEntity) {
        self.state
            .lock()
            .unwrap()
            .entities
            .insert((entity.entity_type.clone(), entity.entity_id.clone()), entity);
    }
}

fn execute(state: &mut SimState, op: &Operation) -> PushOutcome {
    state
        .arrivals
        .push((op.entity_id.clone(), op.operation_id.clone()));

    match op.kind {
        OperationKind::Create => {
            state.next_server_id += 1;
            let server_id = format!("srv-{}", state.next_server_id);
            state.effects.push(op.operation_id.clone());
            let entity = RemoteEntity {
                entity_type: op.entity_type.clone(),
                entity_id: server_id.clone(),
                version: 1,
                data: op.payload.clone(),
                deleted: false,
            };
            state
                .entities
                .insert((op.entity_type.clone(), server_id), entity.clone());
            PushOutcome::Applied(entity)
        }
        OperationKind::Update => {
            let key = (op.entity_type.clone(), op.entity_id.clone());
            match state.entities.get_mut(&key) {
                None => PushOutcome::Rejected("unknown entity".to_string()),
                Some(current) if current.deleted => PushOutcome::AlreadyDeleted,
                Some(current) => {
                    if op.base_version.is_some() && op.base_version != Some(current.version) {
                        PushOutcome::StaleVersion(current.clone())
                    } else {
                        current.version += 1;
                        current.data = op.payload.clone();
                        state.effects.push(op.operation_id.clone());
                        PushOutcome::Applied(current.clone())
                    }
                }
            }
        }
        OperationKind::Delete => {
            let key = (op.entity_type.clone(), op.entity_id.clone());
            match state.entities.get_mut(&key) {
                None => PushOutcome::AlreadyDeleted,
                Some(current) if current.deleted => PushOutcome::AlreadyDeleted,
                Some(current) => {
                    if op.base_version.is_some() && op.base_version != Some(current.version) {
                        PushOutcome::StaleVersion(current.clone())
                    } else {
                        current.deleted = true;
                        current.version += 1;
                        state.effects.push(op.operation_id.clone());
                        PushOutcome::Applied(current.clone())
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RemoteApi for SimApi {
    async fn push(&self, op: &Operation) -> Result<PushOutcome, ApiError> {
        let delivery = {
            let mut state = self.state.lock().unwrap();
            state.script.pop_front().unwrap_or(Delivery::Ok)
        };

        match delivery {
            Delivery::Unreachable => Err(ApiError::Transient("connection refused".to_string())),
            Delivery::Reject => Ok(PushOutcome::Rejected("invalid payload".to_string())),
            Delivery::Stall => {
                // Outlives any sane attempt timeout; the caller cancels us.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ApiError::Timeout)
            }
            Delivery::LoseResponse => {
                let mut state = self.state.lock().unwrap();
                if !state.seen.contains_key(&op.operation_id) {
                    let outcome = execute(&mut state, op);
                    state.seen.insert(op.operation_id.clone(), outcome);
                }
                Err(ApiError::Transient("response lost".to_string()))
            }
            Delivery::Ok => {
                let mut state = self.state.lock().unwrap();
                if let Some(previous) = state.seen.get(&op.operation_id) {
                    // Same idempotency key: replay the recorded result
                    // without re-executing the effect.
                    return Ok(previous.clone());
                }
                let outcome = execute(&mut state, op);
                state.seen.insert(op.operation_id.clone(), outcome.clone());
                Ok(outcome)
            }
        }
    }

    async fn fetch_all(&self, _tenant_id: &str) -> Result<Vec<RemoteEntity>, ApiError> {
        let state = self.state.lock().unwrap();
        Ok(state.entities.values().filter(|e| !e.deleted).cloned().collect())
    }
}

/// Config with short delays so tests run in milliseconds.
#[allow(dead_code)]
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        max_in_flight: 4,
        max_attempts: 5,
        base_backoff_ms: 5,
        max_backoff_ms: 40,
        request_timeout_ms: 200,
        poll_interval_ms: 20,
    }
}

/// Wait until the queue has no live operations left.
#[allow(dead_code)]
pub async fn wait_for_drain(session: &SyncSession) {
    for _ in 0..500 {
        if session.status().await.total() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue did not drain within timeout");
}

/// Wait until a predicate over the session status holds.
#[allow(dead_code)]
pub async fn wait_for_status(
    session: &SyncSession,
    predicate: impl Fn(tether_sync::OutboxStatus) -> bool,
) {
    for _ in 0..500 {
        if predicate(session.status().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("status condition not met within timeout");
}

/// Install a test logger once; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
