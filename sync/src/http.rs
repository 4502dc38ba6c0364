//! HTTP binding of the backend sync contract.
//!
//! Maps the wire protocol onto [`PushOutcome`]/[`ApiError`]: 2xx carries the
//! authoritative entity, 409/412 carry the current server state for a stale
//! precondition, other 4xx are non-retryable rejections, and 5xx plus every
//! transport failure is transient.

use crate::api::{ApiError, PushOutcome, RemoteApi};
use crate::error::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_engine::{Operation, OperationKind, RemoteEntity, Version};

/// Header carrying the operation id; the server deduplicates on it.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Header carrying the optimistic-concurrency precondition.
pub const BASE_VERSION_HEADER: &str = "if-match-version";

/// Request body for a pushed operation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest<'a> {
    operation_id: &'a str,
    entity_type: &'a str,
    entity_id: &'a str,
    kind: OperationKind,
    payload: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_version: Option<Version>,
}

impl<'a> PushRequest<'a> {
    fn from_operation(op: &'a Operation) -> Self {
        Self {
            operation_id: &op.operation_id,
            entity_type: &op.entity_type,
            entity_id: &op.entity_id,
            kind: op.kind,
            payload: &op.payload,
            base_version: op.base_version,
        }
    }
}

/// Response body for a successful push.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushResponse {
    #[serde(default)]
    already_deleted: bool,
    entity: Option<RemoteEntity>,
}

/// Response body for full resync.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchAllResponse {
    entities: Vec<RemoteEntity>,
}

/// [`RemoteApi`] over HTTP with reqwest.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    /// Create a client for the given backend base URL.
    pub fn new(base_url: impl Into<String>, request_timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn push(&self, operation: &Operation) -> std::result::Result<PushOutcome, ApiError> {
        let url = format!("{}/sync/push", self.base_url);

        let mut request = self
            .client
            .post(&url)
            .header(IDEMPOTENCY_KEY_HEADER, &operation.operation_id)
            .json(&PushRequest::from_operation(operation));
        if let Some(version) = operation.base_version {
            request = request.header(BASE_VERSION_HEADER, version.to_string());
        }

        let response = request.send().await.map_err(to_api_error)?;
        let status = response.status();

        if status.is_success() {
            let body: PushResponse = response
                .json()
                .await
                .map_err(|e| ApiError::Transient(format!("unreadable push response: {e}")))?;
            return match (body.already_deleted, body.entity) {
                (true, _) => Ok(PushOutcome::AlreadyDeleted),
                (false, Some(entity)) => Ok(PushOutcome::Applied(entity)),
                (false, None) => Err(ApiError::Transient(
                    "push response carried no entity".to_string(),
                )),
            };
        }

        if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
            let current: RemoteEntity = response
                .json()
                .await
                .map_err(|e| ApiError::Transient(format!("unreadable conflict body: {e}")))?;
            return Ok(PushOutcome::StaleVersion(current));
        }

        if status.is_client_error() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| status.to_string());
            return Ok(PushOutcome::Rejected(message));
        }

        Err(ApiError::Transient(format!("server error: {status}")))
    }

    async fn fetch_all(&self, tenant_id: &str) -> std::result::Result<Vec<RemoteEntity>, ApiError> {
        let url = format!("{}/sync/entities", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("tenant", tenant_id)])
            .send()
            .await
            .map_err(to_api_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Transient(format!("fetch failed: {status}")));
        }

        let body: FetchAllResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Transient(format!("unreadable fetch response: {e}")))?;
        Ok(body.entities)
    }
}

fn to_api_error(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Transient(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_request_shape() {
        let op = Operation::new(
            "op-1",
            "sales",
            "sale-1",
            OperationKind::Update,
            json!({"amount": 150}),
            Some(3),
            1000,
        );

        let body = serde_json::to_value(PushRequest::from_operation(&op)).unwrap();
        assert_eq!(body["operationId"], "op-1");
        assert_eq!(body["kind"], "update");
        assert_eq!(body["baseVersion"], 3);
        assert_eq!(body["payload"]["amount"], 150);
    }

    #[test]
    fn push_response_parses_entity_and_tombstone() {
        let body: PushResponse = serde_json::from_str(
            r#"{"entity":{"entityType":"sales","entityId":"sale-42","version":1,"data":{"amount":100}}}"#,
        )
        .unwrap();
        assert!(!body.already_deleted);
        assert_eq!(body.entity.unwrap().entity_id, "sale-42");

        let body: PushResponse = serde_json::from_str(r#"{"alreadyDeleted":true}"#).unwrap();
        assert!(body.already_deleted);
        assert!(body.entity.is_none());
    }

    #[test]
    fn base_url_is_normalized() {
        let api = HttpApi::new("https://api.example.test/", 1000).unwrap();
        assert_eq!(api.base_url, "https://api.example.test");
    }
}
