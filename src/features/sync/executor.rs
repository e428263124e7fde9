//! Executors that replay queued operations against the remote API.
//!
//! An executor attempts one operation and reports the outcome. Retry and
//! backoff decisions belong to the engine; executors only classify their
//! failures.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::operation::{Operation, QueueItem};
use crate::config::ServerConfig;
use crate::error::FieldsyncError;
use crate::features::cache::FieldCache;
use crate::storage::Collection;

type ExecResult = Result<Value, ExecutionError>;

/// Whether a failed attempt is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Network or server trouble; a later attempt may succeed
    Transient,
    /// The server rejected the request; retrying will not help
    Permanent,
}

/// Failure of a single executor attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionError {
    /// A retryable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    /// A failure retrying cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Whether this failure is permanent.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self.kind, FailureKind::Permanent)
    }

    /// Classify a non-success HTTP answer.
    ///
    /// Client errors are permanent, except timeouts (408) and rate limiting
    /// (429).
    #[must_use]
    pub fn from_status(status: u16, body: &Value) -> Self {
        let body = match body {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let message = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        };

        match status {
            408 | 429 => Self::transient(message),
            400..=499 => Self::permanent(message),
            _ => Self::transient(message),
        }
    }
}

/// Attempts one queued operation.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Replay the item's operation and return the server result.
    async fn execute(&self, item: &QueueItem) -> Result<Value, ExecutionError>;
}

/// HTTP method of a remote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        })
    }
}

/// One request to the remote API.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    /// Path below the base URL, starting with `/`
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Sent as `Idempotency-Key`
    pub idempotency_key: String,
}

/// The remote API's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    /// JSON body; non-JSON bodies are carried as a string
    pub body: Value,
}

impl RemoteResponse {
    /// Whether the status is 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Transport to the remote API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Perform one request/response exchange.
    ///
    /// Only transport failures are errors; any HTTP answer is a response.
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse, ExecutionError>;
}

/// `reqwest` transport.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    /// Create a transport for the configured server.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(server: &ServerConfig) -> Result<Self, FieldsyncError> {
        let client = reqwest::Client::builder()
            .timeout(server.timeout())
            .build()
            .map_err(|e| FieldsyncError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: server.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse, ExecutionError> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}{}", self.base_url, request.path),
            &request.query,
        )
        .map_err(|e| ExecutionError::permanent(format!("Invalid request URL: {e}")))?;

        let builder = match request.method {
            Method::Get => self.client.get(url.clone()),
            Method::Post => self.client.post(url.clone()),
            Method::Put => self.client.put(url.clone()),
        };

        let mut builder = builder
            .header("X-Offline-Sync", "true")
            .header("Idempotency-Key", &request.idempotency_key);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(method = %request.method, %url, "Sending request");
        let response = builder
            .send()
            .await
            .map_err(|e| ExecutionError::transient(format!("Request to {url} failed: {e}")))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ExecutionError::transient(format!("Failed to read response: {e}")))?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(RemoteResponse { status, body })
    }
}

/// Executor for the full operation set, reconciling the offline cache after
/// each successful exchange.
pub struct RemoteExecutor<R> {
    remote: R,
    cache: FieldCache,
}

impl<R: RemoteApi> RemoteExecutor<R> {
    /// Create an executor over a transport and the offline cache.
    #[must_use]
    pub const fn new(remote: R, cache: FieldCache) -> Self {
        Self { remote, cache }
    }

    async fn exchange(
        &self,
        item: &QueueItem,
        method: Method,
        path: String,
        query: Vec<(String, String)>,
        body: Option<Value>,
    ) -> Result<Value, ExecutionError> {
        let response = self
            .remote
            .send(RemoteRequest {
                method,
                path,
                query,
                body,
                idempotency_key: item.idempotency_key.clone(),
            })
            .await?;

        if response.is_success() {
            Ok(response.body)
        } else {
            Err(ExecutionError::from_status(response.status, &response.body))
        }
    }

    async fn post(&self, item: &QueueItem, path: &str, body: Value) -> ExecResult {
        self.exchange(item, Method::Post, path.to_string(), Vec::new(), Some(body))
            .await
    }

    async fn put(&self, item: &QueueItem, path: String, body: Value) -> ExecResult {
        self.exchange(item, Method::Put, path, Vec::new(), Some(body))
            .await
    }
}

#[async_trait]
impl<R: RemoteApi> Executor for RemoteExecutor<R> {
    async fn execute(&self, item: &QueueItem) -> Result<Value, ExecutionError> {
        match &item.operation {
            Operation::Inspection(p) => {
                let result = self.post(item, "/api/inspections", to_body(p)?).await?;
                self.cache
                    .mark_synced(Collection::Inspections, &p.local_id, &result)
                    .map_err(reconcile_error)?;
                Ok(result)
            }
            Operation::FieldOperation(p) => {
                let result = self.post(item, "/api/operations", to_body(p)?).await?;
                self.cache
                    .mark_synced(Collection::FieldOperations, &p.local_id, &result)
                    .map_err(reconcile_error)?;
                Ok(result)
            }
            Operation::PlotUpdate(p) => {
                let body = Value::Object(p.changes.clone());
                let result = self.put(item, format!("/api/plots/{}", p.id), body).await?;
                if result.is_object() {
                    self.cache.save_plot(&p.id, result.clone())
                } else {
                    self.cache.merge_plot(&p.id, &p.changes)
                }
                .map_err(reconcile_error)?;
                Ok(result)
            }
            Operation::FarmUpdate(p) => {
                let body = Value::Object(p.changes.clone());
                self.put(item, format!("/api/farms/{}", p.id), body).await
            }
            Operation::ImageUpload(p) => self.post(item, "/api/images", to_body(p)?).await,
            Operation::VegetationIndexRequest(p) => {
                let query = vec![
                    ("plot_id".to_string(), p.plot_id.clone()),
                    ("date".to_string(), p.date.clone()),
                    ("index_type".to_string(), p.index_type.clone()),
                ];
                let result = self
                    .exchange(item, Method::Get, "/api/ndvi".into(), query, None)
                    .await?;
                self.cache
                    .save_vegetation_index(&p.plot_id, &p.index_type, &p.date, result.clone())
                    .map_err(reconcile_error)?;
                Ok(result)
            }
        }
    }
}

fn to_body<T: Serialize>(payload: &T) -> Result<Value, ExecutionError> {
    serde_json::to_value(payload)
        .map_err(|e| ExecutionError::permanent(format!("Invalid payload: {e}")))
}

fn reconcile_error(e: FieldsyncError) -> ExecutionError {
    ExecutionError::transient(format!("Delivered, but failed to update the offline cache: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::sync::operation::{
        EntityUpdatePayload, InspectionPayload, QueueStatus, VegetationIndexPayload,
    };
    use crate::storage::{Database, LocalStore};
    use chrono::Utc;
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn create_test_cache() -> FieldCache {
        FieldCache::new(LocalStore::new(Arc::new(Database::open_in_memory().unwrap())))
    }

    fn item(operation: Operation) -> QueueItem {
        QueueItem {
            id: 1,
            operation,
            priority: 1,
            depends_on: None,
            status: QueueStatus::Syncing,
            attempts: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            next_eligible_at: None,
            last_error: None,
            result: None,
            idempotency_key: "key-1".to_string(),
            origin: "app".to_string(),
        }
    }

    fn inspection() -> Operation {
        Operation::Inspection(InspectionPayload {
            local_id: "local-7".to_string(),
            plot_id: "p1".to_string(),
            farm_id: "f1".to_string(),
            category: "pest".to_string(),
            title: "Caterpillars".to_string(),
            description: String::new(),
            severity: "high".to_string(),
            latitude: Some(-23.5),
            longitude: Some(-51.9),
            recorded_at: None,
        })
    }

    fn respond(status: u16, body: Value) -> Result<RemoteResponse, ExecutionError> {
        Ok(RemoteResponse { status, body })
    }

    #[test]
    fn test_status_classification() {
        assert!(ExecutionError::from_status(422, &json!({"error": "bad"})).is_permanent());
        assert!(!ExecutionError::from_status(429, &Value::Null).is_permanent());
        assert!(!ExecutionError::from_status(408, &Value::Null).is_permanent());
        assert!(!ExecutionError::from_status(503, &Value::Null).is_permanent());
        assert_eq!(
            ExecutionError::from_status(500, &json!("boom")).message,
            "HTTP 500: boom"
        );
        assert_eq!(ExecutionError::from_status(502, &Value::Null).message, "HTTP 502");
    }

    #[tokio::test]
    async fn test_inspection_posts_and_reconciles() {
        let cache = create_test_cache();
        cache
            .record_local(Collection::Inspections, "local-7", json!({"title": "Caterpillars"}))
            .unwrap();

        let mut remote = MockRemoteApi::new();
        remote
            .expect_send()
            .withf(|req| {
                req.method == Method::Post
                    && req.path == "/api/inspections"
                    && req.idempotency_key == "key-1"
                    && req.body.as_ref().is_some_and(|b| b["plot_id"] == "p1")
            })
            .times(1)
            .returning(|_| respond(201, json!({"id": 4410})));

        let executor = RemoteExecutor::new(remote, cache.clone());
        let result = executor.execute(&item(inspection())).await.unwrap();

        assert_eq!(result["id"], 4410);
        let cached = cache
            .store()
            .get(Collection::Inspections, "local-7")
            .unwrap()
            .unwrap();
        assert_eq!(cached.value["server_id"], 4410);
        assert_eq!(cached.value["sync_status"], "synced");
    }

    #[tokio::test]
    async fn test_plot_update_puts_changes_and_caches_response() {
        let cache = create_test_cache();

        let mut changes = Map::new();
        changes.insert("crop".to_string(), json!("wheat"));
        let op = Operation::PlotUpdate(EntityUpdatePayload {
            id: "p9".to_string(),
            changes,
        });

        let mut remote = MockRemoteApi::new();
        remote
            .expect_send()
            .withf(|req| {
                req.method == Method::Put
                    && req.path == "/api/plots/p9"
                    && req.body == Some(json!({"crop": "wheat"}))
            })
            .returning(|_| respond(200, json!({"id": "p9", "crop": "wheat", "farm_id": "f2"})));

        let executor = RemoteExecutor::new(remote, cache.clone());
        executor.execute(&item(op)).await.unwrap();

        let plots = cache.plots_for_farm("f2").unwrap();
        assert_eq!(plots.len(), 1);
        assert_eq!(plots[0].key, "p9");
    }

    #[tokio::test]
    async fn test_vegetation_index_request_stores_result() {
        let cache = create_test_cache();
        let op = Operation::VegetationIndexRequest(VegetationIndexPayload {
            plot_id: "p3".to_string(),
            date: "2024-11-02".to_string(),
            index_type: "ndvi".to_string(),
        });

        let mut remote = MockRemoteApi::new();
        remote
            .expect_send()
            .withf(|req| {
                req.method == Method::Get
                    && req.path == "/api/ndvi"
                    && req.body.is_none()
                    && req.query.contains(&("plot_id".to_string(), "p3".to_string()))
            })
            .returning(|_| respond(200, json!({"mean": 0.68})));

        let executor = RemoteExecutor::new(remote, cache.clone());
        executor.execute(&item(op)).await.unwrap();

        let indices = cache.vegetation_indices("p3", Some("ndvi")).unwrap();
        assert_eq!(indices.len(), 1);
        assert_eq!(indices[0].value["mean"], 0.68);
    }

    #[tokio::test]
    async fn test_rejected_request_is_permanent_and_cache_untouched() {
        let cache = create_test_cache();
        cache
            .record_local(Collection::Inspections, "local-7", json!({}))
            .unwrap();

        let mut remote = MockRemoteApi::new();
        remote
            .expect_send()
            .returning(|_| respond(400, json!({"error": "severity is required"})));

        let executor = RemoteExecutor::new(remote, cache.clone());
        let err = executor.execute(&item(inspection())).await.unwrap_err();

        assert!(err.is_permanent());
        assert!(err.message.contains("severity is required"));
        assert_eq!(cache.unsynced(Collection::Inspections).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_transient() {
        let mut remote = MockRemoteApi::new();
        remote
            .expect_send()
            .returning(|_| Err(ExecutionError::transient("connection refused")));

        let executor = RemoteExecutor::new(remote, create_test_cache());
        let err = executor.execute(&item(inspection())).await.unwrap_err();

        assert_eq!(err.kind, FailureKind::Transient);
    }

    #[tokio::test]
    async fn test_http_remote_sends_sync_headers() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            tx.send(String::from_utf8_lossy(&buf[..n]).to_lowercase())
                .unwrap();
            let body = r#"{"mean":0.7}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let server = ServerConfig {
            base_url: format!("http://{addr}/"),
            ..ServerConfig::default()
        };
        let remote = HttpRemote::new(&server).unwrap();
        let response = remote
            .send(RemoteRequest {
                method: Method::Get,
                path: "/api/ndvi".to_string(),
                query: vec![("plot_id".to_string(), "p3".to_string())],
                body: None,
                idempotency_key: "key-1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body["mean"], 0.7);

        let request = rx.await.unwrap();
        assert!(request.starts_with("get /api/ndvi?plot_id=p3 "));
        assert!(request.contains("x-offline-sync: true"));
        assert!(request.contains("idempotency-key: key-1"));
    }
}
