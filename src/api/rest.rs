//! REST API Handlers

use crate::audit::{AuditLog, OperationRecord, Origin};
use crate::backup::{BackupArchive, BackupManager, PruneReport};
use crate::error::{Error, ErrorClass};
use crate::inventory::{InventoryService, ResourceInventory};
use crate::metrics::ManagerMetrics;
use crate::monitor::{TickReport, UsageMonitor};
use axum::{
    extract::{Json, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Query for `/v1/operations`
#[derive(Debug, Clone, Deserialize)]
pub struct OperationsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Body for `/v1/backups/prune`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PruneRequest {
    /// Defaults to the configured retention
    #[serde(default)]
    pub retention_days: Option<u32>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ErrorClass,
    pub message: String,
}

/// Maps a manager error onto an HTTP response
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match (&self.0, self.0.class()) {
            (Error::NotFound { .. } | Error::VolumeGroupNotFound { .. }, _) => StatusCode::NOT_FOUND,
            (Error::BackupDisabled, _) => StatusCode::CONFLICT,
            (_, ErrorClass::Validation) => StatusCode::BAD_REQUEST,
            (_, ErrorClass::BackendUnavailable | ErrorClass::LockTimeout) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(ApiErrorResponse {
                error: self.0.class(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// Shared application state
#[derive(Clone)]
pub struct ApiState {
    pub inventory: InventoryService,
    pub audit: Arc<AuditLog>,
    pub backups: Arc<BackupManager>,
    pub monitor: Arc<UsageMonitor>,
    pub metrics: ManagerMetrics,
}

/// REST API router builder
pub struct RestRouter {
    state: ApiState,
}

impl RestRouter {
    pub fn new(state: ApiState) -> Self {
        Self { state }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        Router::new()
            .route("/healthz", get(health_check))
            .route("/readyz", get(readiness_check))
            .route("/metrics", get(metrics))
            .route("/v1/inventory", get(get_inventory))
            .route("/v1/operations", get(list_operations))
            .route("/v1/backups", get(list_backups).post(create_backup))
            .route("/v1/backups/prune", post(prune_backups))
            .route("/v1/monitor/tick", post(monitor_tick))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state)
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Ready when the volume backend answers
async fn readiness_check(State(state): State<ApiState>) -> impl IntoResponse {
    match state.inventory.backend().health_check().await {
        Ok(true) => (StatusCode::OK, "ready"),
        Ok(false) => (StatusCode::SERVICE_UNAVAILABLE, "volume backend unavailable"),
        Err(e) => {
            debug!("Readiness probe failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "volume backend unavailable")
        }
    }
}

async fn metrics(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let (content_type, body) = state.metrics.encode()?;
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

async fn get_inventory(
    State(state): State<ApiState>,
) -> Result<Json<ResourceInventory>, ApiError> {
    Ok(Json(state.inventory.refresh().await?))
}

async fn list_operations(
    State(state): State<ApiState>,
    Query(query): Query<OperationsQuery>,
) -> Json<Vec<OperationRecord>> {
    Json(state.audit.recent(query.limit))
}

async fn list_backups(
    State(state): State<ApiState>,
) -> Result<Json<Vec<BackupArchive>>, ApiError> {
    Ok(Json(state.backups.list()?))
}

async fn create_backup(
    State(state): State<ApiState>,
) -> Result<(StatusCode, Json<BackupArchive>), ApiError> {
    info!("Backup requested over API");
    let archive = state.backups.create(Origin::Operator).await?;
    Ok((StatusCode::CREATED, Json(archive)))
}

async fn prune_backups(
    State(state): State<ApiState>,
    body: Option<Json<PruneRequest>>,
) -> Result<Json<PruneReport>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let days = request
        .retention_days
        .unwrap_or(state.backups.config().retention_days);
    Ok(Json(state.backups.prune(days, Origin::Operator).await?))
}

async fn monitor_tick(State(state): State<ApiState>) -> Json<TickReport> {
    Json(state.monitor.tick().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryBackend;
    use crate::backup::BackupConfig;
    use crate::domain::model::FsType;
    use crate::domain::units::{GIB, MIB};
    use crate::guard::{DenyAll, GuardConfig, OperationGuard};
    use crate::lifecycle::{LifecycleConfig, LifecycleOrchestrator};
    use crate::monitor::MonitorConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(dir: &std::path::Path) -> (Arc<InMemoryBackend>, ApiState) {
        let backend = Arc::new(InMemoryBackend::new());
        backend.seed_volume_group("vg0", 4 * MIB, &[("/dev/sdb", 100 * GIB)]);
        backend.seed_logical_volume("vg0", "www", 10 * GIB, Some(FsType::Ext4), Some("/var/www"));
        backend.set_usage_percent("vg0/www", 85.0);

        let metrics = ManagerMetrics::new().unwrap();
        let audit = Arc::new(AuditLog::new().with_metrics(metrics.clone()));
        let inventory = InventoryService::new(backend.clone());
        let guard = Arc::new(OperationGuard::new(
            GuardConfig::default(),
            inventory.clone(),
            Arc::new(DenyAll),
            audit.clone(),
        ));
        let lifecycle = Arc::new(LifecycleOrchestrator::new(
            LifecycleConfig::default(),
            backend.clone(),
            guard,
        ));
        let monitor = Arc::new(
            UsageMonitor::new(MonitorConfig::default(), inventory.clone(), lifecycle, audit.clone())
                .with_metrics(metrics.clone()),
        );
        let backups = Arc::new(BackupManager::new(
            BackupConfig {
                enabled: true,
                location: dir.to_path_buf(),
                retention_days: 30,
                interval: Duration::from_secs(3600),
            },
            inventory.clone(),
            backend.clone(),
            audit.clone(),
        ));

        (
            backend,
            ApiState {
                inventory,
                audit,
                backups,
                monitor,
                metrics,
            },
        )
    }

    async fn call(router: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, state) = state(dir.path());

        let (status, _) = call(RestRouter::new(state.clone()).build(), "GET", "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(RestRouter::new(state.clone()).build(), "GET", "/readyz").await;
        assert_eq!(status, StatusCode::OK);

        backend.set_available(false);
        let (status, _) = call(RestRouter::new(state).build(), "GET", "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_inventory_and_unavailable_backend() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, state) = state(dir.path());

        let (status, body) = call(RestRouter::new(state.clone()).build(), "GET", "/v1/inventory").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["vgs"]["vg0"]["size_bytes"], 100 * GIB);

        backend.set_available(false);
        let (status, body) = call(RestRouter::new(state).build(), "GET", "/v1/inventory").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "backend-unavailable");
    }

    #[tokio::test]
    async fn test_monitor_tick_then_operations() {
        let dir = tempfile::tempdir().unwrap();
        let (_, state) = state(dir.path());

        let (status, body) = call(RestRouter::new(state.clone()).build(), "POST", "/v1/monitor/tick").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["evaluations"][0]["decision"], "warn");

        let (_, body) = call(RestRouter::new(state.clone()).build(), "GET", "/v1/operations?limit=5").await;
        assert_eq!(body[0]["kind"], "usage-warning");

        let router = RestRouter::new(state).build();
        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains("lvm_operations_total{kind=\"usage-warning\",outcome=\"warning\"} 1"));
    }

    #[tokio::test]
    async fn test_backup_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (_, state) = state(dir.path());

        let (status, body) = call(RestRouter::new(state.clone()).build(), "POST", "/v1/backups").await;
        assert_eq!(status, StatusCode::CREATED);
        let name = body["name"].as_str().unwrap().to_string();

        let (_, body) = call(RestRouter::new(state.clone()).build(), "GET", "/v1/backups").await;
        assert_eq!(body[0]["name"], name.as_str());

        let (status, body) = call(RestRouter::new(state).build(), "POST", "/v1/backups/prune").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kept"], 1);
    }
}
