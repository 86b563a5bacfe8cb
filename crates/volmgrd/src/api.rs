//! HTTP front door.
//!
//! | Method | Path | Action |
//! |--------|------|--------|
//! | POST | `/disk/{name}/{size}` | create image |
//! | PUT | `/disk/{name}/{size}` | resize image |
//! | DELETE | `/disk/{name}` | delete image and binding |
//! | POST | `/disk/{name}/publish/{node}` | publish |
//! | DELETE | `/disk/{name}/publish/{node}` | unpublish |
//! | GET | `/dev-path/{name}` | guest device path (text) |
//! | GET | `/capacity` | capacity limits |
//! | GET | `/health` | liveness |

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use volmgr_common::{resolve_path, HostId, VolumeError, VolumeName, VolumeOrchestrator};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    orchestrator: VolumeOrchestrator,
}

/// Request failure.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("Invalid parameter: {0}")]
    BadRequest(String),
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
    pub retryable: bool,
    pub requires_operator: bool,
}

impl ApiError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Volume(e) => match e {
                VolumeError::NotFound { .. } => StatusCode::NOT_FOUND,
                VolumeError::InvalidName { .. } | VolumeError::InvalidSize { .. } => {
                    StatusCode::BAD_REQUEST
                }
                e if e.requires_operator() => StatusCode::INTERNAL_SERVER_ERROR,
                e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn body(&self) -> ErrorResponse {
        let (retryable, requires_operator) = match self {
            ApiError::Volume(e) => (e.is_retryable(), e.requires_operator()),
            ApiError::BadRequest(_) => (false, false),
        };
        ErrorResponse {
            message: self.to_string(),
            retryable,
            requires_operator,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            debug!(status = status.as_u16(), error = %self, "Request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct CreatedImage {
    path: String,
}

#[derive(Debug, Serialize)]
struct Published {
    serial: u64,
    device_path: String,
}

/// Builds the router.
pub fn create_router(orchestrator: VolumeOrchestrator) -> Router {
    Router::new()
        .route("/disk/{name}/{size}", post(create_disk).put(resize_disk))
        .route("/disk/{name}", delete(delete_disk))
        .route(
            "/disk/{name}/publish/{node}",
            post(publish_disk).delete(unpublish_disk),
        )
        .route("/dev-path/{name}", get(device_path))
        .route("/capacity", get(capacity))
        .route("/health", get(health))
        .with_state(AppState { orchestrator })
}

fn parse_size(size: &str) -> ApiResult<u64> {
    size.parse()
        .map_err(|_| ApiError::BadRequest(format!("size '{}' is not a byte count", size)))
}

async fn create_disk(
    State(state): State<AppState>,
    Path((name, size)): Path<(String, String)>,
) -> ApiResult<Json<CreatedImage>> {
    let volume = VolumeName::new(name)?;
    let size = parse_size(&size)?;
    let path = state.orchestrator.images().create_image(&volume, size).await?;
    Ok(Json(CreatedImage {
        path: path.display().to_string(),
    }))
}

async fn resize_disk(
    State(state): State<AppState>,
    Path((name, size)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let volume = VolumeName::new(name)?;
    let size = parse_size(&size)?;
    state.orchestrator.images().resize_image(&volume, size).await?;
    Ok(StatusCode::OK)
}

async fn delete_disk(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    let volume = VolumeName::new(name)?;
    state.orchestrator.images().delete_image(&volume).await?;
    // The image is gone; a stale binding only pins an unused serial.
    if let Err(e) = state.orchestrator.forget(&volume).await {
        warn!(volume = %volume, error = %e, "Image deleted but binding removal failed");
    }
    Ok(StatusCode::OK)
}

async fn publish_disk(
    State(state): State<AppState>,
    Path((name, node)): Path<(String, String)>,
) -> ApiResult<Json<Published>> {
    let volume = VolumeName::new(name)?;
    let host = HostId::new(node)?;
    let serial = state.orchestrator.publish(&volume, &host).await?;
    Ok(Json(Published {
        serial: serial.get(),
        device_path: resolve_path(serial),
    }))
}

async fn unpublish_disk(
    State(state): State<AppState>,
    Path((name, node)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let volume = VolumeName::new(name)?;
    let host = HostId::new(node)?;
    state.orchestrator.unpublish(&volume, &host).await?;
    Ok(StatusCode::OK)
}

async fn device_path(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<String> {
    let volume = VolumeName::new(name)?;
    Ok(state.orchestrator.device_path(&volume).await?)
}

async fn capacity(State(state): State<AppState>) -> impl IntoResponse {
    Json(*state.orchestrator.images().limits())
}

async fn health() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use volmgr_common::{CapacityLimits, ImageManager, MemoryStore};
    use volmgr_test::FakeHypervisor;

    struct TestApp {
        router: Router,
        hypervisor: Arc<FakeHypervisor>,
        dir: TempDir,
    }

    fn test_app() -> TestApp {
        let dir = TempDir::new().unwrap();
        let hypervisor = Arc::new(FakeHypervisor::new());
        let images = ImageManager::new(dir.path(), CapacityLimits::default()).with_tool("echo");
        let orchestrator =
            VolumeOrchestrator::new(Arc::new(MemoryStore::new()), hypervisor.clone(), images);
        TestApp {
            router: create_router(orchestrator),
            hypervisor,
            dir,
        }
    }

    async fn call(router: &Router, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    fn json(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let (status, body) = call(&app.router, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }

    #[tokio::test]
    async fn test_capacity() {
        let app = test_app();
        let (status, body) = call(&app.router, Method::GET, "/capacity").await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["Available"], 2_199_023_255_552u64);
        assert_eq!(body["MaximumVolumeSize"], 107_374_182_400u64);
        assert_eq!(body["MinimumVolumeSize"], 10_485_760u64);
    }

    #[tokio::test]
    async fn test_publish_then_dev_path() {
        let app = test_app();

        let (status, body) = call(&app.router, Method::POST, "/disk/vol-a/publish/host-1").await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["serial"], 1);
        assert_eq!(body["device_path"], "/dev/disk/by-id/virtio-1");
        assert!(app.hypervisor.has_device("host-1", "vol-a"));

        let (status, body) = call(&app.router, Method::GET, "/dev-path/vol-a").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(String::from_utf8(body).unwrap(), "/dev/disk/by-id/virtio-1");
    }

    #[tokio::test]
    async fn test_dev_path_not_found() {
        let app = test_app();
        let (status, body) = call(&app.router, Method::GET, "/dev-path/vol-x").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let body = json(&body);
        assert_eq!(body["retryable"], false);
        assert!(body["message"].as_str().unwrap().contains("not published yet"));
    }

    #[tokio::test]
    async fn test_invalid_name_is_bad_request() {
        let app = test_app();
        let (status, _) = call(&app.router, Method::POST, "/disk/a%2Cb/publish/host-1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(app.hypervisor.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_service_unavailable() {
        let app = test_app();
        app.hypervisor.fail_unreachable("host-1", "drive_add");

        let (status, body) = call(&app.router, Method::POST, "/disk/vol-a/publish/host-1").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json(&body)["retryable"], true);
    }

    #[tokio::test]
    async fn test_dirty_publish_requires_operator() {
        let app = test_app();
        app.hypervisor.fail_reject("host-1", "device_add");
        app.hypervisor.fail_unreachable("host-1", "drive_del");

        let (status, body) = call(&app.router, Method::POST, "/disk/vol-a/publish/host-1").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let body = json(&body);
        assert_eq!(body["requires_operator"], true);
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn test_unpublish() {
        let app = test_app();
        call(&app.router, Method::POST, "/disk/vol-a/publish/host-1").await;

        let (status, _) = call(&app.router, Method::DELETE, "/disk/vol-a/publish/host-1").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!app.hypervisor.has_device("host-1", "vol-a"));
        assert!(!app.hypervisor.has_drive("host-1", "vol-a"));
    }

    #[tokio::test]
    async fn test_create_and_resize_disk() {
        let app = test_app();

        let (status, body) = call(&app.router, Method::POST, "/disk/vol-a/20971520").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body)["path"],
            app.dir.path().join("vol-a.qcow2").display().to_string()
        );

        let (status, _) = call(&app.router, Method::PUT, "/disk/vol-a/41943040").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_disk_bad_size() {
        let app = test_app();
        let (status, _) = call(&app.router, Method::POST, "/disk/vol-a/lots").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app.router, Method::POST, "/disk/vol-a/1024").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json(&body)["message"].as_str().unwrap().contains("between"));
    }

    #[tokio::test]
    async fn test_delete_disk_removes_image_and_binding() {
        let app = test_app();
        call(&app.router, Method::POST, "/disk/vol-a/publish/host-1").await;
        std::fs::write(app.dir.path().join("vol-a.qcow2"), b"qcow").unwrap();

        let (status, _) = call(&app.router, Method::DELETE, "/disk/vol-a").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!app.dir.path().join("vol-a.qcow2").exists());

        let (status, _) = call(&app.router, Method::GET, "/dev-path/vol-a").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_missing_disk_fails() {
        let app = test_app();
        let (status, _) = call(&app.router, Method::DELETE, "/disk/vol-z").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
