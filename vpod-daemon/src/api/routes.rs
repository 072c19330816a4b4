use std::sync::Arc;

use axum::{
    Json, Router,
    routing::{get, post},
};
use utoipa::OpenApi;

use super::handlers::{self, AppState};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "vpod Daemon",
        version = "0.1.0",
        description = "REST API for the vpod hypervisor-based pod runtime daemon.",
        license(name = "MIT")
    ),
    tags(
        (name = "daemon", description = "Daemon information"),
        (name = "pods", description = "Pod lifecycle"),
        (name = "migration", description = "Live migration between peer daemons")
    ),
    paths(
        handlers::get_info,
        handlers::get_version,
        handlers::create_pod,
        handlers::start_pod,
        handlers::list,
        handlers::stop,
        handlers::pod_migrate,
        handlers::vm_migrate,
        handlers::pod_restore,
        handlers::vm_restore,
    ),
    components(schemas(
        handlers::ApiError,
        handlers::OpResponse,
        handlers::CreatePodResponse,
        handlers::RestoreResponse,
        handlers::ApiPod,
        handlers::ApiVm,
        handlers::ListResponse,
        handlers::InfoResponse,
        handlers::VersionInfo,
    ))
)]
pub struct ApiDoc;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/info", get(handlers::get_info))
        .route("/version", get(handlers::get_version))
        .route("/list", get(handlers::list))
        .route("/stop", get(handlers::stop))
        .route("/pod/create", post(handlers::create_pod))
        .route("/pod/start", post(handlers::start_pod))
        .route("/pod/migrate", post(handlers::pod_migrate))
        .route("/vm/migrate", post(handlers::vm_migrate))
        .route("/pod/restore", post(handlers::pod_restore))
        .route("/vm/restore", post(handlers::vm_restore))
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .with_state(state)
}
