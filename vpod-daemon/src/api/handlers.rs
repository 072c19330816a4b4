//! Request handlers. Every operation answers `{Code, Cause, ...}`; the code
//! values are the daemon's result kinds.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use vpod_vmm::device::RestoreMode;
use vpod_vmm::pod::UserPod;

use crate::error::{DaemonError, ResultCode};
use crate::migrate::MigrateController;
use crate::registry::{PodRegistry, PodStatus};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<PodRegistry>,
    pub migrate: Arc<MigrateController>,
}

/// API error response.
#[derive(Serialize, ToSchema)]
pub struct ApiError {
    #[serde(rename = "Code")]
    pub code: i32,
    #[serde(rename = "Cause")]
    pub cause: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.code {
            c if c == ResultCode::NoSuchPod.as_i32() => StatusCode::NOT_FOUND,
            c if c == ResultCode::Busy.as_i32() => StatusCode::CONFLICT,
            c if c == ResultCode::Protocol.as_i32() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<DaemonError> for ApiError {
    fn from(e: DaemonError) -> Self {
        Self {
            code: e.code().as_i32(),
            cause: e.to_string(),
        }
    }
}

/// Outcome without a payload.
#[derive(Serialize, ToSchema)]
pub struct OpResponse {
    #[serde(rename = "Code")]
    pub code: i32,
    #[serde(rename = "Cause")]
    pub cause: String,
}

impl OpResponse {
    fn ok() -> Self {
        Self {
            code: ResultCode::Ok.as_i32(),
            cause: String::new(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct CreatePodResponse {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Code")]
    pub code: i32,
    #[serde(rename = "Cause")]
    pub cause: String,
}

#[derive(Serialize, ToSchema)]
pub struct RestoreResponse {
    #[serde(rename = "Code")]
    pub code: i32,
    #[serde(rename = "Cause")]
    pub cause: String,
    /// Port the incoming hypervisor listens on for the memory copy.
    #[serde(rename = "Port")]
    pub port: u16,
}

#[derive(Serialize, ToSchema)]
pub struct ApiPod {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ApiVm {
    pub id: String,
    pub pod: String,
}

#[derive(Serialize, ToSchema)]
pub struct ListResponse {
    #[serde(rename = "Code")]
    pub code: i32,
    #[serde(rename = "Cause")]
    pub cause: String,
    #[serde(rename = "podData", skip_serializing_if = "Option::is_none")]
    pub pods: Option<Vec<ApiPod>>,
    #[serde(rename = "vmData", skip_serializing_if = "Option::is_none")]
    pub vms: Option<Vec<ApiVm>>,
}

#[derive(Serialize, ToSchema)]
pub struct InfoResponse {
    pub version: String,
    pub pods: usize,
    pub vms: usize,
}

#[derive(Serialize, ToSchema)]
pub struct VersionInfo {
    pub version: String,
}

fn status_name(status: PodStatus) -> &'static str {
    match status {
        PodStatus::Pending => "pending",
        PodStatus::Running => "running",
        PodStatus::Stopped => "stopped",
        PodStatus::Failed => "failed",
    }
}

/// Create a pod from a user pod spec
#[utoipa::path(
    post,
    path = "/pod/create",
    responses(
        (status = 200, description = "Pod created", body = CreatePodResponse),
        (status = 400, description = "Invalid spec", body = ApiError),
        (status = 409, description = "Pod already exists", body = ApiError)
    ),
    tag = "pods"
)]
pub async fn create_pod(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<CreatePodResponse>, ApiError> {
    let spec: UserPod = serde_json::from_value(body)
        .map_err(|e| ApiError::from(DaemonError::Protocol(format!("bad pod spec: {e}"))))?;
    let id = state.registry.create_pod(spec).await?;
    Ok(Json(CreatePodResponse {
        id,
        code: ResultCode::Ok.as_i32(),
        cause: String::new(),
    }))
}

#[derive(Deserialize)]
pub struct PodIdQuery {
    #[serde(rename = "podId")]
    pub pod_id: String,
}

/// Start a created pod in a fresh VM
#[utoipa::path(
    post,
    path = "/pod/start",
    responses(
        (status = 200, description = "Pod running", body = OpResponse),
        (status = 404, description = "No such pod", body = ApiError)
    ),
    tag = "pods"
)]
pub async fn start_pod(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PodIdQuery>,
) -> Result<Json<OpResponse>, ApiError> {
    state.registry.start_pod(&query.pod_id).await?;
    Ok(Json(OpResponse::ok()))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub item: String,
}

/// List pods or VMs
#[utoipa::path(
    get,
    path = "/list",
    responses(
        (status = 200, description = "Listing", body = ListResponse),
        (status = 400, description = "Unknown item kind", body = ApiError)
    ),
    tag = "daemon"
)]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let mut response = ListResponse {
        code: ResultCode::Ok.as_i32(),
        cause: String::new(),
        pods: None,
        vms: None,
    };
    match query.item.as_str() {
        "pod" => {
            response.pods = Some(
                state
                    .registry
                    .list_pods()
                    .await
                    .into_iter()
                    .map(|p| ApiPod {
                        id: p.id,
                        status: status_name(p.status).to_string(),
                        vm: p.vm,
                    })
                    .collect(),
            );
        }
        "vm" => {
            response.vms = Some(
                state
                    .registry
                    .list_vms()
                    .await
                    .into_iter()
                    .map(|v| ApiVm { id: v.id, pod: v.pod })
                    .collect(),
            );
        }
        other => {
            return Err(DaemonError::Protocol(format!("unknown list item {other}")).into());
        }
    }
    Ok(Json(response))
}

#[derive(Deserialize)]
pub struct StopQuery {
    #[serde(rename = "podName")]
    pub pod_name: String,
}

/// Stop a running pod and shut its VM down
#[utoipa::path(
    get,
    path = "/stop",
    responses(
        (status = 200, description = "Pod stopped", body = OpResponse),
        (status = 404, description = "No such pod", body = ApiError)
    ),
    tag = "pods"
)]
pub async fn stop(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StopQuery>,
) -> Result<Json<OpResponse>, ApiError> {
    state.registry.stop_pod(&query.pod_name).await?;
    Ok(Json(OpResponse::ok()))
}

#[derive(Deserialize)]
pub struct PodMigrateQuery {
    #[serde(rename = "podId")]
    pub pod_id: String,
    #[serde(rename = "desAddr")]
    pub des_addr: String,
    #[serde(rename = "networkRedirect")]
    pub network_redirect: Option<String>,
    #[serde(rename = "networkRecover")]
    pub network_recover: Option<String>,
    #[serde(rename = "restoreMode")]
    pub restore_mode: Option<String>,
}

/// Ship a pod's metadata and storage to a peer daemon
#[utoipa::path(
    post,
    path = "/pod/migrate",
    responses(
        (status = 200, description = "Pod package restored on target", body = OpResponse),
        (status = 404, description = "No such pod", body = ApiError)
    ),
    tag = "migration"
)]
pub async fn pod_migrate(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PodMigrateQuery>,
) -> Result<Json<OpResponse>, ApiError> {
    state
        .migrate
        .migrate_pod(
            &query.pod_id,
            &query.des_addr,
            query.network_redirect.as_deref(),
            query.network_recover.as_deref(),
            parse_restore_mode(query.restore_mode.as_deref()),
        )
        .await?;
    Ok(Json(OpResponse::ok()))
}

#[derive(Deserialize)]
pub struct VmMigrateQuery {
    #[serde(rename = "podId")]
    pub pod_id: String,
    #[serde(rename = "desAddr")]
    pub des_addr: String,
}

/// Copy VM memory to the peer and confirm the hand-over
#[utoipa::path(
    post,
    path = "/vm/migrate",
    responses(
        (status = 200, description = "Migration complete", body = OpResponse),
        (status = 404, description = "No such pod", body = ApiError),
        (status = 500, description = "Migration timed out", body = ApiError)
    ),
    tag = "migration"
)]
pub async fn vm_migrate(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VmMigrateQuery>,
) -> Result<Json<OpResponse>, ApiError> {
    state
        .migrate
        .migrate_vm(&query.pod_id, &query.des_addr)
        .await?;
    Ok(Json(OpResponse::ok()))
}

/// Restore a migrated pod from an envelope (target side)
#[utoipa::path(
    post,
    path = "/pod/restore",
    responses(
        (status = 200, description = "Pod restored, memory port chosen", body = RestoreResponse),
        (status = 409, description = "Pod or VM already exists", body = ApiError)
    ),
    tag = "migration"
)]
pub async fn pod_restore(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<RestoreResponse>, ApiError> {
    let mut migrate_data = None;
    let mut port = None;
    let mut share_type = "nfs".to_string();
    let mut share_list = Vec::new();
    let mut mode = None;
    for (key, value) in pairs {
        match key.as_str() {
            "migrateData" => migrate_data = Some(value),
            "port" => port = value.parse::<u16>().ok(),
            "shareType" => share_type = value,
            "shareList" => share_list.push(value),
            "restoreMode" => mode = Some(value),
            _ => {}
        }
    }
    let migrate_data = migrate_data
        .ok_or_else(|| ApiError::from(DaemonError::Protocol("missing migrateData".into())))?;

    let port = state
        .migrate
        .restore_pod(
            &migrate_data,
            port,
            &share_type,
            &share_list,
            parse_restore_mode(mode.as_deref()),
        )
        .await?;
    Ok(Json(RestoreResponse {
        code: ResultCode::Ok.as_i32(),
        cause: String::new(),
        port,
    }))
}

#[derive(Deserialize)]
pub struct VmRestoreQuery {
    #[serde(rename = "podId")]
    pub pod_id: String,
    #[serde(rename = "isSuccess")]
    pub is_success: String,
}

/// Confirm or abandon a restored pod (target side)
#[utoipa::path(
    post,
    path = "/vm/restore",
    responses(
        (status = 200, description = "Restore settled", body = OpResponse),
        (status = 404, description = "No such pod", body = ApiError)
    ),
    tag = "migration"
)]
pub async fn vm_restore(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VmRestoreQuery>,
) -> Result<Json<OpResponse>, ApiError> {
    let is_success = query.is_success == "true";
    state.migrate.restore_vm(&query.pod_id, is_success).await?;
    Ok(Json(OpResponse::ok()))
}

/// Daemon information
#[utoipa::path(
    get,
    path = "/info",
    responses((status = 200, description = "Daemon info", body = InfoResponse)),
    tag = "daemon"
)]
pub async fn get_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    let pods = state.registry.list_pods().await;
    let vms = state.registry.list_vms().await;
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        pods: pods.len(),
        vms: vms.len(),
    })
}

/// Daemon version
#[utoipa::path(
    get,
    path = "/version",
    responses((status = 200, description = "Daemon version", body = VersionInfo)),
    tag = "daemon"
)]
pub async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn parse_restore_mode(mode: Option<&str>) -> RestoreMode {
    match mode {
        Some("copy") => RestoreMode::Copy,
        _ => RestoreMode::Snapshot,
    }
}
