//! VM handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use base64::Engine;
use phenix_control::RequestContext;
use phenix_types::{
    BackingImageRequest, BackingImageResponse, Capture, SnapshotRequest, StartCaptureRequest,
    UpdateVmRequest, Vm, VmList, VmQuery, VmRedeployRequest,
};
use serde::Deserialize;
use tracing::debug;

/// Edge length used when a screenshot request names none
pub const DEFAULT_SCREENSHOT_SIZE: u32 = 215;

/// Screenshot rendering options
#[derive(Debug, Default, Deserialize)]
pub struct ScreenshotQuery {
    #[serde(default)]
    pub size: Option<u32>,
    /// Any non-empty value returns a `data:` URL instead of raw PNG
    #[serde(default)]
    pub base64: Option<String>,
}

/// VMs of one experiment, filtered, sorted and paged by the query string
pub async fn list_vms(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(exp): Path<String>,
    Query(query): Query<VmQuery>,
) -> ApiResult<Json<VmList>> {
    debug!(user = %ctx.user, experiment = %exp, "GET /experiments/:exp/vms");
    Ok(Json(state.plane.list_vms(&ctx, &exp, &query).await?))
}

/// VMs across every experiment
pub async fn list_all_vms(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Json<VmList>> {
    Ok(Json(state.plane.list_all_vms(&ctx).await?))
}

pub async fn get_vm(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
) -> ApiResult<Json<Vm>> {
    Ok(Json(state.plane.get_vm(&ctx, &exp, &name).await?))
}

pub async fn update_vm(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
    Json(request): Json<UpdateVmRequest>,
) -> ApiResult<Json<Vm>> {
    debug!(user = %ctx.user, experiment = %exp, vm = %name, "PATCH /experiments/:exp/vms/:name");
    Ok(Json(state.plane.update_vm(&ctx, &exp, &name, request).await?))
}

/// Kill a running VM
pub async fn delete_vm(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    debug!(user = %ctx.user, experiment = %exp, vm = %name, "DELETE /experiments/:exp/vms/:name");
    state.plane.delete_vm(&ctx, &exp, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_vm(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
) -> ApiResult<Json<Vm>> {
    debug!(user = %ctx.user, experiment = %exp, vm = %name, "POST /experiments/:exp/vms/:name/start");
    Ok(Json(state.plane.start_vm(&ctx, &exp, &name).await?))
}

pub async fn stop_vm(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
) -> ApiResult<Json<Vm>> {
    debug!(user = %ctx.user, experiment = %exp, vm = %name, "POST /experiments/:exp/vms/:name/stop");
    Ok(Json(state.plane.stop_vm(&ctx, &exp, &name).await?))
}

pub async fn redeploy_vm(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
    request: Option<Json<VmRedeployRequest>>,
) -> ApiResult<Json<Vm>> {
    debug!(user = %ctx.user, experiment = %exp, vm = %name, "POST /experiments/:exp/vms/:name/redeploy");
    let request = request.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.plane.redeploy_vm(&ctx, &exp, &name, request).await?))
}

// ========== Captures ==========

pub async fn list_vm_captures(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
) -> ApiResult<Json<Vec<Capture>>> {
    Ok(Json(state.plane.list_vm_captures(&ctx, &exp, &name).await?))
}

pub async fn start_capture(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
    Json(request): Json<StartCaptureRequest>,
) -> ApiResult<StatusCode> {
    state.plane.start_capture(&ctx, &exp, &name, request).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop_captures(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.plane.stop_captures(&ctx, &exp, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ========== Snapshots ==========

pub async fn list_snapshots(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.plane.list_snapshots(&ctx, &exp, &name).await?))
}

/// Snapshot a VM; progress is pushed to live subscribers
pub async fn snapshot_vm(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
    Json(request): Json<SnapshotRequest>,
) -> ApiResult<StatusCode> {
    debug!(user = %ctx.user, experiment = %exp, vm = %name, "POST /experiments/:exp/vms/:name/snapshots");
    state.plane.snapshot_vm(&ctx, &exp, &name, request).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn restore_vm(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name, snapshot)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    debug!(
        user = %ctx.user,
        experiment = %exp,
        vm = %name,
        snapshot = %snapshot,
        "POST /experiments/:exp/vms/:name/snapshots/:snapshot"
    );
    state.plane.restore_vm(&ctx, &exp, &name, &snapshot).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Commit a VM's disk to a new backing image. Without a body the image name
/// is derived from the VM's current disk.
pub async fn commit_vm(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
    request: Option<Json<BackingImageRequest>>,
) -> ApiResult<Json<BackingImageResponse>> {
    debug!(user = %ctx.user, experiment = %exp, vm = %name, "POST /experiments/:exp/vms/:name/commit");
    let request = request.map(|Json(r)| r);
    Ok(Json(state.plane.commit_vm(&ctx, &exp, &name, request).await?))
}

/// Console screenshot of a running VM
pub async fn screenshot(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((exp, name)): Path<(String, String)>,
    Query(query): Query<ScreenshotQuery>,
) -> ApiResult<Response> {
    debug!(user = %ctx.user, experiment = %exp, vm = %name, "GET /experiments/:exp/vms/:name/screenshot.png");
    let size = query.size.unwrap_or(DEFAULT_SCREENSHOT_SIZE);
    let image = state.plane.screenshot(&ctx, &exp, &name, size).await?;

    let encode = query.base64.as_deref().is_some_and(|v| !v.is_empty());
    if encode {
        let url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&image)
        );
        return Ok(url.into_response());
    }

    Ok(([(header::CONTENT_TYPE, "image/png")], image).into_response())
}
