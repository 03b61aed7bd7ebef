//! Experiment handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use phenix_control::RequestContext;
use phenix_types::{
    Capture, CreateExperimentRequest, Experiment, ExperimentSchedule,
    UpdateExperimentScheduleRequest,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Query options for a single experiment
#[derive(Debug, Default, Deserialize)]
pub struct ExperimentQuery {
    #[serde(default)]
    pub show_dnb: bool,
}

/// List experiments the caller may see
pub async fn list_experiments(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Json<Vec<Experiment>>> {
    debug!(user = %ctx.user, "GET /experiments");
    Ok(Json(state.plane.list_experiments(&ctx).await?))
}

/// Create an experiment from a topology
pub async fn create_experiment(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<CreateExperimentRequest>,
) -> ApiResult<(StatusCode, Json<Experiment>)> {
    debug!(user = %ctx.user, experiment = %request.name, "POST /experiments");
    let exp = state.plane.create_experiment(&ctx, request).await?;
    Ok((StatusCode::CREATED, Json(exp)))
}

pub async fn get_experiment(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
    Query(query): Query<ExperimentQuery>,
) -> ApiResult<Json<Experiment>> {
    debug!(user = %ctx.user, experiment = %name, "GET /experiments/:name");
    Ok(Json(
        state
            .plane
            .get_experiment(&ctx, &name, query.show_dnb)
            .await?,
    ))
}

pub async fn delete_experiment(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    debug!(user = %ctx.user, experiment = %name, "DELETE /experiments/:name");
    state.plane.delete_experiment(&ctx, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start an experiment; returns once every VM is launched
pub async fn start_experiment(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> ApiResult<Json<Experiment>> {
    debug!(user = %ctx.user, experiment = %name, "POST /experiments/:name/start");
    Ok(Json(state.plane.start_experiment(&ctx, &name).await?))
}

pub async fn stop_experiment(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> ApiResult<Json<Experiment>> {
    debug!(user = %ctx.user, experiment = %name, "POST /experiments/:name/stop");
    Ok(Json(state.plane.stop_experiment(&ctx, &name).await?))
}

pub async fn get_schedule(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> ApiResult<Json<ExperimentSchedule>> {
    Ok(Json(state.plane.get_schedule(&ctx, &name).await?))
}

/// Re-run VM placement with the requested algorithm
pub async fn schedule_experiment(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
    Json(request): Json<UpdateExperimentScheduleRequest>,
) -> ApiResult<Json<ExperimentSchedule>> {
    debug!(
        user = %ctx.user,
        experiment = %name,
        algorithm = %request.algorithm,
        "POST /experiments/:name/schedule"
    );
    Ok(Json(
        state
            .plane
            .schedule_experiment(&ctx, &name, &request.algorithm)
            .await?,
    ))
}

pub async fn list_captures(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<Capture>>> {
    Ok(Json(state.plane.list_captures(&ctx, &name).await?))
}

/// File names written by an experiment
#[derive(Debug, Serialize)]
pub struct FileList {
    pub files: Vec<String>,
}

pub async fn list_files(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(name): Path<String>,
) -> ApiResult<Json<FileList>> {
    debug!(user = %ctx.user, experiment = %name, "GET /experiments/:name/files");
    let files = state.plane.list_files(&ctx, &name).await?;
    Ok(Json(FileList { files }))
}

/// Download one experiment file as an attachment
pub async fn get_file(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((name, filename)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    debug!(user = %ctx.user, experiment = %name, file = %filename, "GET /experiments/:name/files/:filename");
    let contents = state.plane.get_file(&ctx, &name, &filename).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", filename),
            ),
        ],
        contents,
    ))
}
