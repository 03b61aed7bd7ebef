//! Topology, scenario, disk and host handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use phenix_control::RequestContext;
use phenix_types::{Cluster, Scenario};

pub async fn list_topologies(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.plane.list_topologies(&ctx).await?))
}

/// Scenarios that apply to a topology
pub async fn list_scenarios(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(topology): Path<String>,
) -> ApiResult<Json<Vec<Scenario>>> {
    Ok(Json(state.plane.list_scenarios(&ctx, &topology).await?))
}

pub async fn list_disks(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.plane.list_disks(&ctx).await?))
}

pub async fn list_hosts(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Json<Cluster>> {
    Ok(Json(state.plane.list_hosts(&ctx).await?))
}
