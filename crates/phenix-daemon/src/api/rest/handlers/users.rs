//! User management handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use phenix_control::RequestContext;
use phenix_types::{CreateUserRequest, UpdateUserRequest, UserSpec};
use tracing::debug;

pub async fn list_users(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Json<Vec<UserSpec>>> {
    Ok(Json(state.plane.list_users(&ctx).await?))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(username): Path<String>,
) -> ApiResult<Json<UserSpec>> {
    Ok(Json(state.plane.get_user(&ctx, &username).await?))
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<UserSpec>)> {
    debug!(user = %ctx.user, username = %request.username, "POST /users");
    let user = state.plane.create_user(&ctx, request).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(username): Path<String>,
    Json(request): Json<UpdateUserRequest>,
) -> ApiResult<Json<UserSpec>> {
    debug!(user = %ctx.user, username = %username, "PATCH /users/:username");
    Ok(Json(state.plane.update_user(&ctx, &username, request).await?))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(username): Path<String>,
) -> ApiResult<StatusCode> {
    debug!(user = %ctx.user, username = %username, "DELETE /users/:username");
    state.plane.delete_user(&ctx, &username).await?;
    Ok(StatusCode::NO_CONTENT)
}
