//! Administration API.
//!
//! Served on its own listener. Lets the control side manage runs, inspect the
//! registry and object store, and exchange messages as the coordinator node.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use fleet_id::{ObjectId, RunId};
use fleet_proto::{
    AdminConfirmMessageRequest, AdminPullMessagesRequest, AdminPushMessagesRequest,
    ConfirmMessageReceivedResponse, CreateRunRequest, ListNodesResponse, ListRunsResponse,
    ObjectChunk, ObjectRange, UpdateRunStatusRequest,
};
use sha2::{Digest, Sha256};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::fleet::Caller;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/nodes", get(list_nodes))
        .route("/runs", get(list_runs).post(create_run))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/status", post(update_run_status))
        .route("/messages/push", post(push_messages))
        .route("/messages/pull", post(pull_messages))
        .route("/messages/confirm", post(confirm_message))
        .route("/objects/push", post(push_object))
        .route("/objects/pull", post(pull_object))
        .route("/objects/{object_id}", get(get_object))
}

/// Checks the bearer token when one is configured.
fn require_admin(state: &AppState, ctx: &RequestContext) -> Result<(), ApiError> {
    let Some(expected) = state.config().admin_token.as_deref() else {
        return Ok(());
    };
    let Some(presented) = ctx.bearer_token() else {
        return Err(
            ApiError::unauthorized("unauthorized", "Missing Authorization token")
                .with_request_id(ctx.request_id.clone()),
        );
    };

    // Compare digests so the comparison time does not depend on the prefix match.
    if Sha256::digest(presented.as_bytes()) != Sha256::digest(expected.as_bytes()) {
        return Err(
            ApiError::unauthorized("unauthorized", "Invalid Authorization token")
                .with_request_id(ctx.request_id.clone()),
        );
    }
    Ok(())
}

fn parse_run_id(ctx: &RequestContext, raw: &str) -> Result<RunId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::bad_request("invalid_run_id", "Invalid run ID format")
            .with_request_id(ctx.request_id.clone())
    })
}

async fn list_nodes(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &ctx)?;
    let nodes = state
        .coordinator()
        .list_nodes()
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(ListNodesResponse { nodes }))
}

async fn list_runs(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &ctx)?;
    let runs = state
        .coordinator()
        .list_runs()
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(ListRunsResponse { runs }))
}

async fn create_run(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &ctx)?;
    let run = state
        .coordinator()
        .create_run(req)
        .await
        .map_err(|e| ctx.fail(e))?;

    tracing::info!(request_id = %ctx.request_id, run_id = %run.run_id, "Run created via admin API");
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_run(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &ctx)?;
    let run_id = parse_run_id(&ctx, &run_id)?;
    let run = state
        .coordinator()
        .get_run(Caller::Admin, run_id)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(run))
}

async fn update_run_status(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
    Json(req): Json<UpdateRunStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &ctx)?;
    let run_id = parse_run_id(&ctx, &run_id)?;
    let run = state
        .coordinator()
        .update_run_status(run_id, req)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(run))
}

async fn push_messages(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<AdminPushMessagesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &ctx)?;
    let resp = state
        .coordinator()
        .push_messages(Caller::Admin, req.messages, req.message_object_trees)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(resp))
}

async fn pull_messages(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<AdminPullMessagesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &ctx)?;
    let resp = state
        .coordinator()
        .pull_messages(Caller::Admin, req.message_ids)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(resp))
}

async fn confirm_message(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<AdminConfirmMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &ctx)?;
    state
        .coordinator()
        .confirm_message_received(Caller::Admin, req.message_id)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(ConfirmMessageReceivedResponse {}))
}

async fn push_object(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(chunk): Json<ObjectChunk>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &ctx)?;
    let resp = state
        .coordinator()
        .push_object(Caller::Admin, None, chunk)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(resp))
}

async fn pull_object(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(range): Json<ObjectRange>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &ctx)?;
    let resp = state
        .coordinator()
        .pull_object(Caller::Admin, None, range)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(resp))
}

async fn get_object(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(object_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &ctx)?;
    let object_id = ObjectId::parse(&object_id).map_err(|e| {
        ApiError::bad_request("invalid_object_id", e.to_string())
            .with_request_id(ctx.request_id.clone())
    })?;
    let info = state
        .coordinator()
        .object_info(object_id)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(info))
}
