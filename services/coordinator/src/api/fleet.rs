//! Node-facing fleet API.
//!
//! Every operation is a JSON `POST` under `/api/v0/fleet`. Nodes identify
//! themselves with the `node` field of the request body.

use axum::{extract::State, response::IntoResponse, routing::post, Json, Router};
use fleet_proto::{
    ConfirmMessageReceivedRequest, ConfirmMessageReceivedResponse, CreateNodeRequest,
    CreateNodeResponse, DeleteNodeRequest, DeleteNodeResponse, GetFabRequest, GetFabResponse,
    GetRunRequest, GetRunResponse, PullMessagesRequest, PullObjectRequest, PushMessagesRequest,
    PushObjectRequest, SendNodeHeartbeatRequest, SendNodeHeartbeatResponse,
};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::fleet::Caller;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/create-node", post(create_node))
        .route("/delete-node", post(delete_node))
        .route("/send-node-heartbeat", post(send_node_heartbeat))
        .route("/pull-messages", post(pull_messages))
        .route("/push-messages", post(push_messages))
        .route("/get-run", post(get_run))
        .route("/get-fab", post(get_fab))
        .route("/push-object", post(push_object))
        .route("/pull-object", post(pull_object))
        .route("/confirm-message-received", post(confirm_message_received))
}

async fn create_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateNodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state
        .coordinator()
        .create_node(req.heartbeat_interval)
        .await
        .map_err(|e| ctx.fail(e))?;

    tracing::debug!(request_id = %ctx.request_id, node_id = %node.node_id, "create-node");
    Ok(Json(CreateNodeResponse { node }))
}

async fn delete_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<DeleteNodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .coordinator()
        .delete_node(req.node.node_id)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(DeleteNodeResponse {}))
}

async fn send_node_heartbeat(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<SendNodeHeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let success = state
        .coordinator()
        .send_node_heartbeat(req.node.node_id, req.heartbeat_interval)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(SendNodeHeartbeatResponse { success }))
}

async fn pull_messages(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<PullMessagesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resp = state
        .coordinator()
        .pull_messages(Caller::Node(req.node.node_id), req.message_ids)
        .await
        .map_err(|e| ctx.fail(e))?;

    tracing::debug!(
        request_id = %ctx.request_id,
        node_id = %req.node.node_id,
        count = resp.messages.len(),
        "pull-messages"
    );
    Ok(Json(resp))
}

async fn push_messages(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<PushMessagesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resp = state
        .coordinator()
        .push_messages(
            Caller::Node(req.node.node_id),
            req.messages,
            req.message_object_trees,
        )
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(resp))
}

async fn get_run(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<GetRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .coordinator()
        .get_run(Caller::Node(req.node.node_id), req.run_id)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(GetRunResponse { run }))
}

async fn get_fab(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<GetFabRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle = state
        .coordinator()
        .get_fab(Caller::Node(req.node.node_id), req.run_id)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(GetFabResponse { bundle }))
}

async fn push_object(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<PushObjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resp = state
        .coordinator()
        .push_object(Caller::Node(req.node.node_id), Some(req.run_id), req.chunk)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(resp))
}

async fn pull_object(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<PullObjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resp = state
        .coordinator()
        .pull_object(Caller::Node(req.node.node_id), Some(req.run_id), req.range)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(resp))
}

async fn confirm_message_received(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<ConfirmMessageReceivedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .coordinator()
        .confirm_message_received(Caller::Node(req.node.node_id), req.message_id)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(Json(ConfirmMessageReceivedResponse {}))
}
