//! Fleet API client for the node agent.
//!
//! One typed method per fleet operation. Problem documents returned by the
//! coordinator are mapped back onto [`ClientError`] so callers can tell a
//! retryable condition from one that needs a new identity or a fresh upload.

use std::time::Duration;

use fleet_id::{MessageId, RunId};
use fleet_proto::{
    BundleRef, ConfirmMessageReceivedRequest, ConfirmMessageReceivedResponse, CreateNodeRequest,
    CreateNodeResponse, DeleteNodeRequest, DeleteNodeResponse, GetFabRequest, GetFabResponse,
    GetRunRequest, GetRunResponse, Message, Node, ObjectChunk, ObjectRange, ObjectTree,
    PullMessagesRequest, PullMessagesResponse, PullObjectRequest, PullObjectResponse,
    PushMessagesRequest, PushMessagesResponse, PushObjectRequest, PushObjectResponse, Run,
    SendNodeHeartbeatRequest, SendNodeHeartbeatResponse, FLEET_API_PREFIX,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The node identity is gone; register again.
    #[error("node expired: {0}")]
    NodeExpired(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("object not ready, retry after {retry_after:?}")]
    NotReady { retry_after: Duration },

    /// Upload rejected; restart it from the first byte.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("coordinator unavailable: {0}")]
    Unavailable(String),

    /// Any other non-success response.
    #[error("coordinator returned {status} ({code}): {detail}")]
    Api {
        status: u16,
        code: String,
        detail: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Downloaded bytes did not hash to the object ID.
    #[error("object {0} failed local verification")]
    Corrupt(String),
}

impl ClientError {
    /// True if repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Unavailable(_) | ClientError::NotReady { .. } | ClientError::Transport(_)
        )
    }

    /// Maps a problem document onto an error.
    pub fn from_problem(status: u16, body: &str) -> Self {
        let Ok(problem) = serde_json::from_str::<Problem>(body) else {
            return match status {
                503 => ClientError::Unavailable(body.to_string()),
                _ => ClientError::Api {
                    status,
                    code: "unknown".to_string(),
                    detail: body.to_string(),
                },
            };
        };

        let detail = problem.detail;
        match problem.code.as_str() {
            "node_expired" => ClientError::NodeExpired(detail),
            "not_found" => ClientError::NotFound(detail),
            "not_ready" => ClientError::NotReady {
                retry_after: Duration::from_secs(u64::from(problem.retry_after_seconds.max(1))),
            },
            "integrity_error" => ClientError::Integrity(detail),
            "invalid_argument" => ClientError::InvalidArgument(detail),
            "permission_denied" => ClientError::PermissionDenied(detail),
            "unavailable" => ClientError::Unavailable(detail),
            _ => ClientError::Api {
                status,
                code: problem.code,
                detail,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct Problem {
    code: String,
    #[serde(default)]
    detail: String,
    #[serde(default)]
    retry_after_seconds: u32,
}

/// Fleet API client.
#[derive(Debug, Clone)]
pub struct FleetClient {
    http: reqwest::Client,
    base_url: String,
}

impl FleetClient {
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: format!("{}{FLEET_API_PREFIX}", config.coordinator_url),
        })
    }

    async fn call<Req, Resp>(&self, op: &str, req: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{op}", self.base_url);
        let response = self.http.post(&url).json(req).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = ClientError::from_problem(status.as_u16(), &body);
            debug!(op, status = %status, error = %err, "Fleet call failed");
            return Err(err);
        }

        Ok(response.json().await?)
    }

    pub async fn create_node(&self, heartbeat_interval: Duration) -> Result<Node, ClientError> {
        let resp: CreateNodeResponse = self
            .call(
                "create-node",
                &CreateNodeRequest {
                    heartbeat_interval: heartbeat_interval.as_secs_f64(),
                },
            )
            .await?;
        Ok(resp.node)
    }

    pub async fn delete_node(&self, node: Node) -> Result<(), ClientError> {
        let _: DeleteNodeResponse = self
            .call("delete-node", &DeleteNodeRequest { node })
            .await?;
        Ok(())
    }

    /// Returns false if the coordinator no longer knows this node.
    pub async fn send_node_heartbeat(
        &self,
        node: Node,
        heartbeat_interval: Duration,
    ) -> Result<bool, ClientError> {
        let resp: SendNodeHeartbeatResponse = self
            .call(
                "send-node-heartbeat",
                &SendNodeHeartbeatRequest {
                    node,
                    heartbeat_interval: heartbeat_interval.as_secs_f64(),
                },
            )
            .await?;
        Ok(resp.success)
    }

    pub async fn pull_messages(
        &self,
        node: Node,
        message_ids: Vec<MessageId>,
    ) -> Result<PullMessagesResponse, ClientError> {
        self.call("pull-messages", &PullMessagesRequest { node, message_ids })
            .await
    }

    pub async fn push_messages(
        &self,
        node: Node,
        messages: Vec<Message>,
        message_object_trees: Vec<ObjectTree>,
    ) -> Result<PushMessagesResponse, ClientError> {
        self.call(
            "push-messages",
            &PushMessagesRequest {
                node,
                messages,
                message_object_trees,
            },
        )
        .await
    }

    pub async fn get_run(&self, node: Node, run_id: RunId) -> Result<Run, ClientError> {
        let resp: GetRunResponse = self.call("get-run", &GetRunRequest { node, run_id }).await?;
        Ok(resp.run)
    }

    pub async fn get_fab(&self, node: Node, run_id: RunId) -> Result<BundleRef, ClientError> {
        let resp: GetFabResponse = self.call("get-fab", &GetFabRequest { node, run_id }).await?;
        Ok(resp.bundle)
    }

    pub async fn push_object(
        &self,
        node: Node,
        run_id: RunId,
        chunk: ObjectChunk,
    ) -> Result<PushObjectResponse, ClientError> {
        self.call(
            "push-object",
            &PushObjectRequest {
                node,
                run_id,
                chunk,
            },
        )
        .await
    }

    pub async fn pull_object(
        &self,
        node: Node,
        run_id: RunId,
        range: ObjectRange,
    ) -> Result<PullObjectResponse, ClientError> {
        self.call(
            "pull-object",
            &PullObjectRequest {
                node,
                run_id,
                range,
            },
        )
        .await
    }

    pub async fn confirm_message_received(
        &self,
        node: Node,
        message_id: MessageId,
    ) -> Result<(), ClientError> {
        let _: ConfirmMessageReceivedResponse = self
            .call(
                "confirm-message-received",
                &ConfirmMessageReceivedRequest { node, message_id },
            )
            .await?;
        Ok(())
    }
}
