//! Request and response types for the fleet API.
//!
//! Node-facing operations are `POST /api/v0/fleet/<operation>` with these
//! types as JSON bodies. The admin API reuses the message and object types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use fleet_id::{MessageId, NodeId, ObjectId, RunId};
use serde::{Deserialize, Serialize};

use crate::tree::ObjectTree;

/// Path prefix of the node-facing API.
pub const FLEET_API_PREFIX: &str = "/api/v0/fleet";

// =============================================================================
// Shared types
// =============================================================================

/// Identity a node presents on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
}

impl Node {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }
}

/// Advisory asking a node to wait before its next poll.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reconnect {
    pub reconnect_after_secs: f64,
}

/// A directed unit of work or result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub run_id: RunId,
    pub src_node_id: NodeId,
    pub dst_node_id: NodeId,

    /// Application-level kind, e.g. `train` or `evaluate`.
    pub message_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<MessageId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// Stamped by the coordinator on acceptance; ignored on push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Time to live in seconds. Absent means the coordinator default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<f64>,
}

/// Per-message outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Accepted,
    RejectedMalformed,
    RejectedUnknownDestination,
    RejectedUnknownRun,
    RejectedRunFinished,
    RejectedSourceMismatch,
    RejectedDuplicate,
}

impl PushStatus {
    /// Stable numeric code, used in logs.
    pub fn code(&self) -> u32 {
        match self {
            PushStatus::Accepted => 0,
            PushStatus::RejectedMalformed => 1,
            PushStatus::RejectedUnknownDestination => 2,
            PushStatus::RejectedUnknownRun => 3,
            PushStatus::RejectedRunFinished => 4,
            PushStatus::RejectedSourceMismatch => 5,
            PushStatus::RejectedDuplicate => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PushStatus::Accepted => "accepted",
            PushStatus::RejectedMalformed => "rejected_malformed",
            PushStatus::RejectedUnknownDestination => "rejected_unknown_destination",
            PushStatus::RejectedUnknownRun => "rejected_unknown_run",
            PushStatus::RejectedRunFinished => "rejected_run_finished",
            PushStatus::RejectedSourceMismatch => "rejected_source_mismatch",
            PushStatus::RejectedDuplicate => "rejected_duplicate",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, PushStatus::Accepted)
    }
}

impl fmt::Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Runs
// =============================================================================

/// Lifecycle state of a run. Only moves forward; `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Starting,
    Running,
    Finished,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, RunStatus::Finished)
    }

    /// Returns true if a run may move from `self` to `next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        !self.is_finished() && next > *self
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "starting" => Ok(RunStatus::Starting),
            "running" => Ok(RunStatus::Running),
            "finished" => Ok(RunStatus::Finished),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Run descriptor returned by `get-run` and the admin API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub fab_id: String,
    pub fab_version: String,
    pub fab_hash: String,
    pub bundle_uri: String,
    #[serde(default)]
    pub run_config: BTreeMap<String, serde_json::Value>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Opaque pointer into the external bundle store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    pub fab_hash: String,
    pub uri: String,
}

// =============================================================================
// Objects
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    Reserved,
    Committed,
}

impl ObjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectState::Reserved => "reserved",
            ObjectState::Committed => "committed",
        }
    }
}

impl FromStr for ObjectState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(ObjectState::Reserved),
            "committed" => Ok(ObjectState::Committed),
            other => Err(format!("unknown object state: {other}")),
        }
    }
}

/// Whether an object holds payload bytes or tree structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Blob,
    Tree,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
        }
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            other => Err(format!("unknown object kind: {other}")),
        }
    }
}

/// One piece of an object upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectChunk {
    pub object_id: ObjectId,

    #[serde(with = "crate::bytes")]
    pub content: Vec<u8>,

    /// Byte offset of `content`. Absent means append.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,

    /// Full object size, fixed once declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,

    #[serde(default)]
    pub is_final: bool,
}

/// A byte range of a committed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRange {
    pub object_id: ObjectId,

    #[serde(default)]
    pub offset: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub object_id: ObjectId,
    pub kind: ObjectKind,
    pub state: ObjectState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_size: Option<u64>,
    pub received_bytes: u64,
    pub ref_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Node-facing requests
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNodeRequest {
    /// Requested heartbeat interval in seconds.
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNodeResponse {
    pub node: Node,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteNodeRequest {
    pub node: Node,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteNodeResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendNodeHeartbeatRequest {
    pub node: Node,
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendNodeHeartbeatResponse {
    /// False if the node had already been evicted and must re-register.
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullMessagesRequest {
    pub node: Node,
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullMessagesResponse {
    pub reconnect: Option<Reconnect>,
    pub messages: Vec<Message>,
    /// Parallel to `messages`.
    pub message_object_trees: Vec<ObjectTree>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessagesRequest {
    pub node: Node,
    pub messages: Vec<Message>,
    /// Parallel to `messages`.
    pub message_object_trees: Vec<ObjectTree>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushMessagesResponse {
    pub reconnect: Option<Reconnect>,
    pub results: BTreeMap<MessageId, PushStatus>,
    /// Leaf objects the sender must upload before the messages are deliverable.
    pub objects_to_push: Vec<ObjectId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRunRequest {
    pub node: Node,
    pub run_id: RunId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRunResponse {
    pub run: Run,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFabRequest {
    pub node: Node,
    pub run_id: RunId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFabResponse {
    pub bundle: BundleRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushObjectRequest {
    pub node: Node,
    pub run_id: RunId,
    #[serde(flatten)]
    pub chunk: ObjectChunk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushObjectResponse {
    pub state: ObjectState,
    pub received_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullObjectRequest {
    pub node: Node,
    pub run_id: RunId,
    #[serde(flatten)]
    pub range: ObjectRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullObjectResponse {
    #[serde(with = "crate::bytes")]
    pub content: Vec<u8>,
    /// True when `content` reaches the end of the object.
    pub is_final: bool,
    pub total_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmMessageReceivedRequest {
    pub node: Node,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmMessageReceivedResponse {}

// =============================================================================
// Admin requests
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub fab_id: String,
    pub fab_version: String,
    pub fab_hash: String,
    pub bundle_uri: String,
    #[serde(default)]
    pub run_config: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRunStatusRequest {
    pub status: RunStatus,
    #[serde(default)]
    pub sub_status: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
}

/// Registry view of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub registered_at: DateTime<Utc>,
    pub heartbeat_deadline: DateTime<Utc>,
    /// Seconds.
    pub heartbeat_interval: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListNodesResponse {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminPushMessagesRequest {
    pub messages: Vec<Message>,
    pub message_object_trees: Vec<ObjectTree>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminPullMessagesRequest {
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfirmMessageRequest {
    pub message_id: MessageId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PushStatus::Accepted, 0, "accepted")]
    #[case(PushStatus::RejectedMalformed, 1, "rejected_malformed")]
    #[case(PushStatus::RejectedUnknownDestination, 2, "rejected_unknown_destination")]
    #[case(PushStatus::RejectedUnknownRun, 3, "rejected_unknown_run")]
    #[case(PushStatus::RejectedRunFinished, 4, "rejected_run_finished")]
    #[case(PushStatus::RejectedSourceMismatch, 5, "rejected_source_mismatch")]
    #[case(PushStatus::RejectedDuplicate, 6, "rejected_duplicate")]
    fn test_push_status_codes(#[case] status: PushStatus, #[case] code: u32, #[case] name: &str) {
        assert_eq!(status.code(), code);
        assert_eq!(status.as_str(), name);
        assert_eq!(
            serde_json::to_value(status).unwrap(),
            serde_json::Value::String(name.to_string())
        );
    }

    #[rstest]
    #[case(RunStatus::Pending, RunStatus::Running, true)]
    #[case(RunStatus::Starting, RunStatus::Finished, true)]
    #[case(RunStatus::Running, RunStatus::Starting, false)]
    #[case(RunStatus::Running, RunStatus::Running, false)]
    #[case(RunStatus::Finished, RunStatus::Finished, false)]
    fn test_run_status_transitions(
        #[case] from: RunStatus,
        #[case] to: RunStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_run_status_parse() {
        for status in [
            RunStatus::Pending,
            RunStatus::Starting,
            RunStatus::Running,
            RunStatus::Finished,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_pull_request_defaults_to_all_messages() {
        let req: PullMessagesRequest =
            serde_json::from_str(r#"{"node":{"node_id":7}}"#).unwrap();
        assert_eq!(req.node.node_id.get(), 7);
        assert!(req.message_ids.is_empty());
    }

    #[test]
    fn test_push_object_request_is_flat() {
        let id = ObjectId::from_content(b"hello");
        let req = PushObjectRequest {
            node: Node::new(NodeId::new(7).unwrap()),
            run_id: RunId::new(3).unwrap(),
            chunk: ObjectChunk {
                object_id: id,
                content: b"hello".to_vec(),
                offset: None,
                total_size: Some(5),
                is_final: true,
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["object_id"], id.to_hex());
        assert_eq!(json["content"], "aGVsbG8=");
        assert_eq!(json["total_size"], 5);
        assert!(json.get("offset").is_none());

        let parsed: PushObjectRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.chunk, req.chunk);
    }

    #[test]
    fn test_message_omits_unset_fields() {
        let message = Message {
            message_id: MessageId::new(),
            run_id: RunId::new(1).unwrap(),
            src_node_id: NodeId::COORDINATOR,
            dst_node_id: NodeId::new(5).unwrap(),
            message_type: "train".to_string(),
            reply_to_message_id: None,
            group_id: None,
            created_at: None,
            ttl: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert!(json.get("ttl").is_none());
        assert!(json.get("created_at").is_none());
        assert_eq!(json["src_node_id"], 1);
    }
}
