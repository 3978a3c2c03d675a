//! The fleet coordinator facade.
//!
//! `Coordinator` composes the node registry, message queue, object store and
//! run directory behind one async API. Every node-initiated call first checks
//! that the caller is still registered, and calls that touch a run check that
//! the run is open. All store work for one call runs in a single transaction
//! on the blocking pool.

mod error;
mod load;

pub use error::FleetError;
pub use load::{LoadGuard, LoadMonitor};

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_id::{MessageId, NodeId, ObjectId, RunId};
use fleet_proto::{
    BundleRef, CreateRunRequest, FlatTree, Message, Node, NodeInfo, ObjectChunk, ObjectInfo,
    ObjectRange, ObjectState, ObjectTree, PullMessagesResponse, PullObjectResponse,
    PushMessagesResponse, PushObjectResponse, PushStatus, Run, TreeLimits,
    UpdateRunStatusRequest,
};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::FleetSettings;
use crate::db::{Store, StoreError};
use crate::objects::{ChunkOutcome, ObjectStore};
use crate::queue::MessageQueue;
use crate::registry::NodeRegistry;
use crate::runs::{RunAccess, RunDirectory};

/// Who is making a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// A registered edge node.
    Node(NodeId),
    /// The admin API, acting as the coordinator node.
    Admin,
}

impl Caller {
    /// Node identity the call acts as.
    pub fn node_id(&self) -> NodeId {
        match self {
            Caller::Node(node_id) => *node_id,
            Caller::Admin => NodeId::COORDINATOR,
        }
    }
}

/// What one sweep pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_nodes: usize,
    pub expired_messages: usize,
    pub purged_messages: usize,
    pub reclaimed_objects: usize,
    pub collected_objects: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    clock: Arc<dyn Clock>,
    settings: FleetSettings,
    registry: NodeRegistry,
    queue: MessageQueue,
    objects: ObjectStore,
    runs: RunDirectory,
    load: LoadMonitor,
}

impl Coordinator {
    pub fn new(store: Store, clock: Arc<dyn Clock>, settings: FleetSettings) -> Self {
        let inner = Inner {
            registry: NodeRegistry::new(&settings),
            queue: MessageQueue::new(&settings),
            objects: ObjectStore::new(&settings),
            runs: RunDirectory::new(),
            load: LoadMonitor::new(settings.load_shed_threshold, settings.reconnect_backoff),
            store,
            clock,
            settings,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.inner.settings
    }

    pub fn load(&self) -> &LoadMonitor {
        &self.inner.load
    }

    /// Runs `f` on the blocking pool with the current time.
    async fn blocking<T, F>(&self, f: F) -> Result<T, FleetError>
    where
        F: FnOnce(&Inner, DateTime<Utc>) -> Result<T, FleetError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let now = inner.clock.now();
            // Match the precision of stored timestamps.
            let now = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
            f(&inner, now)
        })
        .await
        .map_err(|e| FleetError::Unavailable(StoreError::Task(e.to_string())))?
    }

    // =========================================================================
    // Node lifecycle
    // =========================================================================

    pub async fn create_node(&self, heartbeat_interval: f64) -> Result<Node, FleetError> {
        self.blocking(move |inner, now| {
            let interval = inner.registry.normalize_interval(heartbeat_interval)?;
            let info = inner
                .store
                .write(|tx| inner.registry.create_node(tx, interval, now))?;
            Ok(Node::new(info.node_id))
        })
        .await
    }

    pub async fn delete_node(&self, node_id: NodeId) -> Result<(), FleetError> {
        self.blocking(move |inner, now| {
            inner
                .store
                .write(|tx| inner.registry.delete_node(tx, node_id, now))
        })
        .await
    }

    /// Returns false if the node is gone and must register again.
    pub async fn send_node_heartbeat(
        &self,
        node_id: NodeId,
        heartbeat_interval: f64,
    ) -> Result<bool, FleetError> {
        self.blocking(move |inner, now| {
            let interval = inner.registry.normalize_interval(heartbeat_interval)?;
            inner
                .store
                .write(|tx| inner.registry.heartbeat(tx, node_id, interval, now))
        })
        .await
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Returns committed messages addressed to the caller with their trees.
    pub async fn pull_messages(
        &self,
        caller: Caller,
        message_ids: Vec<MessageId>,
    ) -> Result<PullMessagesResponse, FleetError> {
        let reconnect = self.inner.load.advisory();
        let (messages, message_object_trees) = self
            .blocking(move |inner, now| {
                inner.store.write(|tx| {
                    inner.ensure_caller(tx, caller, now)?;
                    let pulled = inner
                        .queue
                        .pull(tx, caller.node_id(), &message_ids, now)?;

                    let mut messages = Vec::with_capacity(pulled.len());
                    let mut trees = Vec::with_capacity(pulled.len());
                    for stored in pulled {
                        let internal =
                            inner.queue.internal_objects(tx, stored.message.message_id)?;
                        let tree = inner.objects.load_tree(
                            tx,
                            stored.root_object_id,
                            &internal,
                            inner.settings.max_tree_depth,
                        )?;
                        messages.push(stored.message);
                        trees.push(tree);
                    }
                    Ok::<_, FleetError>((messages, trees))
                })
            })
            .await?;

        Ok(PullMessagesResponse {
            reconnect,
            messages,
            message_object_trees,
        })
    }

    /// Accepts or rejects each message independently.
    ///
    /// `objects_to_push` lists the leaves, across all accepted messages, that
    /// are not committed yet.
    pub async fn push_messages(
        &self,
        caller: Caller,
        messages: Vec<Message>,
        message_object_trees: Vec<ObjectTree>,
    ) -> Result<PushMessagesResponse, FleetError> {
        if messages.len() != message_object_trees.len() {
            return Err(FleetError::invalid(format!(
                "{} messages but {} object trees",
                messages.len(),
                message_object_trees.len()
            )));
        }

        let reconnect = self.inner.load.advisory();
        let (results, objects_to_push) = self
            .blocking(move |inner, now| {
                inner.store.write(|tx| {
                    inner.ensure_caller(tx, caller, now)?;

                    let mut results = std::collections::BTreeMap::new();
                    let mut missing = BTreeSet::new();
                    for (message, tree) in messages.iter().zip(&message_object_trees) {
                        let status = inner.push_one(tx, caller, message, tree, now, &mut missing)?;
                        if !status.is_accepted() {
                            warn!(
                                message_id = %message.message_id,
                                src_node_id = %message.src_node_id,
                                dst_node_id = %message.dst_node_id,
                                status = %status,
                                code = status.code(),
                                "Message rejected"
                            );
                        }
                        results.insert(message.message_id, status);
                    }
                    Ok::<_, FleetError>((results, missing.into_iter().collect::<Vec<_>>()))
                })
            })
            .await?;

        Ok(PushMessagesResponse {
            reconnect,
            results,
            objects_to_push,
        })
    }

    /// Acknowledges a message addressed to the caller.
    pub async fn confirm_message_received(
        &self,
        caller: Caller,
        message_id: MessageId,
    ) -> Result<(), FleetError> {
        self.blocking(move |inner, now| {
            inner.store.write(|tx| {
                inner.ensure_caller(tx, caller, now)?;
                inner
                    .queue
                    .confirm(tx, &inner.objects, caller.node_id(), message_id, now)
            })
        })
        .await
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Finished runs stay readable so nodes can learn that a run ended.
    pub async fn get_run(&self, caller: Caller, run_id: RunId) -> Result<Run, FleetError> {
        self.blocking(move |inner, now| {
            inner.store.read(|conn| {
                inner.ensure_caller(conn, caller, now)?;
                inner.runs.get_run(conn, run_id)
            })
        })
        .await
    }

    pub async fn get_fab(&self, caller: Caller, run_id: RunId) -> Result<BundleRef, FleetError> {
        self.blocking(move |inner, now| {
            inner.store.read(|conn| {
                inner.ensure_caller(conn, caller, now)?;
                inner.ensure_run_open(conn, caller, run_id)?;
                inner.runs.get_fab(conn, run_id)
            })
        })
        .await
    }

    pub async fn create_run(&self, req: CreateRunRequest) -> Result<Run, FleetError> {
        self.blocking(move |inner, now| {
            inner
                .store
                .write(|tx| inner.runs.create_run(tx, &req, now))
        })
        .await
    }

    pub async fn list_runs(&self) -> Result<Vec<Run>, FleetError> {
        self.blocking(|inner, _| inner.store.read(|conn| inner.runs.list_runs(conn)))
            .await
    }

    pub async fn update_run_status(
        &self,
        run_id: RunId,
        req: UpdateRunStatusRequest,
    ) -> Result<Run, FleetError> {
        self.blocking(move |inner, now| {
            inner
                .store
                .write(|tx| inner.runs.update_status(tx, run_id, &req, now))
        })
        .await
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Applies one upload chunk. `run_id` scopes node uploads to an open run.
    pub async fn push_object(
        &self,
        caller: Caller,
        run_id: Option<RunId>,
        chunk: ObjectChunk,
    ) -> Result<PushObjectResponse, FleetError> {
        let object_id = chunk.object_id;
        let outcome = self
            .blocking(move |inner, now| {
                inner.store.write(|tx| {
                    inner.ensure_caller(tx, caller, now)?;
                    inner.ensure_object_scope(tx, caller, run_id)?;
                    inner.objects.push_chunk(tx, &chunk, now)
                })
            })
            .await?;

        match outcome {
            ChunkOutcome::Stored {
                state,
                received_bytes,
            } => Ok(PushObjectResponse {
                state,
                received_bytes,
            }),
            // Reported only after the discard is committed.
            ChunkOutcome::Discarded { reason } => {
                warn!(object_id = %object_id, caller = ?caller, reason = %reason, "Object upload discarded");
                Err(FleetError::Integrity(reason))
            }
        }
    }

    pub async fn pull_object(
        &self,
        caller: Caller,
        run_id: Option<RunId>,
        range: ObjectRange,
    ) -> Result<PullObjectResponse, FleetError> {
        self.blocking(move |inner, now| {
            inner.store.read(|conn| {
                inner.ensure_caller(conn, caller, now)?;
                inner.ensure_object_scope(conn, caller, run_id)?;
                inner.objects.pull_range(conn, &range)
            })
        })
        .await
    }

    pub async fn object_info(&self, object_id: ObjectId) -> Result<ObjectInfo, FleetError> {
        self.blocking(move |inner, _| {
            inner
                .store
                .read(|conn| inner.objects.get_meta(conn, object_id))?
                .ok_or_else(|| FleetError::not_found(format!("object {object_id}")))
        })
        .await
    }

    // =========================================================================
    // Administration
    // =========================================================================

    pub async fn list_nodes(&self) -> Result<Vec<NodeInfo>, FleetError> {
        self.blocking(|inner, _| inner.store.read(|conn| inner.registry.list_nodes(conn)))
            .await
    }

    /// Evicts expired nodes, drops expired messages and reclaims storage.
    pub async fn sweep(&self) -> Result<SweepReport, FleetError> {
        self.blocking(|inner, now| {
            inner.store.write(|tx| {
                let evicted = inner.registry.evict_expired(tx, now)?;
                let expired = inner.queue.expire(tx, &inner.objects, now)?;
                let purged = inner.queue.purge_acknowledged(tx)?;
                let reclaimed = inner.objects.reclaim_abandoned(tx, now)?;
                let collected = inner.objects.collect_garbage(tx, now)?;
                Ok::<_, FleetError>(SweepReport {
                    evicted_nodes: evicted.len(),
                    expired_messages: expired.len(),
                    purged_messages: purged,
                    reclaimed_objects: reclaimed.len(),
                    collected_objects: collected.len(),
                })
            })
        })
        .await
    }

    pub async fn health_check(&self) -> Result<(), FleetError> {
        self.blocking(|inner, _| Ok(inner.store.health_check()?))
            .await
    }

    /// Flushes the store. Call once after the listeners have stopped.
    pub async fn shutdown(&self) -> Result<(), FleetError> {
        self.blocking(|inner, _| {
            inner.store.close()?;
            info!("Coordinator store flushed");
            Ok(())
        })
        .await
    }
}

impl Inner {
    fn ensure_caller(
        &self,
        conn: &Connection,
        caller: Caller,
        now: DateTime<Utc>,
    ) -> Result<(), FleetError> {
        match caller {
            Caller::Node(node_id) => self.registry.ensure_active(conn, node_id, now),
            Caller::Admin => Ok(()),
        }
    }

    fn ensure_run_open(
        &self,
        conn: &Connection,
        caller: Caller,
        run_id: RunId,
    ) -> Result<(), FleetError> {
        if caller == Caller::Admin {
            return Ok(());
        }
        match self.runs.authorize(conn, run_id)? {
            RunAccess::Allowed => Ok(()),
            RunAccess::Unknown => Err(FleetError::not_found(format!("run {run_id}"))),
            RunAccess::Finished => Err(FleetError::PermissionDenied(format!(
                "run {run_id} is finished"
            ))),
        }
    }

    fn ensure_object_scope(
        &self,
        conn: &Connection,
        caller: Caller,
        run_id: Option<RunId>,
    ) -> Result<(), FleetError> {
        match (caller, run_id) {
            (Caller::Admin, _) => Ok(()),
            (Caller::Node(_), Some(run_id)) => self.ensure_run_open(conn, caller, run_id),
            (Caller::Node(_), None) => Err(FleetError::invalid("run_id is required")),
        }
    }

    fn destination_known(
        &self,
        conn: &Connection,
        caller: Caller,
        dst: NodeId,
        now: DateTime<Utc>,
    ) -> Result<bool, FleetError> {
        if dst.is_coordinator() {
            return Ok(caller != Caller::Admin);
        }
        self.registry.is_registered(conn, dst, now)
    }

    /// Validates and stores one message, adding its uncommitted leaves to `missing`.
    fn push_one(
        &self,
        conn: &Connection,
        caller: Caller,
        message: &Message,
        tree: &ObjectTree,
        now: DateTime<Utc>,
        missing: &mut BTreeSet<ObjectId>,
    ) -> Result<PushStatus, FleetError> {
        if message.src_node_id != caller.node_id() {
            return Ok(PushStatus::RejectedSourceMismatch);
        }
        if message.message_type.trim().is_empty() {
            return Ok(PushStatus::RejectedMalformed);
        }
        let Some(ttl) = self.queue.resolve_ttl(message.ttl) else {
            return Ok(PushStatus::RejectedMalformed);
        };

        let limits = TreeLimits {
            max_nodes: self.settings.max_tree_nodes,
            max_depth: self.settings.max_tree_depth,
        };
        let flat = match FlatTree::from_tree(tree, &limits) {
            Ok(flat) => flat,
            Err(e) => {
                debug!(message_id = %message.message_id, error = %e, "Malformed object tree");
                return Ok(PushStatus::RejectedMalformed);
            }
        };

        match self.runs.authorize(conn, message.run_id)? {
            RunAccess::Allowed => {}
            RunAccess::Unknown => return Ok(PushStatus::RejectedUnknownRun),
            RunAccess::Finished => return Ok(PushStatus::RejectedRunFinished),
        }

        if !self.destination_known(conn, caller, message.dst_node_id, now)? {
            return Ok(PushStatus::RejectedUnknownDestination);
        }

        let root = flat.root().object_id;
        if let Some(stored) = self.queue.get(conn, message.message_id)? {
            if !stored.same_content(message, ttl, root) {
                return Ok(PushStatus::RejectedDuplicate);
            }
            // Identical retry: report what is still missing, store nothing.
            // An acknowledged message holds no references, so nothing is needed.
            if stored.acknowledged_at.is_none() {
                self.collect_missing(conn, &flat, now, missing)?;
            }
            return Ok(PushStatus::Accepted);
        }

        for (object_id, content) in flat.internal_nodes() {
            self.objects.put_tree_node(conn, object_id, &content, now)?;
        }
        self.collect_missing(conn, &flat, now, missing)?;
        self.queue
            .push(conn, &self.objects, message, ttl, &flat, now)?;
        Ok(PushStatus::Accepted)
    }

    fn collect_missing(
        &self,
        conn: &Connection,
        flat: &FlatTree,
        now: DateTime<Utc>,
        missing: &mut BTreeSet<ObjectId>,
    ) -> Result<(), FleetError> {
        for leaf in flat.leaves() {
            if self.objects.preregister_leaf(conn, leaf, now)? != ObjectState::Committed {
                missing.insert(leaf);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use fleet_proto::{encode_children, ObjectTreeEntry, RunStatus};
    use std::time::Duration;

    struct Harness {
        coordinator: Coordinator,
        clock: Arc<ManualClock>,
        run_id: RunId,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let coordinator = Coordinator::new(
            Store::open_in_memory().unwrap(),
            clock.clone(),
            FleetSettings::default(),
        );
        let run = coordinator
            .create_run(CreateRunRequest {
                fab_id: "acme/mnist".to_string(),
                fab_version: "1.0.0".to_string(),
                fab_hash: "f00d".to_string(),
                bundle_uri: "s3://bundles/mnist.fab".to_string(),
                run_config: Default::default(),
            })
            .await
            .unwrap();
        Harness {
            coordinator,
            clock,
            run_id: run.run_id,
        }
    }

    fn message(run_id: RunId, src: NodeId, dst: NodeId) -> Message {
        Message {
            message_id: MessageId::new(),
            run_id,
            src_node_id: src,
            dst_node_id: dst,
            message_type: "train".to_string(),
            reply_to_message_id: None,
            group_id: None,
            created_at: None,
            ttl: None,
        }
    }

    fn chunk(content: &[u8], is_final: bool) -> ObjectChunk {
        ObjectChunk {
            object_id: ObjectId::from_content(b"0123456789"),
            content: content.to_vec(),
            offset: None,
            total_size: None,
            is_final,
        }
    }

    impl Harness {
        async fn admin_push(&self, message: Message, tree: ObjectTree) -> PushMessagesResponse {
            self.coordinator
                .push_messages(Caller::Admin, vec![message], vec![tree])
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_end_to_end_delivery() {
        let h = harness().await;
        let c = &h.coordinator;
        let node = c.create_node(5.0).await.unwrap();
        let a = Caller::Node(node.node_id);

        let o1 = ObjectId::from_content(b"0123456789");
        let m1 = message(h.run_id, NodeId::COORDINATOR, node.node_id);
        let pushed = h.admin_push(m1.clone(), ObjectTree::leaf(o1)).await;
        assert_eq!(pushed.results[&m1.message_id], PushStatus::Accepted);
        assert_eq!(pushed.objects_to_push, vec![o1]);
        assert!(pushed.reconnect.is_none());

        assert!(c.pull_messages(a, vec![]).await.unwrap().messages.is_empty());

        let first = c
            .push_object(Caller::Admin, None, chunk(b"01234", false))
            .await
            .unwrap();
        assert_eq!(first.state, ObjectState::Reserved);
        let second = c
            .push_object(Caller::Admin, None, chunk(b"56789", true))
            .await
            .unwrap();
        assert_eq!(second.state, ObjectState::Committed);

        let pulled = c.pull_messages(a, vec![]).await.unwrap();
        assert_eq!(pulled.messages.len(), 1);
        assert_eq!(pulled.messages[0].message_id, m1.message_id);
        assert_eq!(pulled.message_object_trees[0], ObjectTree::leaf(o1));

        let again = c.pull_messages(a, vec![]).await.unwrap();
        assert_eq!(again.messages, pulled.messages);

        let bytes = c
            .pull_object(
                a,
                Some(h.run_id),
                ObjectRange {
                    object_id: o1,
                    offset: 0,
                    length: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(bytes.content, b"0123456789");
        assert!(bytes.is_final);

        c.confirm_message_received(a, m1.message_id).await.unwrap();
        assert!(c.pull_messages(a, vec![]).await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_silent_node_expires() {
        let h = harness().await;
        let c = &h.coordinator;
        let node = c.create_node(5.0).await.unwrap();

        h.clock.advance(Duration::from_secs(11));
        let m = message(h.run_id, node.node_id, NodeId::COORDINATOR);
        let err = c
            .push_messages(
                Caller::Node(node.node_id),
                vec![m],
                vec![ObjectTree::leaf(ObjectId::from_content(b"x"))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NodeExpired(id) if id == node.node_id));

        assert!(!c.send_node_heartbeat(node.node_id, 5.0).await.unwrap());
        assert!(!c.send_node_heartbeat(node.node_id, 5.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_extends_deadline() {
        let h = harness().await;
        let c = &h.coordinator;
        let node = c.create_node(5.0).await.unwrap();

        for _ in 0..5 {
            h.clock.advance(Duration::from_secs(8));
            assert!(c.send_node_heartbeat(node.node_id, 5.0).await.unwrap());
        }
        c.get_run(Caller::Node(node.node_id), h.run_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_per_message_statuses() {
        let h = harness().await;
        let c = &h.coordinator;
        let node = c.create_node(5.0).await.unwrap();
        let caller = Caller::Node(node.node_id);
        let leaf = ObjectTree::leaf(ObjectId::from_content(b"result"));

        let ok = message(h.run_id, node.node_id, NodeId::COORDINATOR);
        let spoofed = message(h.run_id, NodeId::new(99).unwrap(), NodeId::COORDINATOR);
        let unknown_dst = message(h.run_id, node.node_id, NodeId::new(99).unwrap());
        let unknown_run = message(RunId::new(12345).unwrap(), node.node_id, NodeId::COORDINATOR);
        let mut bad_ttl = message(h.run_id, node.node_id, NodeId::COORDINATOR);
        bad_ttl.ttl = Some(-1.0);
        let mut no_type = message(h.run_id, node.node_id, NodeId::COORDINATOR);
        no_type.message_type = String::new();

        let batch = vec![
            ok.clone(),
            spoofed.clone(),
            unknown_dst.clone(),
            unknown_run.clone(),
            bad_ttl.clone(),
            no_type.clone(),
        ];
        let trees = vec![leaf.clone(); batch.len()];
        let resp = c.push_messages(caller, batch, trees).await.unwrap();

        assert_eq!(resp.results[&ok.message_id], PushStatus::Accepted);
        assert_eq!(
            resp.results[&spoofed.message_id],
            PushStatus::RejectedSourceMismatch
        );
        assert_eq!(
            resp.results[&unknown_dst.message_id],
            PushStatus::RejectedUnknownDestination
        );
        assert_eq!(
            resp.results[&unknown_run.message_id],
            PushStatus::RejectedUnknownRun
        );
        assert_eq!(
            resp.results[&bad_ttl.message_id],
            PushStatus::RejectedMalformed
        );
        assert_eq!(
            resp.results[&no_type.message_id],
            PushStatus::RejectedMalformed
        );
        assert_eq!(resp.objects_to_push, vec![ObjectId::from_content(b"result")]);
    }

    #[tokio::test]
    async fn test_retry_is_accepted_and_conflict_is_duplicate() {
        let h = harness().await;
        let c = &h.coordinator;
        let node = c.create_node(5.0).await.unwrap();
        let leaf = ObjectTree::leaf(ObjectId::from_content(b"payload"));

        let m = message(h.run_id, NodeId::COORDINATOR, node.node_id);
        h.admin_push(m.clone(), leaf.clone()).await;
        let retry = h.admin_push(m.clone(), leaf.clone()).await;
        assert_eq!(retry.results[&m.message_id], PushStatus::Accepted);
        assert_eq!(retry.objects_to_push, vec![ObjectId::from_content(b"payload")]);

        let mut conflicting = m.clone();
        conflicting.message_type = "evaluate".to_string();
        let resp = h.admin_push(conflicting, leaf).await;
        assert_eq!(resp.results[&m.message_id], PushStatus::RejectedDuplicate);
    }

    #[tokio::test]
    async fn test_admin_cannot_address_itself() {
        let h = harness().await;
        let m = message(h.run_id, NodeId::COORDINATOR, NodeId::COORDINATOR);
        let resp = h
            .admin_push(m.clone(), ObjectTree::leaf(ObjectId::from_content(b"x")))
            .await;
        assert_eq!(
            resp.results[&m.message_id],
            PushStatus::RejectedUnknownDestination
        );
    }

    #[tokio::test]
    async fn test_nested_tree_lists_only_leaves() {
        let h = harness().await;
        let c = &h.coordinator;
        let node = c.create_node(5.0).await.unwrap();

        let weights = ObjectId::from_content(b"weights");
        let config = ObjectId::from_content(b"config");
        let tree = ObjectTree::node(vec![
            ObjectTreeEntry::new("weights", ObjectTree::leaf(weights)),
            ObjectTreeEntry::new(
                "meta",
                ObjectTree::node(vec![ObjectTreeEntry::new(
                    "config",
                    ObjectTree::leaf(config),
                )]),
            ),
        ]);
        let m = message(h.run_id, NodeId::COORDINATOR, node.node_id);
        let resp = h.admin_push(m.clone(), tree.clone()).await;

        let expected: Vec<ObjectId> = BTreeSet::from([weights, config]).into_iter().collect();
        assert_eq!(resp.objects_to_push, expected);

        for content in [&b"weights"[..], &b"config"[..]] {
            c.push_object(
                Caller::Admin,
                None,
                ObjectChunk {
                    object_id: ObjectId::from_content(content),
                    content: content.to_vec(),
                    offset: None,
                    total_size: None,
                    is_final: true,
                },
            )
            .await
            .unwrap();
        }

        let pulled = c
            .pull_messages(Caller::Node(node.node_id), vec![m.message_id])
            .await
            .unwrap();
        assert_eq!(pulled.message_object_trees, vec![tree]);
    }

    fn whole(content: &[u8]) -> ObjectChunk {
        ObjectChunk {
            object_id: ObjectId::from_content(content),
            content: content.to_vec(),
            offset: None,
            total_size: None,
            is_final: true,
        }
    }

    /// A one-entry directory and its canonical encoding.
    fn weights_dir() -> (ObjectTree, Vec<u8>) {
        let weights = ObjectId::from_content(b"weights");
        let tree = ObjectTree::node(vec![ObjectTreeEntry::new(
            "weights",
            ObjectTree::leaf(weights),
        )]);
        let encoding = encode_children(&[("weights", weights)]);
        assert_eq!(tree.object_id, ObjectId::from_content(&encoding));
        (tree, encoding)
    }

    #[tokio::test]
    async fn test_blob_upload_does_not_flatten_a_later_tree() {
        let h = harness().await;
        let c = &h.coordinator;
        let a = c.create_node(5.0).await.unwrap();
        let b = c.create_node(5.0).await.unwrap();
        let (tree, encoding) = weights_dir();

        // Node A sends the encoding bytes as an ordinary blob first.
        let report = message(h.run_id, a.node_id, NodeId::COORDINATOR);
        let resp = c
            .push_messages(
                Caller::Node(a.node_id),
                vec![report.clone()],
                vec![ObjectTree::leaf(tree.object_id)],
            )
            .await
            .unwrap();
        assert_eq!(resp.objects_to_push, vec![tree.object_id]);
        c.push_object(Caller::Node(a.node_id), Some(h.run_id), whole(&encoding))
            .await
            .unwrap();

        let task = message(h.run_id, NodeId::COORDINATOR, b.node_id);
        let resp = h.admin_push(task.clone(), tree.clone()).await;
        assert_eq!(resp.objects_to_push, vec![ObjectId::from_content(b"weights")]);
        c.push_object(Caller::Admin, None, whole(b"weights"))
            .await
            .unwrap();

        let pulled = c
            .pull_messages(Caller::Node(b.node_id), vec![task.message_id])
            .await
            .unwrap();
        assert_eq!(pulled.message_object_trees, vec![tree.clone()]);

        // A's message still carries the same bytes as a leaf.
        let inbox = c
            .pull_messages(Caller::Admin, vec![report.message_id])
            .await
            .unwrap();
        assert_eq!(
            inbox.message_object_trees,
            vec![ObjectTree::leaf(tree.object_id)]
        );
    }

    #[tokio::test]
    async fn test_stored_tree_node_is_not_expanded_as_a_leaf() {
        let h = harness().await;
        let c = &h.coordinator;
        let node = c.create_node(5.0).await.unwrap();
        let (tree, _) = weights_dir();

        let task = message(h.run_id, NodeId::COORDINATOR, node.node_id);
        h.admin_push(task, tree.clone()).await;

        // The tree node is already committed, so nothing is left to upload.
        let report = message(h.run_id, node.node_id, NodeId::COORDINATOR);
        let resp = c
            .push_messages(
                Caller::Node(node.node_id),
                vec![report.clone()],
                vec![ObjectTree::leaf(tree.object_id)],
            )
            .await
            .unwrap();
        assert_eq!(resp.results[&report.message_id], PushStatus::Accepted);
        assert!(resp.objects_to_push.is_empty());

        let inbox = c
            .pull_messages(Caller::Admin, vec![report.message_id])
            .await
            .unwrap();
        assert_eq!(
            inbox.message_object_trees,
            vec![ObjectTree::leaf(tree.object_id)]
        );
    }

    #[tokio::test]
    async fn test_retry_after_confirmation_requests_nothing() {
        let h = harness().await;
        let c = &h.coordinator;
        let node = c.create_node(5.0).await.unwrap();
        let caller = Caller::Node(node.node_id);
        let leaf = ObjectTree::leaf(ObjectId::from_content(b"payload"));

        let m = message(h.run_id, NodeId::COORDINATOR, node.node_id);
        h.admin_push(m.clone(), leaf.clone()).await;
        c.push_object(Caller::Admin, None, whole(b"payload"))
            .await
            .unwrap();
        c.pull_messages(caller, vec![]).await.unwrap();
        c.confirm_message_received(caller, m.message_id)
            .await
            .unwrap();

        let retry = h.admin_push(m.clone(), leaf).await;
        assert_eq!(retry.results[&m.message_id], PushStatus::Accepted);
        assert!(retry.objects_to_push.is_empty());

        let info = c
            .object_info(ObjectId::from_content(b"payload"))
            .await
            .unwrap();
        assert_eq!(info.ref_count, 0);
    }

    #[tokio::test]
    async fn test_integrity_failure_discards_upload() {
        let h = harness().await;
        let c = &h.coordinator;
        let node = c.create_node(5.0).await.unwrap();
        let caller = Caller::Node(node.node_id);

        let err = c
            .push_object(caller, Some(h.run_id), chunk(b"9876543210", true))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Integrity(_)));

        let err = c
            .pull_object(
                caller,
                Some(h.run_id),
                ObjectRange {
                    object_id: ObjectId::from_content(b"0123456789"),
                    offset: 0,
                    length: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_finished_run_blocks_objects_but_not_get_run() {
        let h = harness().await;
        let c = &h.coordinator;
        let node = c.create_node(5.0).await.unwrap();
        let caller = Caller::Node(node.node_id);

        c.update_run_status(
            h.run_id,
            UpdateRunStatusRequest {
                status: RunStatus::Finished,
                sub_status: Some("completed".to_string()),
                details: None,
            },
        )
        .await
        .unwrap();

        let run = c.get_run(caller, h.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Finished);

        let err = c.get_fab(caller, h.run_id).await.unwrap_err();
        assert!(matches!(err, FleetError::PermissionDenied(_)));
        let err = c
            .push_object(caller, Some(h.run_id), chunk(b"01234", false))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_sweep_reclaims_everything_eventually() {
        let h = harness().await;
        let c = &h.coordinator;
        let node = c.create_node(5.0).await.unwrap();

        let mut m = message(h.run_id, NodeId::COORDINATOR, node.node_id);
        m.ttl = Some(30.0);
        h.admin_push(m, ObjectTree::leaf(ObjectId::from_content(b"0123456789")))
            .await;
        c.push_object(Caller::Admin, None, chunk(b"0123456789", true))
            .await
            .unwrap();

        h.clock.advance(Duration::from_secs(31));
        let report = c.sweep().await.unwrap();
        assert_eq!(report.evicted_nodes, 1);
        assert_eq!(report.expired_messages, 1);

        h.clock.advance(Duration::from_secs(61));
        let report = c.sweep().await.unwrap();
        assert_eq!(report.collected_objects, 1);

        assert!(c.sweep().await.unwrap().is_empty());
        assert!(c.list_nodes().await.unwrap().is_empty());
    }
}
