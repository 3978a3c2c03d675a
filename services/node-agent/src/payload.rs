//! Message payloads and chunked object transfer.
//!
//! A payload is an [`ObjectTree`] plus the content of its leaves. Internal
//! nodes are derived from their children, so only leaves ever travel as
//! object bytes.

use std::collections::HashMap;

use fleet_id::{ObjectId, RunId};
use fleet_proto::{
    FlatTree, Node, ObjectChunk, ObjectRange, ObjectTree, ObjectTreeEntry, TreeError, TreeLimits,
};
use tracing::{debug, warn};

use crate::client::{ClientError, FleetClient};
use crate::retry::RetryPolicy;

/// Uploads restart from the first byte at most this many times after an
/// integrity rejection.
const MAX_UPLOAD_RESTARTS: u32 = 2;

/// A tree and the bytes of every leaf it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub tree: ObjectTree,
    objects: HashMap<ObjectId, Vec<u8>>,
}

impl Payload {
    /// A payload consisting of one leaf.
    pub fn single(content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        let object_id = ObjectId::from_content(&content);
        Self {
            tree: ObjectTree::leaf(object_id),
            objects: HashMap::from([(object_id, content)]),
        }
    }

    /// Content of a leaf, if it belongs to this payload.
    pub fn object(&self, object_id: &ObjectId) -> Option<&[u8]> {
        self.objects.get(object_id).map(Vec::as_slice)
    }

    /// Content of the root when the payload is a single leaf.
    pub fn content(&self) -> Option<&[u8]> {
        if self.tree.is_leaf() {
            self.object(&self.tree.object_id)
        } else {
            None
        }
    }

    /// Content of a top-level named leaf.
    pub fn blob(&self, name: &str) -> Option<&[u8]> {
        self.tree
            .children
            .iter()
            .find(|entry| entry.name == name && entry.tree.is_leaf())
            .and_then(|entry| self.object(&entry.tree.object_id))
    }

    /// Number of distinct leaf objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

/// Builds a named payload tree.
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    entries: Vec<(String, Entry)>,
}

#[derive(Debug)]
enum Entry {
    Blob(Vec<u8>),
    Dir(PayloadBuilder),
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn blob(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.entries.push((name.into(), Entry::Blob(content.into())));
        self
    }

    #[must_use]
    pub fn dir(mut self, name: impl Into<String>, dir: PayloadBuilder) -> Self {
        self.entries.push((name.into(), Entry::Dir(dir)));
        self
    }

    /// Assembles the tree and checks it against the default limits.
    ///
    /// Empty directories are rejected: a node without children would be a
    /// leaf with no bytes behind it.
    pub fn build(self) -> Result<Payload, TreeError> {
        let mut objects = HashMap::new();
        let tree = self.assemble("/", &mut objects)?;
        FlatTree::from_tree(&tree, &TreeLimits::default())?;
        Ok(Payload { tree, objects })
    }

    fn assemble(
        self,
        path: &str,
        objects: &mut HashMap<ObjectId, Vec<u8>>,
    ) -> Result<ObjectTree, TreeError> {
        if self.entries.is_empty() {
            return Err(TreeError::EmptyDirectory {
                path: path.to_string(),
            });
        }

        let mut children = Vec::with_capacity(self.entries.len());
        for (name, entry) in self.entries {
            let tree = match entry {
                Entry::Blob(content) => {
                    let object_id = ObjectId::from_content(&content);
                    objects.insert(object_id, content);
                    ObjectTree::leaf(object_id)
                }
                Entry::Dir(dir) => dir.assemble(&format!("{path}{name}/"), objects)?,
            };
            children.push(ObjectTreeEntry::new(name, tree));
        }
        Ok(ObjectTree::node(children))
    }
}

/// Uploads the objects the coordinator asked for.
///
/// Objects are sent in chunks of at most `chunk_bytes` with explicit offsets
/// and a declared size, so a repeated chunk is harmless.
pub async fn push_payload(
    client: &FleetClient,
    retry: &RetryPolicy,
    node: Node,
    run_id: RunId,
    payload: &Payload,
    objects_to_push: &[ObjectId],
    chunk_bytes: usize,
) -> Result<(), ClientError> {
    for object_id in objects_to_push {
        let content = payload.object(object_id).ok_or_else(|| {
            ClientError::InvalidArgument(format!("object {object_id} is not part of the payload"))
        })?;

        let mut restarts = 0;
        loop {
            match push_object(client, retry, node, run_id, *object_id, content, chunk_bytes).await {
                Ok(()) => break,
                Err(ClientError::Integrity(detail)) if restarts < MAX_UPLOAD_RESTARTS => {
                    restarts += 1;
                    warn!(%object_id, restarts, detail, "Upload rejected, restarting");
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

async fn push_object(
    client: &FleetClient,
    retry: &RetryPolicy,
    node: Node,
    run_id: RunId,
    object_id: ObjectId,
    content: &[u8],
    chunk_bytes: usize,
) -> Result<(), ClientError> {
    let total = content.len();
    let mut offset = 0usize;

    loop {
        let end = (offset + chunk_bytes.max(1)).min(total);
        let chunk = ObjectChunk {
            object_id,
            content: content[offset..end].to_vec(),
            offset: Some(offset as u64),
            total_size: Some(total as u64),
            is_final: end == total,
        };

        let resp = retry
            .run("push-object", || client.push_object(node, run_id, chunk.clone()))
            .await?;
        debug!(%object_id, received = resp.received_bytes, state = resp.state.as_str(), "Pushed chunk");

        if end == total {
            return Ok(());
        }
        offset = end;
    }
}

/// Downloads every leaf of `tree` and verifies each against its digest.
pub async fn pull_payload(
    client: &FleetClient,
    retry: &RetryPolicy,
    node: Node,
    run_id: RunId,
    tree: &ObjectTree,
) -> Result<Payload, ClientError> {
    let mut objects = HashMap::new();

    for leaf in tree.walk().into_iter().filter(|t| t.is_leaf()) {
        if objects.contains_key(&leaf.object_id) {
            continue;
        }
        let content = pull_object(client, retry, node, run_id, leaf.object_id).await?;
        objects.insert(leaf.object_id, content);
    }

    Ok(Payload {
        tree: tree.clone(),
        objects,
    })
}

async fn pull_object(
    client: &FleetClient,
    retry: &RetryPolicy,
    node: Node,
    run_id: RunId,
    object_id: ObjectId,
) -> Result<Vec<u8>, ClientError> {
    let mut content = Vec::new();

    loop {
        let range = ObjectRange {
            object_id,
            offset: content.len() as u64,
            length: None,
        };
        let resp = retry
            .run("pull-object", || client.pull_object(node, run_id, range.clone()))
            .await?;

        content.extend_from_slice(&resp.content);
        if resp.is_final || resp.content.is_empty() {
            break;
        }
    }

    if !object_id.matches(&content) {
        return Err(ClientError::Corrupt(object_id.to_string()));
    }
    Ok(content)
}
