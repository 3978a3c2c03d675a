//! Object trees and their canonical encoding.
//!
//! A message payload is described by an [`ObjectTree`]: leaves point at raw
//! bytes in the object store, internal nodes are pure structure. Internal
//! nodes are still content-addressed: their ID is the SHA-256 of
//!
//! ```text
//! fleet-tree/v1\n
//! <child_object_id> <child_name>\n
//! ...
//! ```
//!
//! with children in tree order. Both sides compute this the same way, so the
//! coordinator can verify a pushed tree without trusting the sender and can
//! store the structure itself as an ordinary object.
//!
//! [`FlatTree`] is the arena form used for validation: every distinct object
//! appears once and children are index lists.

use std::collections::{BTreeSet, HashMap};

use fleet_id::ObjectId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First line of every encoded tree node.
pub const TREE_HEADER: &[u8] = b"fleet-tree/v1\n";

/// Maximum length of a child name in bytes.
pub const MAX_NAME_BYTES: usize = 255;

/// Recursive description of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTree {
    /// Content address of this node.
    pub object_id: ObjectId,

    /// Named children. Empty for leaves.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ObjectTreeEntry>,
}

/// A named child of an internal tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTreeEntry {
    pub name: String,
    pub tree: ObjectTree,
}

/// Errors raised while validating or decoding a tree.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("tree has more than {max} nodes")]
    TooManyNodes { max: usize },

    #[error("tree is deeper than {max} levels")]
    TooDeep { max: usize },

    #[error("invalid child name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("duplicate child name {name:?}")]
    DuplicateName { name: String },

    #[error("tree node id mismatch: declared {declared}, computed {computed}")]
    IdMismatch {
        declared: ObjectId,
        computed: ObjectId,
    },

    #[error("directory {path:?} has no entries")]
    EmptyDirectory { path: String },

    #[error("object {0} is used both as a leaf and as a tree node")]
    KindConflict(ObjectId),

    #[error("malformed tree encoding: {0}")]
    Decode(String),
}

/// Size limits applied when validating a tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeLimits {
    /// Maximum number of node occurrences (shared subtrees count each time).
    pub max_nodes: usize,
    /// Maximum depth; a single leaf has depth 1.
    pub max_depth: usize,
}

impl Default for TreeLimits {
    fn default() -> Self {
        Self {
            max_nodes: 4096,
            max_depth: 32,
        }
    }
}

impl ObjectTree {
    /// A leaf pointing at raw content.
    #[must_use]
    pub fn leaf(object_id: ObjectId) -> Self {
        Self {
            object_id,
            children: Vec::new(),
        }
    }

    /// An internal node; its ID is derived from the children.
    #[must_use]
    pub fn node(children: Vec<ObjectTreeEntry>) -> Self {
        let listing: Vec<(&str, ObjectId)> = children
            .iter()
            .map(|entry| (entry.name.as_str(), entry.tree.object_id))
            .collect();
        let object_id = ObjectId::from_content(&encode_children(&listing));
        Self {
            object_id,
            children,
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// All nodes in pre-order.
    #[must_use]
    pub fn walk(&self) -> Vec<&ObjectTree> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(tree) = stack.pop() {
            out.push(tree);
            for entry in tree.children.iter().rev() {
                stack.push(&entry.tree);
            }
        }
        out
    }
}

impl ObjectTreeEntry {
    pub fn new(name: impl Into<String>, tree: ObjectTree) -> Self {
        Self {
            name: name.into(),
            tree,
        }
    }
}

/// Canonical encoding of an internal node's child listing.
#[must_use]
pub fn encode_children(children: &[(&str, ObjectId)]) -> Vec<u8> {
    let mut out = TREE_HEADER.to_vec();
    for (name, object_id) in children {
        out.extend_from_slice(object_id.to_hex().as_bytes());
        out.push(b' ');
        out.extend_from_slice(name.as_bytes());
        out.push(b'\n');
    }
    out
}

/// Inverse of [`encode_children`].
pub fn decode_children(content: &[u8]) -> Result<Vec<(String, ObjectId)>, TreeError> {
    let body = content
        .strip_prefix(TREE_HEADER)
        .ok_or_else(|| TreeError::Decode("missing header".to_string()))?;
    let body = std::str::from_utf8(body).map_err(|e| TreeError::Decode(e.to_string()))?;

    let mut children = Vec::new();
    if body.is_empty() {
        return Ok(children);
    }
    let Some(body) = body.strip_suffix('\n') else {
        return Err(TreeError::Decode("missing trailing newline".to_string()));
    };

    for line in body.split('\n') {
        let (id, name) = line
            .split_once(' ')
            .ok_or_else(|| TreeError::Decode(format!("malformed line {line:?}")))?;
        let object_id = ObjectId::parse(id).map_err(|e| TreeError::Decode(e.to_string()))?;
        children.push((name.to_string(), object_id));
    }

    Ok(children)
}

fn validate_name(name: &str) -> Result<(), TreeError> {
    let reason = if name.is_empty() {
        Some("name cannot be empty")
    } else if name.len() > MAX_NAME_BYTES {
        Some("name exceeds 255 bytes")
    } else if name.chars().any(char::is_control) {
        Some("name contains control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(TreeError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// One distinct object inside a [`FlatTree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatNode {
    pub object_id: ObjectId,
    /// `(name, index)` pairs into the arena. Empty for leaves.
    pub children: Vec<(String, usize)>,
}

impl FlatNode {
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Arena form of a validated tree. Index 0 is the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatTree {
    nodes: Vec<FlatNode>,
}

impl FlatTree {
    /// Validates `tree` and flattens it.
    ///
    /// Checks child names, size limits, and that every internal node's ID is
    /// the digest of its canonical encoding.
    pub fn from_tree(tree: &ObjectTree, limits: &TreeLimits) -> Result<Self, TreeError> {
        let mut builder = FlatBuilder {
            nodes: Vec::new(),
            index: HashMap::new(),
            visited: 0,
            limits,
        };
        builder.visit(tree, 1)?;
        Ok(Self {
            nodes: builder.nodes,
        })
    }

    #[must_use]
    pub fn root(&self) -> &FlatNode {
        &self.nodes[0]
    }

    #[must_use]
    pub fn nodes(&self) -> &[FlatNode] {
        &self.nodes
    }

    /// Distinct leaf IDs.
    #[must_use]
    pub fn leaves(&self) -> BTreeSet<ObjectId> {
        self.nodes
            .iter()
            .filter(|node| node.is_leaf())
            .map(|node| node.object_id)
            .collect()
    }

    /// Distinct internal nodes with their canonical encoding.
    #[must_use]
    pub fn internal_nodes(&self) -> Vec<(ObjectId, Vec<u8>)> {
        self.nodes
            .iter()
            .filter(|node| !node.is_leaf())
            .map(|node| (node.object_id, self.encode(node)))
            .collect()
    }

    /// Every distinct object ID reachable from the root.
    #[must_use]
    pub fn object_ids(&self) -> BTreeSet<ObjectId> {
        self.nodes.iter().map(|node| node.object_id).collect()
    }

    fn encode(&self, node: &FlatNode) -> Vec<u8> {
        let listing: Vec<(&str, ObjectId)> = node
            .children
            .iter()
            .map(|(name, idx)| (name.as_str(), self.nodes[*idx].object_id))
            .collect();
        encode_children(&listing)
    }
}

struct FlatBuilder<'a> {
    nodes: Vec<FlatNode>,
    index: HashMap<ObjectId, usize>,
    visited: usize,
    limits: &'a TreeLimits,
}

impl FlatBuilder<'_> {
    fn visit(&mut self, tree: &ObjectTree, depth: usize) -> Result<usize, TreeError> {
        self.visited += 1;
        if self.visited > self.limits.max_nodes {
            return Err(TreeError::TooManyNodes {
                max: self.limits.max_nodes,
            });
        }
        if depth > self.limits.max_depth {
            return Err(TreeError::TooDeep {
                max: self.limits.max_depth,
            });
        }

        if let Some(&existing) = self.index.get(&tree.object_id) {
            if self.nodes[existing].is_leaf() != tree.is_leaf() {
                return Err(TreeError::KindConflict(tree.object_id));
            }
        }

        // Reserve the slot before recursing so the root stays at index 0.
        let slot = match self.index.get(&tree.object_id) {
            Some(&existing) => existing,
            None => {
                self.nodes.push(FlatNode {
                    object_id: tree.object_id,
                    children: Vec::new(),
                });
                let slot = self.nodes.len() - 1;
                self.index.insert(tree.object_id, slot);
                slot
            }
        };

        if tree.is_leaf() {
            return Ok(slot);
        }

        let mut names = BTreeSet::new();
        let mut children = Vec::with_capacity(tree.children.len());
        for entry in &tree.children {
            validate_name(&entry.name)?;
            if !names.insert(entry.name.as_str()) {
                return Err(TreeError::DuplicateName {
                    name: entry.name.clone(),
                });
            }
            let child = self.visit(&entry.tree, depth + 1)?;
            children.push((entry.name.clone(), child));
        }

        let listing: Vec<(&str, ObjectId)> = children
            .iter()
            .map(|(name, idx)| (name.as_str(), self.nodes[*idx].object_id))
            .collect();
        let computed = ObjectId::from_content(&encode_children(&listing));
        if computed != tree.object_id {
            return Err(TreeError::IdMismatch {
                declared: tree.object_id,
                computed,
            });
        }

        self.nodes[slot].children = children;
        Ok(slot)
    }
}
