//! Wire schema for the fleet API.
//!
//! Every request/response pair served by the coordinator is defined here as a
//! plain serde type so that the coordinator and node agents agree on one
//! schema. Bodies are JSON; binary object content travels as base64.

pub mod bytes;
pub mod fleet;
pub mod tree;

pub use fleet::*;
pub use tree::{
    decode_children, encode_children, FlatNode, FlatTree, ObjectTree, ObjectTreeEntry, TreeError,
    TreeLimits,
};
