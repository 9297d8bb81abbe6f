//! Consensus type plumbing over `openraft`.

use openraft::{BasicNode, Entry, TokioRuntime};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// A raw, still-encoded command line, exactly as a client sent it.
/// The state machine decodes it on apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub data: Vec<u8>,
}

/// What the state machine hands back to the proposing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// The client's UDP reply port and the raw payload bytes; the leader
    /// routes it, followers discard it. Values are arbitrary bytes, so the
    /// payload is never re-encoded as text.
    Routed { port: String, payload: Vec<u8> },
    /// The entry did not decode as a command.
    Malformed(String),
    /// Blank or membership entry; nothing to route.
    None,
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = Proposal,
        R            = Reply,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type Raft = openraft::Raft<TypeConfig>;

/// Derive a stable u64 node id from the human-readable `--id` string.
pub fn node_id_from_str(s: &str) -> NodeId {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_ids_are_stable_and_distinct() {
        assert_eq!(node_id_from_str("node0"), node_id_from_str("node0"));
        assert_ne!(node_id_from_str("node0"), node_id_from_str("node1"));
    }
}
