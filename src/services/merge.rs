//! Last-write-wins merge of node and edge mutations into a document snapshot.
//!
//! Each entity id carries the timestamp of the last accepted write. An incoming
//! change older than that is dropped; an equal timestamp is accepted.
//!
//! Nodes and edges merge differently: a node update replaces the
//! node content, an edge update only advances the edge's timestamp.

use crate::models::{DocumentSnapshot, EdgeChangeType, FlowEdge, FlowNode, NodeChangeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// Older than the last accepted write; snapshot untouched
    Stale,
}

impl MergeOutcome {
    pub fn is_applied(self) -> bool {
        self == MergeOutcome::Applied
    }
}

pub fn apply_node_change(
    snapshot: &mut DocumentSnapshot,
    change: NodeChangeType,
    node: &FlowNode,
    event_ts: i64,
) -> MergeOutcome {
    let existing_ts = snapshot.node_timestamps.get(&node.id).copied().unwrap_or(0);
    if event_ts < existing_ts {
        return MergeOutcome::Stale;
    }

    match change {
        NodeChangeType::Add => {
            for other in snapshot.nodes.iter_mut() {
                other.selected = Some(false);
            }
            let mut added = node.clone();
            added.selected = Some(true);
            snapshot.nodes.push(added);
            snapshot.node_timestamps.insert(node.id.clone(), event_ts);
        }
        NodeChangeType::Remove => {
            snapshot.nodes.retain(|n| n.id != node.id);
            snapshot.node_timestamps.remove(&node.id);
        }
        NodeChangeType::Update
        | NodeChangeType::Position
        | NodeChangeType::Dimensions
        | NodeChangeType::Select
        | NodeChangeType::Other => {
            for current in snapshot.nodes.iter_mut() {
                if current.id == node.id {
                    *current = node.clone();
                    current.selected = Some(true);
                } else {
                    current.selected = Some(false);
                }
            }
            snapshot.node_timestamps.insert(node.id.clone(), event_ts);
        }
    }

    MergeOutcome::Applied
}

pub fn apply_edge_change(
    snapshot: &mut DocumentSnapshot,
    change: EdgeChangeType,
    edge: &FlowEdge,
    event_ts: i64,
) -> MergeOutcome {
    let existing_ts = snapshot.edge_timestamps.get(&edge.id).copied().unwrap_or(0);
    if event_ts < existing_ts {
        return MergeOutcome::Stale;
    }

    match change {
        EdgeChangeType::Add => {
            snapshot.edges.push(edge.clone());
            snapshot.edge_timestamps.insert(edge.id.clone(), event_ts);
        }
        EdgeChangeType::Remove => {
            snapshot.edges.retain(|e| e.id != edge.id);
            snapshot.edge_timestamps.remove(&edge.id);
        }
        // Content stays as is, only the clock moves
        EdgeChangeType::Update | EdgeChangeType::Buttonedge | EdgeChangeType::Other => {
            snapshot.edge_timestamps.insert(edge.id.clone(), event_ts);
        }
    }

    MergeOutcome::Applied
}
