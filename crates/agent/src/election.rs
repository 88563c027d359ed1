//! Deterministic leader election over observed peers.
//!
//! There is no vote exchange: every participant observes the same candidate
//! set (given a stable network snapshot) and applies the same total order, so
//! all of them converge on the same leader independently. The order is
//! (creation time ascending, IP ascending) — the oldest node wins, and the
//! bytewise-lowest address breaks exact timestamp ties.

use crate::discovery::Node;

/// Outcome of a leader election.
#[derive(Debug, Clone)]
pub struct ElectionResult {
    /// The elected leader.
    pub leader: Node,
    /// True when the local node is the elected leader.
    pub is_leader: bool,
    /// All participating control plane nodes, in election order.
    pub candidates: Vec<Node>,
}

/// Elect a leader among the local node and its control plane peers.
///
/// The local node always participates regardless of its role flag; callers
/// gate on the role oracle before running the election at all. Worker peers
/// are excluded.
pub fn elect_leader(local: &Node, peers: &[Node]) -> ElectionResult {
    let mut candidates = Vec::with_capacity(peers.len() + 1);
    candidates.push(local.clone());
    candidates.extend(peers.iter().filter(|p| p.is_control_plane).cloned());

    candidates.sort_by(|a, b| {
        a.creation_time.cmp(&b.creation_time).then_with(|| a.ip.cmp(&b.ip))
    });

    let leader = candidates[0].clone();
    let is_leader = leader.ip == local.ip;

    ElectionResult { leader, is_leader, candidates }
}

/// Whether enough control plane nodes are present for the election to
/// proceed. A count equal to `min_nodes` reaches quorum. Worker nodes are
/// ignored.
pub fn quorum_reached(nodes: &[Node], min_nodes: usize) -> bool {
    nodes.iter().filter(|n| n.is_control_plane).count() >= min_nodes
}
