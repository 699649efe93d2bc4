use crate::node::types::{NodeType, StorageNode};

/// Static distance metric of a storage node, used to rank download
/// candidates. Lower values are preferred.
pub fn distance_metric(node: &StorageNode) -> u32 {
    match node.node_type {
        NodeType::Cloudlet => 1,
        NodeType::Gateway => 2,
        NodeType::CoreNet => 3,
        NodeType::Cloud => 4,
        _ => 4,
    }
}

/// Sorts nodes by ascending distance metric (nearest class first).
/// Equal-metric nodes keep their input order.
pub fn rank_by_distance_metric(mut nodes: Vec<StorageNode>) -> Vec<StorageNode> {
    nodes.sort_by_key(distance_metric);
    nodes
}
