use crate::context::geo::GeoPoint;
use crate::node::error::{NodeError, NodeResult};
use crate::node::store::NodeStore;
use crate::node::types::{NodeType, StorageNode};
use crate::transfer::transport::NodeTransport;
use crate::transfer::TransferError;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// How a node should be picked from a hierarchy level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Random,
    Nearest,
}

/// In-memory catalogue of known storage nodes, bucketed by type and backed
/// by the persistent node store.
///
/// Buckets keep insertion order so distance ties resolve to the node seen
/// first. All query methods return empty/absent results instead of errors;
/// callers treat absence as "try the next strategy".
pub struct NodeRegistry {
    buckets: RwLock<HashMap<NodeType, Vec<StorageNode>>>,
    store: NodeStore,
    transport: Arc<dyn NodeTransport>,
}

impl NodeRegistry {
    pub fn new(store: NodeStore, transport: Arc<dyn NodeTransport>) -> Self {
        let mut buckets = HashMap::new();
        for t in NodeType::ALL {
            buckets.insert(t, Vec::new());
        }
        Self {
            buckets: RwLock::new(buckets),
            store,
            transport,
        }
    }

    /// Rebuilds the in-memory buckets from the persistent store.
    pub async fn load_from_store(&self) -> NodeResult<()> {
        let nodes = self.store.list_all().await?;
        let mut buckets = self.buckets.write();
        for bucket in buckets.values_mut() {
            bucket.clear();
        }
        for node in nodes {
            buckets.entry(node.node_type).or_default().push(node);
        }
        Ok(())
    }

    /// Adds a storage node. If the id or type is unknown, the node is
    /// contacted first to resolve its identity; an unreachable node or a
    /// malformed reply keeps it out of the registry. A node whose resolved
    /// id is already known is updated in place.
    pub async fn add_node(&self, mut candidate: StorageNode) -> NodeResult<StorageNode> {
        if candidate.id.is_empty() || candidate.node_type == NodeType::Unknown {
            if candidate.address.is_empty() || candidate.port == 0 {
                return Err(NodeError::Invalid(
                    "node has neither an identity nor a contactable address".into(),
                ));
            }
            let identity = match self.transport.identify(&candidate).await {
                Ok(identity) => identity,
                Err(TransferError::MalformedReply(msg)) => {
                    return Err(NodeError::MalformedReply(msg))
                }
                Err(e) => return Err(NodeError::Unreachable(e.to_string())),
            };
            if identity.uuid.is_empty() {
                return Err(NodeError::MalformedReply("node replied without a uuid".into()));
            }
            candidate.id = identity.uuid;
            candidate.node_type = identity.node_type;
        }

        self.store.upsert(&candidate).await?;
        self.insert_in_memory(candidate.clone());
        tracing::debug!(node = %candidate.id, node_type = ?candidate.node_type, "node registered");
        Ok(candidate)
    }

    /// Upserts a node whose identity is already trusted (e.g. taken from the
    /// master registry's node list).
    pub async fn import_node(&self, node: StorageNode) -> NodeResult<()> {
        self.store.upsert(&node).await?;
        self.insert_in_memory(node);
        Ok(())
    }

    fn insert_in_memory(&self, node: StorageNode) {
        let mut buckets = self.buckets.write();
        // The resolved type may differ from an earlier sighting; drop any
        // stale entry with the same id before inserting.
        for bucket in buckets.values_mut() {
            bucket.retain(|n| n.id != node.id);
        }
        buckets.entry(node.node_type).or_default().push(node);
    }

    pub async fn delete_node(&self, id: &str) -> NodeResult<()> {
        self.store.delete(id).await?;
        let mut buckets = self.buckets.write();
        for bucket in buckets.values_mut() {
            bucket.retain(|n| n.id != id);
        }
        Ok(())
    }

    pub async fn clear(&self) -> NodeResult<()> {
        self.store.clear().await?;
        let mut buckets = self.buckets.write();
        for bucket in buckets.values_mut() {
            bucket.clear();
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<StorageNode> {
        let buckets = self.buckets.read();
        buckets
            .values()
            .flat_map(|b| b.iter())
            .find(|n| n.id == id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.buckets.read().values().map(|b| b.len()).sum()
    }

    pub fn all_nodes(&self) -> Vec<StorageNode> {
        self.buckets
            .read()
            .values()
            .flat_map(|b| b.iter().cloned())
            .collect()
    }

    pub fn nodes_of_type(&self, node_type: NodeType) -> Vec<StorageNode> {
        self.buckets
            .read()
            .get(&node_type)
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    pub fn nodes_of_types(&self, types: &[NodeType]) -> Vec<StorageNode> {
        let buckets = self.buckets.read();
        types
            .iter()
            .flat_map(|t| buckets.get(t).into_iter().flatten().cloned())
            .collect()
    }

    /// Nearest node of the given type; linear scan, first-seen wins ties.
    pub fn nearest_of_type(&self, node_type: NodeType, location: GeoPoint) -> Option<StorageNode> {
        let buckets = self.buckets.read();
        let mut best: Option<(&StorageNode, f64)> = None;
        for node in buckets.get(&node_type).into_iter().flatten() {
            let dist = node.distance_to(location);
            let closer = match best {
                Some((_, d)) => dist < d,
                None => true,
            };
            if closer {
                best = Some((node, dist));
            }
        }
        best.map(|(n, _)| n.clone())
    }

    /// The `n` closest nodes of the given type (or fewer when fewer exist).
    pub fn n_nearest_of_type(
        &self,
        node_type: NodeType,
        location: GeoPoint,
        n: usize,
    ) -> Vec<StorageNode> {
        let mut with_dist: Vec<(StorageNode, f64)> = self
            .nodes_of_type(node_type)
            .into_iter()
            .map(|node| {
                let d = node.distance_to(location);
                (node, d)
            })
            .collect();
        with_dist.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        with_dist.truncate(n);
        with_dist.into_iter().map(|(node, _)| node).collect()
    }

    /// Nearest node among several types. With `spread > 0`, the `spread`
    /// closest nodes of every type are pooled and one is picked at random,
    /// which avoids overloading a single node at crowded locations.
    pub fn nearest_of_types(
        &self,
        types: &[NodeType],
        location: GeoPoint,
        spread: usize,
    ) -> Option<StorageNode> {
        if spread == 0 {
            let mut best: Option<(StorageNode, f64)> = None;
            for t in types {
                if let Some(node) = self.nearest_of_type(*t, location) {
                    let dist = node.distance_to(location);
                    let closer = match &best {
                        Some((_, d)) => dist < *d,
                        None => true,
                    };
                    if closer {
                        best = Some((node, dist));
                    }
                }
            }
            return best.map(|(n, _)| n);
        }

        let mut pool = Vec::new();
        for t in types {
            pool.extend(self.n_nearest_of_type(*t, location, spread));
        }
        random_from(pool)
    }

    pub fn random_of_types(&self, types: &[NodeType]) -> Option<StorageNode> {
        random_from(self.nodes_of_types(types))
    }

    /// Uniform random pick among all known nodes regardless of type.
    pub fn random_node(&self) -> Option<StorageNode> {
        random_from(self.all_nodes())
    }

    /// Nodes of the given type matching bandwidth and radius constraints.
    /// A zero bandwidth threshold ignores that dimension; thresholds are
    /// inclusive. The radius window only applies when it is well-formed and
    /// a location is given.
    pub fn matching_bandwidth_and_radius(
        &self,
        node_type: NodeType,
        min_bw_up: u32,
        min_bw_down: u32,
        min_radius: f64,
        max_radius: f64,
        location: Option<GeoPoint>,
    ) -> Vec<StorageNode> {
        let found: Vec<StorageNode> = self
            .nodes_of_type(node_type)
            .into_iter()
            .filter(|n| {
                (min_bw_up == 0 || n.bandwidth_up >= min_bw_up)
                    && (min_bw_down == 0 || n.bandwidth_down >= min_bw_down)
            })
            .collect();

        match location {
            Some(loc) if min_radius >= 0.0 && max_radius > 0.0 && max_radius > min_radius => found
                .into_iter()
                .filter(|n| {
                    let d = n.distance_to(loc);
                    d >= min_radius && d <= max_radius
                })
                .collect(),
            _ => found,
        }
    }

    /// Bandwidth/radius-qualified nodes across every type.
    pub fn matching_bandwidth_and_radius_any_type(
        &self,
        min_bw_up: u32,
        min_bw_down: u32,
        min_radius: f64,
        max_radius: f64,
        location: Option<GeoPoint>,
    ) -> Vec<StorageNode> {
        NodeType::ALL
            .iter()
            .flat_map(|t| {
                self.matching_bandwidth_and_radius(
                    *t,
                    min_bw_up,
                    min_bw_down,
                    min_radius,
                    max_radius,
                    location,
                )
            })
            .collect()
    }

    /// Walks the type list in priority order and returns the first non-empty
    /// result. `Nearest` requires a location.
    pub fn follow_hierarchy(
        &self,
        hierarchy: &[NodeType],
        mode: SelectionMode,
        location: Option<GeoPoint>,
    ) -> Option<StorageNode> {
        for t in hierarchy {
            let found = match (mode, location) {
                (SelectionMode::Random, _) => self.random_of_types(&[*t]),
                (SelectionMode::Nearest, Some(loc)) => self.nearest_of_type(*t, loc),
                (SelectionMode::Nearest, None) => return None,
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Nodes of the given type whose projected upload duration for
    /// `filesize` bytes stays within `seconds`. Nodes with unknown upstream
    /// bandwidth never qualify.
    pub fn nodes_by_upload_time(
        &self,
        node_type: NodeType,
        filesize: u64,
        seconds: u32,
    ) -> Vec<StorageNode> {
        self.nodes_of_type(node_type)
            .into_iter()
            .filter(|n| {
                let megabytes = filesize as f64 / (1024.0 * 1024.0);
                let rate = n.bandwidth_up as f64 / 8.0;
                let duration = megabytes / rate;
                duration.ceil() <= seconds as f64
            })
            .collect()
    }
}

fn random_from(nodes: Vec<StorageNode>) -> Option<StorageNode> {
    if nodes.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..nodes.len());
    Some(nodes[idx].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileMetadata;
    use crate::node::types::NodeIdentity;
    use crate::test_support::memory_pool;
    use crate::transfer::transport::{ProgressCallback, UploadAck, UploadPayload};
    use crate::transfer::TransferResult;
    use async_trait::async_trait;
    use std::path::Path;

    /// Transport stub whose identify answer is scripted per test.
    struct StubTransport {
        identity: Option<NodeIdentity>,
    }

    #[async_trait]
    impl NodeTransport for StubTransport {
        async fn identify(&self, _node: &StorageNode) -> TransferResult<NodeIdentity> {
            self.identity
                .clone()
                .ok_or_else(|| TransferError::Unreachable("no reply".into()))
        }

        async fn upload(
            &self,
            _node: &StorageNode,
            _payload: &UploadPayload,
            _progress: ProgressCallback,
        ) -> TransferResult<UploadAck> {
            unreachable!("not exercised in registry tests")
        }

        async fn fetch_metadata(
            &self,
            _node: &StorageNode,
            _file_id: &str,
            _device_id: &str,
        ) -> TransferResult<FileMetadata> {
            unreachable!("not exercised in registry tests")
        }

        async fn download(
            &self,
            _node: &StorageNode,
            _file_id: &str,
            _device_id: &str,
            _dest: &Path,
            _progress: ProgressCallback,
        ) -> TransferResult<u64> {
            unreachable!("not exercised in registry tests")
        }

        async fn delete_file(
            &self,
            _node: &StorageNode,
            _file_id: &str,
            _device_id: &str,
        ) -> TransferResult<()> {
            unreachable!("not exercised in registry tests")
        }
    }

    async fn registry_with(identity: Option<NodeIdentity>) -> NodeRegistry {
        let store = NodeStore::new(memory_pool().await).await.unwrap();
        NodeRegistry::new(store, Arc::new(StubTransport { identity }))
    }

    fn node(id: &str, t: NodeType, lat: f64, lng: f64) -> StorageNode {
        StorageNode::new(id, "10.0.0.1", 8080, t).with_location(GeoPoint::new(lat, lng))
    }

    #[tokio::test]
    async fn test_add_node_is_idempotent() {
        let registry = registry_with(None).await;
        let n = node("n1", NodeType::Cloudlet, 49.0, 8.0);

        registry.add_node(n.clone()).await.unwrap();
        registry.add_node(n.clone()).await.unwrap();

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("n1").unwrap().id, "n1");
    }

    #[tokio::test]
    async fn test_add_node_resolves_unknown_identity() {
        let registry = registry_with(Some(NodeIdentity {
            uuid: "resolved-id".into(),
            node_type: NodeType::Gateway,
        }))
        .await;

        let candidate = StorageNode::new("", "10.0.0.7", 9000, NodeType::Unknown);
        let added = registry.add_node(candidate).await.unwrap();

        assert_eq!(added.id, "resolved-id");
        assert_eq!(added.node_type, NodeType::Gateway);
        assert_eq!(registry.nodes_of_type(NodeType::Gateway).len(), 1);
    }

    #[tokio::test]
    async fn test_add_node_unreachable_is_not_added() {
        let registry = registry_with(None).await;
        let candidate = StorageNode::new("", "10.0.0.7", 9000, NodeType::Unknown);

        let result = registry.add_node(candidate).await;
        assert!(matches!(result, Err(NodeError::Unreachable(_))));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_nearest_of_type() {
        let registry = registry_with(None).await;
        registry
            .add_node(node("far", NodeType::Cloudlet, 52.0, 13.0))
            .await
            .unwrap();
        registry
            .add_node(node("near", NodeType::Cloudlet, 49.88, 8.66))
            .await
            .unwrap();

        let nearest = registry
            .nearest_of_type(NodeType::Cloudlet, GeoPoint::new(49.87, 8.65))
            .unwrap();
        assert_eq!(nearest.id, "near");
    }

    #[tokio::test]
    async fn test_nearest_ties_keep_first_seen() {
        let registry = registry_with(None).await;
        registry
            .add_node(node("first", NodeType::Cloudlet, 49.9, 8.7))
            .await
            .unwrap();
        registry
            .add_node(node("second", NodeType::Cloudlet, 49.9, 8.7))
            .await
            .unwrap();

        let nearest = registry
            .nearest_of_type(NodeType::Cloudlet, GeoPoint::new(49.87, 8.65))
            .unwrap();
        assert_eq!(nearest.id, "first");
    }

    #[tokio::test]
    async fn test_n_nearest_of_type_is_bounded() {
        let registry = registry_with(None).await;
        for i in 0..5 {
            registry
                .add_node(node(
                    &format!("n{i}"),
                    NodeType::Gateway,
                    49.0 + i as f64 * 0.1,
                    8.0,
                ))
                .await
                .unwrap();
        }

        let nearest = registry.n_nearest_of_type(NodeType::Gateway, GeoPoint::new(49.0, 8.0), 3);
        assert_eq!(nearest.len(), 3);
        assert_eq!(nearest[0].id, "n0");
        assert_eq!(nearest[1].id, "n1");
    }

    #[tokio::test]
    async fn test_bandwidth_thresholds_are_inclusive() {
        let registry = registry_with(None).await;
        registry
            .add_node(
                node("exact", NodeType::Cloudlet, 49.0, 8.0).with_bandwidth(100, 50),
            )
            .await
            .unwrap();

        let found =
            registry.matching_bandwidth_and_radius(NodeType::Cloudlet, 100, 50, 0.0, 0.0, None);
        assert_eq!(found.len(), 1);

        let none =
            registry.matching_bandwidth_and_radius(NodeType::Cloudlet, 101, 50, 0.0, 0.0, None);
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_zero_bandwidth_threshold_ignores_dimension() {
        let registry = registry_with(None).await;
        registry
            .add_node(node("slow", NodeType::Cloudlet, 49.0, 8.0).with_bandwidth(1, 1))
            .await
            .unwrap();

        let found =
            registry.matching_bandwidth_and_radius(NodeType::Cloudlet, 0, 0, 0.0, 0.0, None);
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_radius_window_filters() {
        let registry = registry_with(None).await;
        // ~111 m north of the query point.
        registry
            .add_node(node("close", NodeType::Gateway, 49.8738, 8.6512))
            .await
            .unwrap();
        // ~11 km north.
        registry
            .add_node(node("distant", NodeType::Gateway, 49.9728, 8.6512))
            .await
            .unwrap();

        let loc = Some(GeoPoint::new(49.8728, 8.6512));
        let found =
            registry.matching_bandwidth_and_radius(NodeType::Gateway, 0, 0, 0.0, 1000.0, loc);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "close");

        // Malformed window (max <= min) disables the radius filter.
        let all = registry.matching_bandwidth_and_radius(NodeType::Gateway, 0, 0, 500.0, 100.0, loc);
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_follow_hierarchy_takes_first_non_empty_level() {
        let registry = registry_with(None).await;
        registry
            .add_node(node("cloud", NodeType::Cloud, 50.0, 8.0))
            .await
            .unwrap();

        let found = registry.follow_hierarchy(
            &[NodeType::CoreNet, NodeType::Cloud],
            SelectionMode::Random,
            None,
        );
        assert_eq!(found.unwrap().id, "cloud");

        let nothing = registry.follow_hierarchy(
            &[NodeType::CoreNet, NodeType::Cloud],
            SelectionMode::Nearest,
            None,
        );
        assert!(nothing.is_none());
    }

    #[tokio::test]
    async fn test_nodes_by_upload_time() {
        let registry = registry_with(None).await;
        // 80 Mbit/s = 10 MiB/s; a 100 MiB file takes 10 s.
        registry
            .add_node(node("fast", NodeType::CoreNet, 49.0, 8.0).with_bandwidth(80, 80))
            .await
            .unwrap();
        registry
            .add_node(node("slow", NodeType::CoreNet, 49.0, 8.0).with_bandwidth(8, 8))
            .await
            .unwrap();
        registry
            .add_node(node("unknown-bw", NodeType::CoreNet, 49.0, 8.0))
            .await
            .unwrap();

        let filesize = 100 * 1024 * 1024;
        let ok = registry.nodes_by_upload_time(NodeType::CoreNet, filesize, 20);
        let ids: Vec<&str> = ok.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["fast"]);
    }

    #[tokio::test]
    async fn test_registry_rebuilds_from_store() {
        let pool = memory_pool().await;
        let store = NodeStore::new(pool.clone()).await.unwrap();
        store
            .upsert(&node("persisted", NodeType::Cloud, 50.0, 8.0))
            .await
            .unwrap();

        let registry = NodeRegistry::new(store, Arc::new(StubTransport { identity: None }));
        assert_eq!(registry.count(), 0);
        registry.load_from_store().await.unwrap();
        assert_eq!(registry.count(), 1);
        assert!(registry.get("persisted").is_some());
    }
}
