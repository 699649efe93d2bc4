use crate::file::types::StoredFile;
use crate::matching::clock::Clock;
use crate::matching::error::MatchResult;
use crate::matching::fallback;
use crate::matching::filter;
use crate::matching::types::{Decision, MatchingMode};
use crate::node::registry::NodeRegistry;
use crate::node::types::{NodeType, StorageNode};
use crate::rule::store::RuleStore;
use crate::rule::types::{DecisionLayer, DecisionRule};
use crate::transfer::events::{Event, EventBus};
use rand::Rng;
use std::sync::Arc;

/// What a single rule produced when its decision layers were resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleOutcome {
    /// At least one usable node was found.
    Resolved,
    /// The rule explicitly resolved to "store locally, stop".
    DeviceOnly,
    /// The rule exhausted its layers without a result.
    NoResolution,
}

/// Verdict of one check in the per-layer resolution ladder.
enum Step {
    /// The whole rule is settled with this outcome.
    Done(RuleOutcome),
    /// This layer is exhausted; continue with the next one.
    NextLayer,
    /// This check does not apply; run the next check on the same layer.
    NextCheck,
}

/// The decision engine: picks a target node (or none, meaning store only on
/// the device) for a file, and reports which rule and layer were used.
pub struct MatchingEngine {
    registry: Arc<NodeRegistry>,
    rules: RuleStore,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl MatchingEngine {
    pub fn new(
        registry: Arc<NodeRegistry>,
        rules: RuleStore,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            rules,
            clock,
            events,
        }
    }

    /// Makes a storage decision for the file. "No node decided" is a valid
    /// outcome, never an error; the engine only fails on a rule-store error.
    pub async fn decide(&self, file: &StoredFile, mode: MatchingMode) -> MatchResult<Decision> {
        self.events.publish(Event::MatchingStarted {
            file_id: file.id.clone(),
            mode,
        });

        let decision = match mode {
            MatchingMode::Random => Decision::from_single(self.registry.random_node()),
            MatchingMode::FallbackHeuristic => {
                Decision::from_single(fallback::decide(file, &self.registry))
            }
            MatchingMode::RulesOnly
            | MatchingMode::RulesNextOnNoMatch
            | MatchingMode::RulesThenFallback => self.decide_by_rules(file, mode).await?,
        };

        self.events.publish(Event::MatchingNodeDecided {
            file_id: file.id.clone(),
            node_ids: decision.node_ids(),
        });
        tracing::debug!(
            file = %file.id,
            ?mode,
            nodes = decision.nodes.len(),
            rule = decision.rule_id.as_deref().unwrap_or("-"),
            "matching finished"
        );
        Ok(decision)
    }

    async fn decide_by_rules(
        &self,
        file: &StoredFile,
        mode: MatchingMode,
    ) -> MatchResult<Decision> {
        let candidates = self.rules.rules_matching_mime(&file.mime_type).await?;
        let eligible = filter::filter_rules(candidates, file, self.clock.as_ref());
        let ranked = filter::sort_by_detail_score(eligible);

        let mut decision = Decision::default();

        if !ranked.is_empty() {
            if mode == MatchingMode::RulesNextOnNoMatch {
                // Try rules from most to least detailed; the first rule that
                // produces any resolution (a node or the explicit
                // device-only sentinel) settles the file. A rule that found
                // nodes but not enough of them lets the more general rules
                // fill the remaining replicas.
                for rule in &ranked {
                    decision.rule_id = Some(rule.id.clone());
                    match self.resolve_rule(rule, file, &mut decision) {
                        RuleOutcome::Resolved => {
                            if decision.nodes.len() >= rule.replication_factor as usize {
                                break;
                            }
                        }
                        RuleOutcome::DeviceOnly => break,
                        RuleOutcome::NoResolution => {}
                    }
                }
            } else {
                let top = &ranked[0];
                decision.rule_id = Some(top.id.clone());
                self.resolve_rule(top, file, &mut decision);
            }

            if let Some(rule_id) = decision.rule_id.clone() {
                self.events.publish(Event::MatchingRuleUsed {
                    file_id: file.id.clone(),
                    rule_id,
                    layer_index: decision.layer_index,
                });
            }
        }

        if mode == MatchingMode::RulesThenFallback && !decision.has_nodes() {
            decision = Decision::from_single(fallback::decide(file, &self.registry));
        }

        Ok(decision)
    }

    /// Resolves one rule by walking its decision layers in order. Outcomes
    /// accumulate into `decision` so that a later rule can top up replicas
    /// found by an earlier one.
    fn resolve_rule(
        &self,
        rule: &DecisionRule,
        file: &StoredFile,
        decision: &mut Decision,
    ) -> RuleOutcome {
        for (index, layer) in rule.decision_layers.iter().enumerate() {
            if decision.nodes.len() >= rule.replication_factor as usize {
                return RuleOutcome::Resolved;
            }

            match self.step_local_sentinel(rule, layer, index, decision) {
                Step::Done(outcome) => return outcome,
                Step::NextLayer => continue,
                Step::NextCheck => {}
            }
            match self.step_specific_node(rule, layer, index, decision) {
                Step::Done(outcome) => return outcome,
                Step::NextLayer => continue,
                Step::NextCheck => {}
            }
            match self.step_untyped_constraints(rule, layer, file, index, decision) {
                Step::Done(outcome) => return outcome,
                Step::NextLayer => continue,
                Step::NextCheck => {}
            }
            match self.step_unconstrained_random(rule, layer, index, decision) {
                Step::Done(outcome) => return outcome,
                Step::NextLayer => continue,
                Step::NextCheck => {}
            }
            match self.step_radius_window(rule, layer, file, index, decision) {
                Step::Done(outcome) => return outcome,
                Step::NextLayer => continue,
                Step::NextCheck => {}
            }
            match self.step_bandwidth_only(rule, layer, index, decision) {
                Step::Done(outcome) => return outcome,
                // Last check of the ladder: anything else moves on.
                _ => continue,
            }
        }

        if decision.has_nodes() {
            RuleOutcome::Resolved
        } else {
            RuleOutcome::NoResolution
        }
    }

    /// Target type DeviceOnly/Unknown: stop resolving, store locally. In
    /// store-multiple mode the layer only records a local outcome and the
    /// remaining layers still run.
    fn step_local_sentinel(
        &self,
        rule: &DecisionRule,
        layer: &DecisionLayer,
        index: usize,
        decision: &mut Decision,
    ) -> Step {
        if !layer.target_type.is_local_sentinel() {
            return Step::NextCheck;
        }
        if rule.store_multiple {
            decision.layer_outcomes.push(None);
            return Step::NextLayer;
        }
        decision.layer_index = Some(index);
        Step::Done(RuleOutcome::DeviceOnly)
    }

    fn step_specific_node(
        &self,
        rule: &DecisionRule,
        layer: &DecisionLayer,
        index: usize,
        decision: &mut Decision,
    ) -> Step {
        if !layer.is_specific || layer.specific_node_id.is_empty() {
            return Step::NextCheck;
        }
        match self.registry.get(&layer.specific_node_id) {
            Some(node) => self.accept(rule, node, index, decision),
            // An unresolvable specific node falls through to the
            // constraint-based checks of the same layer.
            None => Step::NextCheck,
        }
    }

    /// Target type None plus constraints: any node type qualifies as long
    /// as bandwidth (and optionally the radius window) match.
    fn step_untyped_constraints(
        &self,
        rule: &DecisionRule,
        layer: &DecisionLayer,
        file: &StoredFile,
        index: usize,
        decision: &mut Decision,
    ) -> Step {
        if layer.target_type != NodeType::None
            || !(layer.max_radius > 0.0 || layer.has_bandwidth_constraint())
        {
            return Step::NextCheck;
        }
        if !layer.has_bandwidth_constraint() {
            return Step::NextCheck;
        }
        let location = file.context.as_ref().and_then(|c| c.location);
        let found = self.registry.matching_bandwidth_and_radius_any_type(
            layer.min_bw_up,
            layer.min_bw_down,
            layer.min_radius,
            layer.max_radius,
            location,
        );
        match random_pick(found) {
            Some(node) => self.accept(rule, node, index, decision),
            None => {
                if rule.store_multiple {
                    decision.layer_outcomes.push(None);
                }
                Step::NextLayer
            }
        }
    }

    /// No constraints at all: a uniformly random node of the layer's type.
    fn step_unconstrained_random(
        &self,
        rule: &DecisionRule,
        layer: &DecisionLayer,
        index: usize,
        decision: &mut Decision,
    ) -> Step {
        if !layer.is_unconstrained() {
            return Step::NextCheck;
        }
        match self.registry.random_of_types(&[layer.target_type]) {
            Some(node) => self.accept(rule, node, index, decision),
            None => {
                if rule.store_multiple {
                    decision.layer_outcomes.push(None);
                }
                Step::NextLayer
            }
        }
    }

    /// A radius window is set: try bandwidth+radius-qualified nodes of the
    /// layer's type. Finding nothing falls through to the bandwidth-only
    /// check rather than skipping the layer.
    fn step_radius_window(
        &self,
        rule: &DecisionRule,
        layer: &DecisionLayer,
        file: &StoredFile,
        index: usize,
        decision: &mut Decision,
    ) -> Step {
        if !layer.has_radius_window() {
            return Step::NextCheck;
        }
        let location = file.context.as_ref().and_then(|c| c.location);
        let found = self.registry.matching_bandwidth_and_radius(
            layer.target_type,
            layer.min_bw_up,
            layer.min_bw_down,
            layer.min_radius,
            layer.max_radius,
            location,
        );
        match random_pick(found) {
            Some(node) => self.accept(rule, node, index, decision),
            None => {
                decision.layer_outcomes.push(None);
                Step::NextCheck
            }
        }
    }

    /// Bandwidth constraints without a usable radius window.
    fn step_bandwidth_only(
        &self,
        rule: &DecisionRule,
        layer: &DecisionLayer,
        index: usize,
        decision: &mut Decision,
    ) -> Step {
        if !layer.has_bandwidth_constraint() {
            return Step::NextLayer;
        }
        let found = self.registry.matching_bandwidth_and_radius(
            layer.target_type,
            layer.min_bw_up,
            layer.min_bw_down,
            0.0,
            0.0,
            None,
        );
        match random_pick(found) {
            Some(node) => self.accept(rule, node, index, decision),
            None => Step::NextLayer,
        }
    }

    /// Records a found node. In store-multiple mode resolution continues
    /// with the next layer; otherwise the rule is settled.
    fn accept(
        &self,
        rule: &DecisionRule,
        node: StorageNode,
        index: usize,
        decision: &mut Decision,
    ) -> Step {
        decision.layer_outcomes.push(Some(node.clone()));
        if !decision.nodes.iter().any(|n| n.id == node.id) {
            decision.nodes.push(node);
        }
        decision.layer_index = Some(index);
        if rule.store_multiple {
            Step::NextLayer
        } else {
            Step::Done(RuleOutcome::Resolved)
        }
    }
}

fn random_pick(nodes: Vec<StorageNode>) -> Option<StorageNode> {
    if nodes.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..nodes.len());
    Some(nodes[idx].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::geo::GeoPoint;
    use crate::context::types::UsageContext;
    use crate::matching::clock::FixedClock;
    use crate::node::store::NodeStore;
    use crate::node::NodeIdentity;
    use crate::test_support::memory_pool;
    use crate::transfer::transport::{NodeTransport, ProgressCallback, UploadAck, UploadPayload};
    use crate::transfer::{TransferError, TransferResult};
    use async_trait::async_trait;
    use std::path::Path;

    struct NoTransport;

    #[async_trait]
    impl NodeTransport for NoTransport {
        async fn identify(&self, _node: &StorageNode) -> TransferResult<NodeIdentity> {
            Err(TransferError::Unreachable("offline".into()))
        }
        async fn upload(
            &self,
            _node: &StorageNode,
            _payload: &UploadPayload,
            _progress: ProgressCallback,
        ) -> TransferResult<UploadAck> {
            Err(TransferError::Unreachable("offline".into()))
        }
        async fn fetch_metadata(
            &self,
            _node: &StorageNode,
            _file_id: &str,
            _device_id: &str,
        ) -> TransferResult<crate::file::FileMetadata> {
            Err(TransferError::Unreachable("offline".into()))
        }
        async fn download(
            &self,
            _node: &StorageNode,
            _file_id: &str,
            _device_id: &str,
            _dest: &Path,
            _progress: ProgressCallback,
        ) -> TransferResult<u64> {
            Err(TransferError::Unreachable("offline".into()))
        }
        async fn delete_file(
            &self,
            _node: &StorageNode,
            _file_id: &str,
            _device_id: &str,
        ) -> TransferResult<()> {
            Err(TransferError::Unreachable("offline".into()))
        }
    }

    async fn engine() -> (MatchingEngine, Arc<NodeRegistry>, RuleStore) {
        let pool = memory_pool().await;
        let registry = Arc::new(NodeRegistry::new(
            NodeStore::new(pool.clone()).await.unwrap(),
            Arc::new(NoTransport),
        ));
        let rules = RuleStore::new(pool).await.unwrap();
        let clock = Arc::new(FixedClock {
            weekday: 3,
            minutes: 12 * 60,
        });
        let engine = MatchingEngine::new(registry.clone(), rules.clone(), clock, EventBus::new());
        (engine, registry, rules)
    }

    fn file_at(point: Option<GeoPoint>) -> StoredFile {
        let mut f = StoredFile::new("f1", "a.jpg", "jpg", Path::new("/tmp/f1.jpg"));
        f.size = 2048;
        f.context = Some(UsageContext {
            location: point,
            ..Default::default()
        });
        f
    }

    #[tokio::test]
    async fn test_no_rules_means_device_only() {
        let (engine, _registry, _rules) = engine().await;
        let decision = engine
            .decide(&file_at(None), MatchingMode::RulesOnly)
            .await
            .unwrap();
        assert!(!decision.has_nodes());
        assert!(decision.rule_id.is_none());
    }

    #[tokio::test]
    async fn test_specific_node_layer_resolves() {
        let (engine, registry, rules) = engine().await;
        registry
            .add_node(StorageNode::new("target", "10.0.0.2", 8080, NodeType::Cloudlet))
            .await
            .unwrap();

        let point = GeoPoint::new(49.87, 8.65);
        let mut rule = DecisionRule::new("exact spot");
        rule.context.location = Some(point);
        rule.context.radius = 0.0;
        rule.decision_layers = vec![DecisionLayer::specific_node("target")];
        rules.insert(&rule).await.unwrap();

        let decision = engine
            .decide(&file_at(Some(point)), MatchingMode::RulesNextOnNoMatch)
            .await
            .unwrap();

        assert_eq!(decision.node_ids(), vec!["target"]);
        assert_eq!(decision.rule_id.as_deref(), Some(rule.id.as_str()));
        assert_eq!(decision.layer_index, Some(0));
    }

    #[tokio::test]
    async fn test_device_only_sentinel_stops_rule_iteration() {
        let (engine, registry, rules) = engine().await;
        registry
            .add_node(StorageNode::new("cloud", "10.0.0.2", 8080, NodeType::Cloud))
            .await
            .unwrap();

        // Detailed rule says device-only; a general rule would find a node.
        let mut detailed = DecisionRule::new("keep local");
        detailed.context.location = Some(GeoPoint::new(49.87, 8.65));
        detailed.context.radius = 1000.0;
        detailed.decision_layers = vec![DecisionLayer::of_type(NodeType::DeviceOnly)];
        rules.insert(&detailed).await.unwrap();

        let mut general = DecisionRule::new("anywhere");
        general.decision_layers = vec![DecisionLayer::of_type(NodeType::Cloud)];
        rules.insert(&general).await.unwrap();

        let decision = engine
            .decide(
                &file_at(Some(GeoPoint::new(49.87, 8.65))),
                MatchingMode::RulesNextOnNoMatch,
            )
            .await
            .unwrap();

        assert!(!decision.has_nodes());
        assert_eq!(decision.rule_id.as_deref(), Some(detailed.id.as_str()));
    }

    #[tokio::test]
    async fn test_layer_fallback_to_next_layer() {
        let (engine, registry, rules) = engine().await;
        registry
            .add_node(StorageNode::new("cloud", "10.0.0.2", 8080, NodeType::Cloud))
            .await
            .unwrap();

        // First layer wants a cloudlet (none exist), second takes the cloud.
        let mut rule = DecisionRule::new("edge then cloud");
        rule.decision_layers = vec![
            DecisionLayer::of_type(NodeType::Cloudlet),
            DecisionLayer::of_type(NodeType::Cloud),
        ];
        rules.insert(&rule).await.unwrap();

        let decision = engine
            .decide(&file_at(None), MatchingMode::RulesNextOnNoMatch)
            .await
            .unwrap();

        assert_eq!(decision.node_ids(), vec!["cloud"]);
        assert_eq!(decision.layer_index, Some(1));
    }

    #[tokio::test]
    async fn test_next_rule_tried_when_first_yields_nothing() {
        let (engine, registry, rules) = engine().await;
        registry
            .add_node(StorageNode::new("cloud", "10.0.0.2", 8080, NodeType::Cloud))
            .await
            .unwrap();

        let mut detailed = DecisionRule::new("wants missing cloudlet");
        detailed.context.location = Some(GeoPoint::new(49.87, 8.65));
        detailed.context.radius = 1000.0;
        detailed.decision_layers = vec![DecisionLayer::of_type(NodeType::Cloudlet)];
        rules.insert(&detailed).await.unwrap();

        let mut general = DecisionRule::new("cloud fallback");
        general.decision_layers = vec![DecisionLayer::of_type(NodeType::Cloud)];
        rules.insert(&general).await.unwrap();

        let decision = engine
            .decide(
                &file_at(Some(GeoPoint::new(49.87, 8.65))),
                MatchingMode::RulesNextOnNoMatch,
            )
            .await
            .unwrap();

        assert_eq!(decision.node_ids(), vec!["cloud"]);
        assert_eq!(decision.rule_id.as_deref(), Some(general.id.as_str()));
    }

    #[tokio::test]
    async fn test_rules_only_tries_single_top_rule() {
        let (engine, registry, rules) = engine().await;
        registry
            .add_node(StorageNode::new("cloud", "10.0.0.2", 8080, NodeType::Cloud))
            .await
            .unwrap();

        let mut detailed = DecisionRule::new("wants missing cloudlet");
        detailed.context.location = Some(GeoPoint::new(49.87, 8.65));
        detailed.context.radius = 1000.0;
        detailed.decision_layers = vec![DecisionLayer::of_type(NodeType::Cloudlet)];
        rules.insert(&detailed).await.unwrap();

        let mut general = DecisionRule::new("cloud fallback");
        general.decision_layers = vec![DecisionLayer::of_type(NodeType::Cloud)];
        rules.insert(&general).await.unwrap();

        // RulesOnly stops after the top-scored rule even though it failed.
        let decision = engine
            .decide(
                &file_at(Some(GeoPoint::new(49.87, 8.65))),
                MatchingMode::RulesOnly,
            )
            .await
            .unwrap();
        assert!(!decision.has_nodes());
    }

    #[tokio::test]
    async fn test_rules_then_fallback_uses_heuristic() {
        let (engine, registry, _rules) = engine().await;
        registry
            .add_node(
                StorageNode::new("core", "10.0.0.2", 8080, NodeType::CoreNet)
                    .with_location(GeoPoint::new(49.9, 8.65)),
            )
            .await
            .unwrap();

        // No rules at all: the heuristic decides.
        let decision = engine
            .decide(
                &file_at(Some(GeoPoint::new(49.87, 8.65))),
                MatchingMode::RulesThenFallback,
            )
            .await
            .unwrap();
        assert_eq!(decision.node_ids(), vec!["core"]);
    }

    #[tokio::test]
    async fn test_random_mode_picks_any_node() {
        let (engine, registry, _rules) = engine().await;
        registry
            .add_node(StorageNode::new("only", "10.0.0.2", 8080, NodeType::Gateway))
            .await
            .unwrap();

        let decision = engine
            .decide(&file_at(None), MatchingMode::Random)
            .await
            .unwrap();
        assert_eq!(decision.node_ids(), vec!["only"]);
    }

    #[tokio::test]
    async fn test_store_multiple_collects_nodes_across_layers() {
        let (engine, registry, rules) = engine().await;
        registry
            .add_node(StorageNode::new("edge", "10.0.0.2", 8080, NodeType::Cloudlet))
            .await
            .unwrap();
        registry
            .add_node(StorageNode::new("cloud", "10.0.0.3", 8080, NodeType::Cloud))
            .await
            .unwrap();

        let mut rule = DecisionRule::new("replicate");
        rule.store_multiple = true;
        rule.replication_factor = 2;
        rule.decision_layers = vec![
            DecisionLayer::of_type(NodeType::Cloudlet),
            DecisionLayer::of_type(NodeType::Cloud),
        ];
        rules.insert(&rule).await.unwrap();

        let decision = engine
            .decide(&file_at(None), MatchingMode::RulesNextOnNoMatch)
            .await
            .unwrap();

        let mut ids = decision.node_ids();
        ids.sort();
        assert_eq!(ids, vec!["cloud", "edge"]);
        assert_eq!(decision.layer_outcomes.len(), 2);
    }
}
