use crate::node::types::StorageNode;
use serde::{Deserialize, Serialize};

/// Strategy used to turn (file, context) into a node decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchingMode {
    /// Only the single top-scored applicable rule is tried.
    RulesOnly,
    /// Rules are tried in score order until one resolves.
    RulesNextOnNoMatch,
    /// The deterministic heuristic only, no rules.
    FallbackHeuristic,
    /// Rules first; the heuristic when no rule yields a node.
    RulesThenFallback,
    /// Uniform random among all known nodes.
    Random,
}

impl Default for MatchingMode {
    fn default() -> Self {
        MatchingMode::RulesNextOnNoMatch
    }
}

impl MatchingMode {
    pub fn is_rule_based(&self) -> bool {
        matches!(
            self,
            MatchingMode::RulesOnly
                | MatchingMode::RulesNextOnNoMatch
                | MatchingMode::RulesThenFallback
        )
    }
}

/// Outcome of a matching run. "No node decided" is a valid terminal state:
/// the file then stays on the device.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    /// Per-layer outcomes in decision order; `None` records a layer that
    /// explicitly resolved to "store locally" or found nothing.
    pub layer_outcomes: Vec<Option<StorageNode>>,
    /// The usable nodes the file should be stored on.
    pub nodes: Vec<StorageNode>,
    /// The rule that produced the decision, for audit logging.
    pub rule_id: Option<String>,
    /// Index of the decision layer that produced the resolution.
    pub layer_index: Option<usize>,
}

impl Decision {
    pub fn device_only() -> Self {
        Decision::default()
    }

    pub fn from_single(node: Option<StorageNode>) -> Self {
        let mut decision = Decision::default();
        if let Some(node) = node {
            decision.layer_outcomes.push(Some(node.clone()));
            decision.nodes.push(node);
        }
        decision
    }

    /// True when at least one usable node was decided.
    pub fn has_nodes(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }
}
