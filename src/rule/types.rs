use crate::context::geo::GeoPoint;
use crate::context::types::{ActivityKind, NetworkContext, NoiseContext, PlaceKind};
use crate::node::types::NodeType;
use crate::rule::score::{compute_detail_score, default_context_weights};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which sharing domain a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SharingDomain {
    Private,
    Public,
    Both,
}

impl Default for SharingDomain {
    fn default() -> Self {
        SharingDomain::Both
    }
}

impl SharingDomain {
    /// Whether a file with the given privacy flag falls into this domain.
    pub fn includes(&self, file_is_private: bool) -> bool {
        match self {
            SharingDomain::Both => true,
            SharingDomain::Private => file_is_private,
            SharingDomain::Public => !file_is_private,
        }
    }
}

/// A time of day in hours and minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Self {
        // Out-of-range components fall back to midnight.
        let hour = if hour > 23 { 0 } else { hour };
        let minute = if minute > 59 { 0 } else { minute };
        Self { hour, minute }
    }

    pub fn minutes_of_day(&self) -> u32 {
        self.hour * 60 + self.minute
    }

    pub fn is_midnight(&self) -> bool {
        self.hour == 0 && self.minute == 0
    }
}

/// One ranked alternative within a rule. Layers are evaluated in order; the
/// first one that yields a usable node (or the explicit "store locally"
/// sentinel) wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLayer {
    #[serde(rename = "isSpecific", default)]
    pub is_specific: bool,
    #[serde(rename = "specificNodeId", default)]
    pub specific_node_id: String,
    #[serde(rename = "targetType", default = "default_target_type")]
    pub target_type: NodeType,
    #[serde(rename = "minRadius", default)]
    pub min_radius: f64,
    #[serde(rename = "maxRadius", default)]
    pub max_radius: f64,
    #[serde(rename = "minBwUp", default)]
    pub min_bw_up: u32,
    #[serde(rename = "minBwDown", default)]
    pub min_bw_down: u32,
}

fn default_target_type() -> NodeType {
    NodeType::Unknown
}

impl Default for DecisionLayer {
    fn default() -> Self {
        Self {
            is_specific: false,
            specific_node_id: String::new(),
            target_type: NodeType::Unknown,
            min_radius: 0.0,
            max_radius: 0.0,
            min_bw_up: 0,
            min_bw_down: 0,
        }
    }
}

impl DecisionLayer {
    pub fn specific_node(node_id: &str) -> Self {
        Self {
            is_specific: true,
            specific_node_id: node_id.to_string(),
            ..Default::default()
        }
    }

    pub fn of_type(target_type: NodeType) -> Self {
        Self {
            target_type,
            ..Default::default()
        }
    }

    pub fn has_radius_window(&self) -> bool {
        self.min_radius >= 0.0 && self.max_radius > 0.0
    }

    pub fn has_bandwidth_constraint(&self) -> bool {
        self.min_bw_up > 0 || self.min_bw_down > 0
    }

    pub fn is_unconstrained(&self) -> bool {
        self.min_radius == 0.0
            && self.max_radius == 0.0
            && self.min_bw_up == 0
            && self.min_bw_down == 0
    }
}

/// Context sub-filters a rule can be configured with. Every dimension is
/// optional; an absent dimension never constrains matching.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleContext {
    #[serde(default)]
    pub location: Option<GeoPoint>,
    /// Radius in meters around `location` within which the rule applies.
    #[serde(default)]
    pub radius: f64,
    #[serde(default)]
    pub place_types: Vec<PlaceKind>,
    #[serde(default)]
    pub activity: Option<ActivityKind>,
    #[serde(default)]
    pub network: Option<NetworkContext>,
    #[serde(default)]
    pub noise: Option<NoiseContext>,
}

/// A user- or admin-authored decision rule: a context predicate mapping to
/// an ordered list of candidate storage targets.
///
/// Rules are pure data; once loaded they are safely shareable as immutable
/// snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRule {
    pub id: String,
    pub name: String,
    /// Unix timestamp in seconds.
    pub created_at: i64,
    #[serde(default)]
    pub context: RuleContext,
    /// Mime types this rule triggers on; empty matches all.
    #[serde(default)]
    pub mime_types: Vec<String>,
    /// Minimum file size in bytes, 0 = no constraint.
    #[serde(default)]
    pub min_file_size: u64,
    #[serde(default)]
    pub sharing_domain: SharingDomain,
    /// True for rules distributed by the operator rather than the user.
    #[serde(default)]
    pub is_global: bool,
    /// Store on a node for every decision layer instead of the first match.
    #[serde(default)]
    pub store_multiple: bool,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
    /// Days of week the rule is active on (1 = Monday .. 7 = Sunday);
    /// empty = any day.
    #[serde(default)]
    pub weekdays: Vec<u32>,
    #[serde(default)]
    pub start_time: TimeOfDay,
    #[serde(default)]
    pub end_time: TimeOfDay,
    #[serde(default)]
    pub decision_layers: Vec<DecisionLayer>,
    /// Per-context-type scoring weights; missing keys use the defaults.
    #[serde(default)]
    pub context_scores: HashMap<String, f32>,
    /// Derived specificity score, recomputed whenever inputs change.
    #[serde(default)]
    pub detail_score: f32,
}

fn default_replication_factor() -> u32 {
    1
}

impl DecisionRule {
    pub fn new(name: &str) -> Self {
        let mut rule = Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            context: RuleContext::default(),
            mime_types: Vec::new(),
            min_file_size: 0,
            sharing_domain: SharingDomain::Both,
            is_global: false,
            store_multiple: false,
            replication_factor: 1,
            weekdays: Vec::new(),
            start_time: TimeOfDay::default(),
            end_time: TimeOfDay::default(),
            decision_layers: Vec::new(),
            context_scores: default_context_weights(),
            detail_score: 0.0,
        };
        rule.refresh_detail_score();
        rule
    }

    pub fn has_location_context(&self) -> bool {
        self.context.location.is_some()
    }

    pub fn has_place_context(&self) -> bool {
        !self.context.place_types.is_empty()
    }

    pub fn has_activity_context(&self) -> bool {
        self.context.activity.is_some()
    }

    pub fn has_network_context(&self) -> bool {
        self.context.network.is_some()
    }

    pub fn has_noise_context(&self) -> bool {
        self.context.noise.is_some()
    }

    pub fn has_file_size_constraint(&self) -> bool {
        self.min_file_size > 0
    }

    /// A rule with both times at 0:00 has no time window; the weekday check
    /// may still apply.
    pub fn has_time_window(&self) -> bool {
        !(self.start_time.is_midnight() && self.end_time.is_midnight())
    }

    pub fn refresh_detail_score(&mut self) {
        self.detail_score = compute_detail_score(self);
    }
}
