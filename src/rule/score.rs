use crate::rule::types::{DecisionRule, SharingDomain};
use std::collections::HashMap;

pub const KEY_LOCATION: &str = "s_location";
pub const KEY_WEEKDAYS: &str = "s_weekdays";
pub const KEY_TIMESPAN: &str = "s_timespan";
pub const KEY_PLACES: &str = "s_places";
pub const KEY_SHARING_DOMAIN: &str = "s_sharingd";
pub const KEY_ACTIVITY: &str = "s_activity";
pub const KEY_NETWORK: &str = "s_network";
pub const KEY_NOISE: &str = "s_noise";

/// Default per-context-type weights. They sum to 100, so a rule with every
/// dimension configured scores 100.
pub fn default_context_weights() -> HashMap<String, f32> {
    HashMap::from([
        (KEY_LOCATION.to_string(), 20.0),
        (KEY_WEEKDAYS.to_string(), 15.0),
        (KEY_TIMESPAN.to_string(), 10.0),
        (KEY_PLACES.to_string(), 15.0),
        (KEY_SHARING_DOMAIN.to_string(), 10.0),
        (KEY_ACTIVITY.to_string(), 10.0),
        (KEY_NETWORK.to_string(), 10.0),
        (KEY_NOISE.to_string(), 10.0),
    ])
}

/// Detail score of a rule: the sum of the weights of every context
/// dimension the rule has configured. Only the presence of a dimension
/// counts, never its magnitude, so adding detail can only raise the score.
pub fn compute_detail_score(rule: &DecisionRule) -> f32 {
    let defaults = default_context_weights();
    let weight = |key: &str| -> f32 {
        rule.context_scores
            .get(key)
            .copied()
            .or_else(|| defaults.get(key).copied())
            .unwrap_or(0.0)
    };

    let mut score = 0.0;
    if rule.has_location_context() {
        score += weight(KEY_LOCATION);
    }
    if !rule.weekdays.is_empty() {
        score += weight(KEY_WEEKDAYS);
    }
    if rule.has_time_window() {
        score += weight(KEY_TIMESPAN);
    }
    if rule.has_place_context() {
        score += weight(KEY_PLACES);
    }
    if rule.sharing_domain != SharingDomain::Both {
        score += weight(KEY_SHARING_DOMAIN);
    }
    if rule.has_activity_context() {
        score += weight(KEY_ACTIVITY);
    }
    if rule.has_network_context() {
        score += weight(KEY_NETWORK);
    }
    if rule.has_noise_context() {
        score += weight(KEY_NOISE);
    }
    score
}
