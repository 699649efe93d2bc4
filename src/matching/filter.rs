use crate::context::geo::great_circle_distance;
use crate::context::types::UsageContext;
use crate::file::types::StoredFile;
use crate::matching::clock::Clock;
use crate::rule::types::DecisionRule;
use std::cmp::Ordering;

/// Filters the candidate rules down to those applicable to the file's
/// context. Each check drops the rule when violated; evaluation order only
/// affects short-circuiting cost.
pub fn filter_rules(
    rules: Vec<DecisionRule>,
    file: &StoredFile,
    clock: &dyn Clock,
) -> Vec<DecisionRule> {
    let ctx = file.context.clone().unwrap_or_default();
    rules
        .into_iter()
        .filter(|rule| keep_rule(rule, file, &ctx, clock))
        .collect()
}

fn keep_rule(rule: &DecisionRule, file: &StoredFile, ctx: &UsageContext, clock: &dyn Clock) -> bool {
    check_file_size(rule, file)
        && check_sharing_domain(rule, file)
        && check_day_time(rule, clock)
        && check_location(rule, ctx)
        && check_places(rule, ctx)
        && check_network(rule, ctx)
        && check_activity(rule, ctx)
        && check_noise(rule, ctx)
}

fn check_file_size(rule: &DecisionRule, file: &StoredFile) -> bool {
    !(rule.has_file_size_constraint() && file.size < rule.min_file_size)
}

fn check_sharing_domain(rule: &DecisionRule, file: &StoredFile) -> bool {
    rule.sharing_domain.includes(file.is_private)
}

fn check_day_time(rule: &DecisionRule, clock: &dyn Clock) -> bool {
    if rule.weekdays.is_empty() {
        return true;
    }
    if !rule.weekdays.contains(&clock.weekday()) {
        return false;
    }
    if rule.has_time_window() {
        let start = rule.start_time.minutes_of_day();
        let end = rule.end_time.minutes_of_day();
        let now = clock.minutes_of_day();
        return start < end && now >= start && now < end;
    }
    true
}

fn check_location(rule: &DecisionRule, ctx: &UsageContext) -> bool {
    if let (Some(rule_loc), Some(file_loc)) = (rule.context.location, ctx.location) {
        let distance = great_circle_distance(rule_loc, file_loc);
        // Distance is rounded up before the comparison, so the radius is an
        // exact boundary at whole meters.
        if distance.ceil() > rule.context.radius {
            return false;
        }
    }
    true
}

fn check_places(rule: &DecisionRule, ctx: &UsageContext) -> bool {
    if !rule.has_place_context() {
        return true;
    }
    match ctx.most_likely_place() {
        Some(place) => rule.context.place_types.contains(&place.kind),
        None => false,
    }
}

fn check_network(rule: &DecisionRule, ctx: &UsageContext) -> bool {
    if let (Some(rule_net), Some(file_net)) = (&rule.context.network, &ctx.network) {
        return file_net.matches(rule_net);
    }
    true
}

fn check_activity(rule: &DecisionRule, ctx: &UsageContext) -> bool {
    if let (Some(rule_activity), Some(file_activity)) = (rule.context.activity, &ctx.activity) {
        return file_activity.matches(rule_activity);
    }
    true
}

fn check_noise(rule: &DecisionRule, ctx: &UsageContext) -> bool {
    if let (Some(rule_noise), Some(file_noise)) = (&rule.context.noise, &ctx.noise) {
        return rule_noise.matches(file_noise);
    }
    true
}

/// Sorts rules descending by detail score. The sort is stable, so
/// equal-score rules keep their relative input order.
pub fn sort_by_detail_score(mut rules: Vec<DecisionRule>) -> Vec<DecisionRule> {
    rules.sort_by(|a, b| {
        b.detail_score
            .partial_cmp(&a.detail_score)
            .unwrap_or(Ordering::Equal)
    });
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::geo::GeoPoint;
    use crate::context::types::{
        ActivityContext, ActivityKind, NetworkContext, NoiseContext, Place, PlaceKind,
        PlacesContext,
    };
    use crate::matching::clock::FixedClock;
    use crate::rule::types::{SharingDomain, TimeOfDay};
    use std::path::Path;

    fn file_with_ctx(ctx: UsageContext) -> StoredFile {
        let mut f = StoredFile::new("f1", "a.jpg", "jpg", Path::new("/tmp/f1.jpg"));
        f.size = 4096;
        f.context = Some(ctx);
        f
    }

    fn clock() -> FixedClock {
        FixedClock {
            weekday: 3,
            minutes: 12 * 60,
        }
    }

    fn run(rule: DecisionRule, file: &StoredFile) -> bool {
        !filter_rules(vec![rule], file, &clock()).is_empty()
    }

    #[test]
    fn test_min_file_size() {
        let file = file_with_ctx(UsageContext::default());
        let mut rule = DecisionRule::new("big files");
        rule.min_file_size = 10_000;
        assert!(!run(rule.clone(), &file));

        rule.min_file_size = 4096;
        assert!(run(rule, &file));
    }

    #[test]
    fn test_sharing_domain_filter() {
        let mut file = file_with_ctx(UsageContext::default());
        file.is_private = true;

        let mut public_only = DecisionRule::new("public");
        public_only.sharing_domain = SharingDomain::Public;
        assert!(!run(public_only, &file));

        let mut private_only = DecisionRule::new("private");
        private_only.sharing_domain = SharingDomain::Private;
        assert!(run(private_only, &file));
    }

    #[test]
    fn test_empty_weekdays_never_excludes() {
        let file = file_with_ctx(UsageContext::default());
        let mut rule = DecisionRule::new("any day");
        rule.start_time = TimeOfDay::new(23, 0);
        rule.end_time = TimeOfDay::new(23, 30);
        // Even with a time window set, an empty weekday list skips the whole
        // day/time check for all dates.
        for weekday in 1..=7 {
            let c = FixedClock {
                weekday,
                minutes: 0,
            };
            assert!(!filter_rules(vec![rule.clone()], &file, &c).is_empty());
        }
    }

    #[test]
    fn test_weekday_mismatch_drops_rule() {
        let file = file_with_ctx(UsageContext::default());
        let mut rule = DecisionRule::new("weekend");
        rule.weekdays = vec![6, 7];
        assert!(!run(rule, &file)); // clock says Wednesday
    }

    #[test]
    fn test_zero_time_window_skips_time_check() {
        let file = file_with_ctx(UsageContext::default());
        let mut rule = DecisionRule::new("wednesdays");
        rule.weekdays = vec![3];
        // No time window configured: midnight clock still matches.
        let c = FixedClock {
            weekday: 3,
            minutes: 0,
        };
        assert!(!filter_rules(vec![rule], &file, &c).is_empty());
    }

    #[test]
    fn test_time_window_is_half_open() {
        let file = file_with_ctx(UsageContext::default());
        let mut rule = DecisionRule::new("lunch");
        rule.weekdays = vec![3];
        rule.start_time = TimeOfDay::new(12, 0);
        rule.end_time = TimeOfDay::new(13, 0);

        let at = |minutes| {
            let c = FixedClock {
                weekday: 3,
                minutes,
            };
            !filter_rules(vec![rule.clone()], &file, &c).is_empty()
        };
        assert!(at(12 * 60)); // inclusive start
        assert!(at(12 * 60 + 59));
        assert!(!at(13 * 60)); // exclusive end
        assert!(!at(11 * 60 + 59));
    }

    #[test]
    fn test_location_radius_ceil_boundary() {
        // Rule point and a file point ~111.19 m apart (0.001 deg latitude).
        let rule_point = GeoPoint::new(49.8728, 8.6512);
        let file_point = GeoPoint::new(49.8738, 8.6512);
        let distance = great_circle_distance(rule_point, file_point);

        let file = file_with_ctx(UsageContext {
            location: Some(file_point),
            ..Default::default()
        });

        let mut rule = DecisionRule::new("nearby");
        rule.context.location = Some(rule_point);

        // Radius at the rounded-up distance keeps the rule.
        rule.context.radius = distance.ceil();
        assert!(run(rule.clone(), &file));

        // One meter below the rounded-up distance drops it.
        rule.context.radius = distance.ceil() - 1.0;
        assert!(!run(rule, &file));
    }

    #[test]
    fn test_location_check_requires_both_locations() {
        // A rule with location context never drops a file without one.
        let file = file_with_ctx(UsageContext::default());
        let mut rule = DecisionRule::new("nearby");
        rule.context.location = Some(GeoPoint::new(49.0, 8.0));
        rule.context.radius = 10.0;
        assert!(run(rule, &file));
    }

    #[test]
    fn test_zero_radius_at_exact_point() {
        let point = GeoPoint::new(49.8728, 8.6512);
        let file = file_with_ctx(UsageContext {
            location: Some(point),
            ..Default::default()
        });
        let mut rule = DecisionRule::new("exact spot");
        rule.context.location = Some(point);
        rule.context.radius = 0.0;
        assert!(run(rule, &file));
    }

    #[test]
    fn test_place_type_filter() {
        let at_event = UsageContext {
            places: Some(PlacesContext::new(vec![Place {
                name: "Festival".into(),
                kind: PlaceKind::Event,
                likelihood: 0.8,
                location: None,
            }])),
            ..Default::default()
        };
        let file = file_with_ctx(at_event);

        let mut event_rule = DecisionRule::new("events");
        event_rule.context.place_types = vec![PlaceKind::Event];
        assert!(run(event_rule, &file));

        let mut poi_rule = DecisionRule::new("pois");
        poi_rule.context.place_types = vec![PlaceKind::Poi];
        assert!(!run(poi_rule, &file));

        // A place-typed rule needs a most-likely place on the file side.
        let bare = file_with_ctx(UsageContext::default());
        let mut any_place = DecisionRule::new("places");
        any_place.context.place_types = vec![PlaceKind::Event, PlaceKind::Poi];
        assert!(!run(any_place, &bare));
    }

    #[test]
    fn test_network_activity_noise_filters() {
        let ctx = UsageContext {
            network: Some(NetworkContext::wifi("office")),
            activity: Some(ActivityContext::new(ActivityKind::Still, 90)),
            noise: Some(NoiseContext::new(-20.0, -40.0)),
            ..Default::default()
        };
        let file = file_with_ctx(ctx);

        let mut rule = DecisionRule::new("quiet office walk");
        rule.context.network = Some(NetworkContext::wifi("office"));
        rule.context.activity = Some(ActivityKind::Still);
        rule.context.noise = Some(NoiseContext::new(-10.0, -40.0)); // must be loud
        assert!(run(rule.clone(), &file));

        rule.context.activity = Some(ActivityKind::InVehicle);
        assert!(!run(rule, &file));
    }

    #[test]
    fn test_sort_is_stable_for_equal_scores() {
        let mut a = DecisionRule::new("a");
        let mut b = DecisionRule::new("b");
        let mut c = DecisionRule::new("c");
        a.detail_score = 10.0;
        b.detail_score = 10.0;
        c.detail_score = 50.0;

        let sorted = sort_by_detail_score(vec![a, b, c]);
        let names: Vec<&str> = sorted.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }
}
