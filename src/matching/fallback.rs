use crate::context::types::{ActivityKind, Place, PlaceKind, UsageContext};
use crate::file::types::StoredFile;
use crate::node::registry::{NodeRegistry, SelectionMode};
use crate::node::types::NodeType::{Cloud, Cloudlet, CoreNet, Gateway, PrivateNode};
use crate::node::types::StorageNode;

// Likelihood thresholds for selecting the place to match against. The scan
// starts strict and relaxes until something qualifies.
const PLACE_THRESHOLD_START: f32 = 0.30;
const PLACE_THRESHOLD_FLOOR: f32 = 0.05;
const PLACE_THRESHOLD_STEP: f32 = 0.02;

/// Deterministic node choice without rules.
///
/// Private files go to personal infrastructure first. Public files are
/// placed by the current situation: passing through in a vehicle keeps them
/// off edge nodes, sharing at a loud event prefers edge nodes near the
/// event, and everything else lands on the middle of the hierarchy.
pub fn decide(file: &StoredFile, registry: &NodeRegistry) -> Option<StorageNode> {
    if registry.count() == 0 {
        return None;
    }
    let ctx = file.context.clone().unwrap_or_default();
    let location = ctx.location;
    let mode = if location.is_some() {
        SelectionMode::Nearest
    } else {
        SelectionMode::Random
    };

    if file.is_private {
        return registry.follow_hierarchy(&[PrivateNode, CoreNet, Cloud], mode, location);
    }

    // In a vehicle the device is likely just passing by whatever edge nodes
    // are around, so only the stationary tiers make sense.
    if matches!(ctx.activity, Some(a) if a.kind == ActivityKind::InVehicle) {
        return registry.follow_hierarchy(&[CoreNet, Cloud], mode, location);
    }

    if let Some(place) = pick_place(&ctx) {
        match place.kind {
            PlaceKind::Event => return decide_at_event(&ctx, registry),
            PlaceKind::Poi => {
                return registry.follow_hierarchy(
                    &[CoreNet, Cloudlet, Gateway, Cloud],
                    mode,
                    location,
                )
            }
            _ => {}
        }
    }

    // No likely place, or an unclassified one: the core network is the best
    // tradeoff between sharing here and sharing with friends elsewhere.
    let node = match location {
        Some(loc) => {
            registry.follow_hierarchy(&[CoreNet, Cloud], SelectionMode::Nearest, Some(loc))
        }
        None => None,
    };
    node.or_else(|| registry.random_of_types(&[Cloudlet, Gateway]))
}

fn decide_at_event(ctx: &UsageContext, registry: &NodeRegistry) -> Option<StorageNode> {
    let loud = matches!(&ctx.noise, Some(n) if !n.is_silent());
    if loud {
        // Sharing at a loud event: pick among the two nearest cloudlets and
        // gateways so a single node near the event is not overloaded.
        if let Some(loc) = ctx.location {
            if let Some(n) = registry.nearest_of_types(&[Cloudlet, Gateway], loc, 2) {
                return Some(n);
            }
            if let Some(n) = registry.nearest_of_type(CoreNet, loc) {
                return Some(n);
            }
            return registry.nearest_of_type(Cloud, loc);
        }
        return registry.random_of_types(&[Cloudlet, Gateway]);
    }

    // Near an event but quiet: assume no intent to share at the event.
    match ctx.location {
        Some(loc) => registry.follow_hierarchy(&[CoreNet, Cloud], SelectionMode::Nearest, Some(loc)),
        None => registry.random_of_types(&[CoreNet, Cloud]),
    }
}

/// The place to match against: the likelihood threshold relaxes until some
/// place qualifies, then ties resolve to the closest place when a location
/// is known, otherwise to the most likely one.
fn pick_place(ctx: &UsageContext) -> Option<Place> {
    let places = ctx.places.as_ref()?;

    let mut threshold = PLACE_THRESHOLD_START;
    let mut filtered: Vec<&Place> = Vec::new();
    while filtered.is_empty() && threshold > PLACE_THRESHOLD_FLOOR {
        filtered = places.filter_by_likelihood(threshold);
        threshold -= PLACE_THRESHOLD_STEP;
    }
    if filtered.is_empty() {
        return None;
    }
    if filtered.len() == 1 {
        return Some(filtered[0].clone());
    }

    let best = match ctx.location {
        Some(loc) => filtered.into_iter().min_by(|a, b| {
            let da = a.location.map(|l| l.distance_to(loc)).unwrap_or(f64::MAX);
            let db = b.location.map(|l| l.distance_to(loc)).unwrap_or(f64::MAX);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        }),
        None => filtered.into_iter().max_by(|a, b| {
            a.likelihood
                .partial_cmp(&b.likelihood)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
    };
    best.cloned()
}
