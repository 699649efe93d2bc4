use serde::{Deserialize, Serialize};

/// A geographic coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Distance to another point in meters.
    pub fn distance_to(&self, other: GeoPoint) -> f64 {
        great_circle_distance(*self, other)
    }
}

const STATUTE_MILES_PER_NAUTICAL_MILE: f64 = 1.15077945;
const METERS_PER_STATUTE_MILE: f64 = 1609.34;

/// Great-circle distance between two coordinates in meters, using the
/// spherical law of cosines. Rule radius comparisons are sensitive at small
/// radii, so the constants (60 nautical miles per degree, statute-mile
/// conversion) are kept exactly as the node catalogue expects them.
pub fn great_circle_distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lon1 = a.longitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let lon2 = b.longitude.to_radians();

    let cos_angle = lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * (lon1 - lon2).cos();
    // Floating error can push the dot product just past 1.0 for
    // near-identical points, which would turn acos into NaN.
    let angle = cos_angle.clamp(-1.0, 1.0).acos();

    let nautical_miles = 60.0 * angle.to_degrees();
    nautical_miles * STATUTE_MILES_PER_NAUTICAL_MILE * METERS_PER_STATUTE_MILE
}
