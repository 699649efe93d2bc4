pub mod geo;
pub mod types;

pub use geo::{great_circle_distance, GeoPoint};
pub use types::{
    ActivityContext, ActivityKind, MobileKind, NetworkContext, NoiseContext, Place, PlaceKind,
    PlacesContext, UsageContext,
};
