use crate::context::geo::GeoPoint;
use serde::{Deserialize, Serialize};

/// Classification of the device's physical activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityKind {
    Still,
    OnFoot,
    InVehicle,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityContext {
    pub kind: ActivityKind,
    /// Classifier confidence, 0-100.
    #[serde(default)]
    pub confidence: u8,
}

impl ActivityContext {
    pub fn new(kind: ActivityKind, confidence: u8) -> Self {
        Self { kind, confidence }
    }

    pub fn matches(&self, kind: ActivityKind) -> bool {
        self.kind == kind
    }
}

/// Mobile network generation, coarse-grained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MobileKind {
    TwoG,
    ThreeG,
    FourG,
    FiveG,
}

/// Network connectivity snapshot. A connected WiFi with a known SSID has
/// priority over the mobile connection when matching.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkContext {
    #[serde(default)]
    pub wifi_connected: bool,
    #[serde(default)]
    pub wifi_ssid: Option<String>,
    #[serde(default)]
    pub mobile_connected: bool,
    #[serde(default)]
    pub mobile_kind: Option<MobileKind>,
}

impl NetworkContext {
    pub fn wifi(ssid: &str) -> Self {
        Self {
            wifi_connected: true,
            wifi_ssid: Some(ssid.to_string()),
            ..Default::default()
        }
    }

    pub fn mobile(kind: MobileKind) -> Self {
        Self {
            mobile_connected: true,
            mobile_kind: Some(kind),
            ..Default::default()
        }
    }

    /// WiFi match: both sides connected and the SSIDs agree, where `"%"` on
    /// either side acts as a wildcard.
    pub fn wifi_matches(&self, other: &NetworkContext) -> bool {
        if !self.wifi_connected || !other.wifi_connected {
            return false;
        }
        match (&self.wifi_ssid, &other.wifi_ssid) {
            (Some(a), Some(b)) => a == b || a == "%" || b == "%",
            _ => false,
        }
    }

    /// Full network match: WiFi first; if that fails, both sides on a mobile
    /// connection match when either leaves the generation unspecified or
    /// both agree on it.
    pub fn matches(&self, other: &NetworkContext) -> bool {
        if self.wifi_matches(other) {
            return true;
        }
        if self.mobile_connected && other.mobile_connected {
            return match (&self.mobile_kind, &other.mobile_kind) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            };
        }
        false
    }
}

/// Ambient noise measurement. The dB scale runs from -90.3 (lowest) to 0
/// (loudest); a reading below the threshold counts as silent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseContext {
    #[serde(rename = "sound_db")]
    pub db: f64,
    #[serde(rename = "sound_rms", default)]
    pub rms: f64,
    #[serde(rename = "sound_db_thresh")]
    pub db_threshold: f64,
}

impl NoiseContext {
    pub fn new(db: f64, db_threshold: f64) -> Self {
        Self {
            db,
            rms: 0.0,
            db_threshold,
        }
    }

    pub fn is_silent(&self) -> bool {
        self.db < self.db_threshold
    }

    /// Matches a measured noise context against this one used as a
    /// requirement: if this context is silent, the other must not exceed the
    /// threshold, and vice versa.
    pub fn matches(&self, measured: &NoiseContext) -> bool {
        (measured.db > self.db_threshold) == !self.is_silent()
    }
}

/// Semantic category of a nearby place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaceKind {
    Event,
    Poi,
    Work,
    Unknown,
}

/// A nearby place candidate with its detection likelihood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub name: String,
    pub kind: PlaceKind,
    /// Likelihood that the device is at this place, 0.0-1.0.
    pub likelihood: f32,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlacesContext {
    pub places: Vec<Place>,
}

impl PlacesContext {
    pub fn new(places: Vec<Place>) -> Self {
        Self { places }
    }

    pub fn most_likely(&self) -> Option<&Place> {
        self.places.iter().max_by(|a, b| {
            a.likelihood
                .partial_cmp(&b.likelihood)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// All places whose likelihood is at least `threshold`.
    pub fn filter_by_likelihood(&self, threshold: f32) -> Vec<&Place> {
        self.places
            .iter()
            .filter(|p| p.likelihood >= threshold)
            .collect()
    }
}

/// Point-in-time usage context attached to a file when it is stored.
///
/// Every dimension is independently optional; absence means "do not
/// constrain on this dimension", never "constrained to empty".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageContext {
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub places: Option<PlacesContext>,
    #[serde(default)]
    pub activity: Option<ActivityContext>,
    #[serde(default)]
    pub network: Option<NetworkContext>,
    #[serde(default)]
    pub noise: Option<NoiseContext>,
    /// Day of week, 1 = Monday through 7 = Sunday.
    #[serde(default)]
    pub weekday: Option<u32>,
    /// Unix timestamp in seconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl UsageContext {
    pub fn most_likely_place(&self) -> Option<&Place> {
        self.places.as_ref().and_then(|p| p.most_likely())
    }

    pub fn has_location(&self) -> bool {
        self.location.is_some()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
