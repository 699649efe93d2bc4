use crate::context::geo::GeoPoint;
use serde::{Deserialize, Serialize};

/// The fixed set of storage node categories.
///
/// `DeviceOnly` and `Unknown` act as sentinels inside decision layers
/// ("store locally, stop resolving"); `None` marks a layer constrained only
/// by bandwidth/radius across all node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "CLOUD")]
    Cloud,
    #[serde(rename = "CORENET")]
    CoreNet,
    #[serde(rename = "CLOUDLET")]
    Cloudlet,
    #[serde(rename = "GATEWAY")]
    Gateway,
    #[serde(rename = "PRIVATE_NODE")]
    PrivateNode,
    #[serde(rename = "DEVICE_ONLY")]
    DeviceOnly,
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "NONE")]
    None,
}

impl NodeType {
    pub const ALL: [NodeType; 8] = [
        NodeType::Cloud,
        NodeType::CoreNet,
        NodeType::Cloudlet,
        NodeType::Gateway,
        NodeType::PrivateNode,
        NodeType::DeviceOnly,
        NodeType::Unknown,
        NodeType::None,
    ];

    /// True for the sentinel types that mean "store on the device, stop".
    pub fn is_local_sentinel(&self) -> bool {
        matches!(self, NodeType::DeviceOnly | NodeType::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Cloud => "CLOUD",
            NodeType::CoreNet => "CORENET",
            NodeType::Cloudlet => "CLOUDLET",
            NodeType::Gateway => "GATEWAY",
            NodeType::PrivateNode => "PRIVATE_NODE",
            NodeType::DeviceOnly => "DEVICE_ONLY",
            NodeType::Unknown => "UNKNOWN",
            NodeType::None => "NONE",
        }
    }

    pub fn from_str_or_unknown(s: &str) -> NodeType {
        match s {
            "CLOUD" => NodeType::Cloud,
            "CORENET" => NodeType::CoreNet,
            "CLOUDLET" => NodeType::Cloudlet,
            "GATEWAY" => NodeType::Gateway,
            "PRIVATE_NODE" => NodeType::PrivateNode,
            "DEVICE_ONLY" => NodeType::DeviceOnly,
            "NONE" => NodeType::None,
            _ => NodeType::Unknown,
        }
    }
}

/// Reply of a storage node to an identity request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub uuid: String,
    #[serde(rename = "type", default = "default_identity_type")]
    pub node_type: NodeType,
}

fn default_identity_type() -> NodeType {
    NodeType::Unknown
}

/// A known storage node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNode {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub node_type: NodeType,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    /// Upstream bandwidth in Mbit/s, 0 = unknown/ignored.
    #[serde(default)]
    pub bandwidth_up: u32,
    /// Downstream bandwidth in Mbit/s, 0 = unknown/ignored.
    #[serde(default)]
    pub bandwidth_down: u32,
}

impl StorageNode {
    pub fn new(id: &str, address: &str, port: u16, node_type: NodeType) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            port,
            node_type,
            location: None,
            bandwidth_up: 0,
            bandwidth_down: 0,
        }
    }

    pub fn with_location(mut self, point: GeoPoint) -> Self {
        self.location = Some(point);
        self
    }

    pub fn with_bandwidth(mut self, up: u32, down: u32) -> Self {
        self.bandwidth_up = up;
        self.bandwidth_down = down;
        self
    }

    pub fn base_url(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            format!("{}:{}", self.address, self.port)
        } else {
            format!("http://{}:{}", self.address, self.port)
        }
    }

    /// Identity endpoint; a GET returns the node's uuid and type.
    pub fn identity_url(&self) -> String {
        format!("{}/uuid", self.base_url())
    }

    /// File upload endpoint; accepts a multipart POST.
    pub fn upload_url(&self) -> String {
        format!("{}/file/data", self.base_url())
    }

    pub fn download_url(&self, file_id: &str, device_id: &str) -> String {
        format!("{}/file/data/{}/{}", self.base_url(), file_id, device_id)
    }

    pub fn metadata_url(&self, file_id: &str, device_id: &str) -> String {
        format!(
            "{}/file/metadata/full/{}/{}",
            self.base_url(),
            file_id,
            device_id
        )
    }

    pub fn delete_url(&self, file_id: &str, device_id: &str) -> String {
        format!("{}/file/{}/{}", self.base_url(), file_id, device_id)
    }

    pub fn search_url(&self) -> String {
        format!("{}/file/search", self.base_url())
    }

    /// Geographic distance to `point` in meters, or `f64::MAX` when the
    /// node's position is unknown so it always ranks last.
    pub fn distance_to(&self, point: GeoPoint) -> f64 {
        match self.location {
            Some(loc) => loc.distance_to(point),
            None => f64::MAX,
        }
    }
}
