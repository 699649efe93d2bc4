use crate::context::types::UsageContext;
use crate::node::types::NodeType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Derives a mime type from a file extension. Unknown extensions fall back
/// to the generic binary type and are handled without matching rules
/// specific to their content.
pub fn mime_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "avi" => "video/avi",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "aac" => "audio/aac",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

/// A file managed by the framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: String,
    pub descriptive_name: String,
    pub mime_type: String,
    pub extension: String,
    /// Size in bytes.
    pub size: u64,
    /// Unix timestamp in seconds.
    pub created_at: i64,
    /// BLAKE3 hash of the content, used for duplicate detection.
    pub content_hash: String,
    pub is_private: bool,
    pub upload_pending: bool,
    pub upload_failed: bool,
    pub delete_pending: bool,
    /// Ids of the nodes this file should be (or has been) stored on.
    pub node_ids: Vec<String>,
    pub context: Option<UsageContext>,
    /// Local path of the copy inside the framework's storage directory.
    pub path: PathBuf,
}

impl StoredFile {
    pub fn new(id: &str, descriptive_name: &str, extension: &str, path: &Path) -> Self {
        Self {
            id: id.to_string(),
            descriptive_name: descriptive_name.to_string(),
            mime_type: mime_for_extension(extension).to_string(),
            extension: extension.to_string(),
            size: 0,
            created_at: chrono::Utc::now().timestamp(),
            content_hash: String::new(),
            is_private: false,
            upload_pending: true,
            upload_failed: false,
            delete_pending: false,
            node_ids: Vec::new(),
            context: None,
            path: path.to_path_buf(),
        }
    }

    /// The first target node, when a decision has been made.
    pub fn main_node_id(&self) -> Option<&str> {
        self.node_ids.first().map(|s| s.as_str())
    }

    pub fn add_node_id(&mut self, node_id: &str) {
        if !self.node_ids.iter().any(|n| n == node_id) {
            self.node_ids.push(node_id.to_string());
        }
    }

    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            uuid: self.id.clone(),
            descriptive_name: self.descriptive_name.clone(),
            mime_type: self.mime_type.clone(),
            extension: self.extension.clone(),
            filesize: self.size,
            creation_timestamp: self.created_at,
            is_private: self.is_private,
            node_type: None,
        }
    }
}

/// Wire form of a file's metadata as served by storage nodes inside the
/// `{"error": 0, "reply": {"metadata": {...}}}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub uuid: String,
    #[serde(rename = "descriptiveName", default)]
    pub descriptive_name: String,
    #[serde(rename = "mimetype", default)]
    pub mime_type: String,
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub filesize: u64,
    #[serde(rename = "creationdate", default)]
    pub creation_timestamp: i64,
    #[serde(rename = "isPrivate", default)]
    pub is_private: bool,
    /// Filled in locally from the node the metadata came from.
    #[serde(skip)]
    pub node_type: Option<NodeType>,
}
