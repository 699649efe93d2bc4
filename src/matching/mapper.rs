use parking_lot::RwLock;
use std::collections::HashMap;

/// Cached association of file ids to the node ids known to hold them.
///
/// Mappings are advisory: absence must trigger a master-registry query, not
/// be read as "file does not exist". The whole map is a cache of the last
/// context search and is cleared when a new search begins.
#[derive(Default)]
pub struct FileNodeMapper {
    mappings: RwLock<HashMap<String, Vec<String>>>,
}

impl FileNodeMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the node set for a file. Empty inputs are rejected.
    pub fn set_mapping(&self, file_id: &str, node_ids: Vec<String>) -> bool {
        if file_id.trim().is_empty() || node_ids.is_empty() {
            return false;
        }
        self.mappings
            .write()
            .insert(file_id.to_string(), node_ids);
        true
    }

    /// Adds one node to a file's mapping, creating it when absent.
    pub fn add_mapping(&self, file_id: &str, node_id: &str) -> bool {
        if file_id.trim().is_empty() || node_id.trim().is_empty() {
            return false;
        }
        let mut mappings = self.mappings.write();
        let nodes = mappings.entry(file_id.to_string()).or_default();
        if !nodes.iter().any(|n| n == node_id) {
            nodes.push(node_id.to_string());
        }
        true
    }

    /// Node ids known to hold the file; empty when nothing is cached.
    pub fn node_ids(&self, file_id: &str) -> Vec<String> {
        self.mappings
            .read()
            .get(file_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove(&self, file_id: &str) {
        self.mappings.write().remove(file_id);
    }

    pub fn clear(&self) {
        self.mappings.write().clear();
    }

    pub fn len(&self) -> usize {
        self.mappings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.read().is_empty()
    }
}
