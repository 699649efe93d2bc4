use crate::node::types::StorageNode;
use crate::transfer::error::{TransferError, TransferResult};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const MASTER_TIMEOUT: Duration = Duration::from_secs(2);

/// The master registry service: the authoritative file/node mapping and the
/// global node list. All operations are idempotent and safe to retry.
#[async_trait]
pub trait MasterRegistry: Send + Sync {
    /// Node ids known to hold the file. Empty when the master has none.
    async fn file_node_mapping(&self, file_id: &str) -> TransferResult<Vec<String>>;

    async fn post_file_node_mapping(&self, file_id: &str, node_id: &str) -> TransferResult<()>;

    async fn delete_file_node_mapping(&self, file_id: &str) -> TransferResult<()>;

    async fn storage_node_list(&self) -> TransferResult<Vec<StorageNode>>;
}

/// Production client for the master node's REST interface.
pub struct HttpMasterRegistry {
    base_url: String,
    http: reqwest::Client,
}

impl HttpMasterRegistry {
    pub fn new(base_url: &str) -> TransferResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(MASTER_TIMEOUT)
            .timeout(MASTER_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn mapping_url(&self, file_id: &str) -> String {
        format!("{}/v1/file_node_mapping/{}", self.base_url, file_id)
    }

    fn nodes_url(&self) -> String {
        format!("{}/v1/nodes", self.base_url)
    }
}

#[async_trait]
impl MasterRegistry for HttpMasterRegistry {
    async fn file_node_mapping(&self, file_id: &str) -> TransferResult<Vec<String>> {
        let response = self
            .http
            .get(self.mapping_url(file_id))
            .send()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| TransferError::MalformedReply(e.to_string()))?;

        let nodes = body
            .get("reply")
            .and_then(|r| r.get("nodes"))
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(nodes)
            .map_err(|e| TransferError::MalformedReply(format!("mapping reply: {e}")))
    }

    async fn post_file_node_mapping(&self, file_id: &str, node_id: &str) -> TransferResult<()> {
        self.http
            .post(self.mapping_url(file_id))
            .json(&serde_json::json!({ "nodeId": node_id }))
            .send()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn delete_file_node_mapping(&self, file_id: &str) -> TransferResult<()> {
        self.http
            .delete(self.mapping_url(file_id))
            .send()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn storage_node_list(&self) -> TransferResult<Vec<StorageNode>> {
        let response = self
            .http
            .get(self.nodes_url())
            .send()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| TransferError::MalformedReply(e.to_string()))?;

        let nodes = body
            .get("reply")
            .and_then(|r| r.get("nodes"))
            .cloned()
            .ok_or_else(|| TransferError::MalformedReply("node list reply".into()))?;
        serde_json::from_value(nodes)
            .map_err(|e| TransferError::MalformedReply(format!("node list: {e}")))
    }
}
