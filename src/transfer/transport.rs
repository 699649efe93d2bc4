use crate::file::types::{FileMetadata, StoredFile};
use crate::node::types::{NodeIdentity, StorageNode};
use crate::transfer::error::{TransferError, TransferResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Timeouts per the node wire contract: short for control-plane calls,
/// generous for bulk transfer.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);
const BULK_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const BULK_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

const UPLOAD_STREAM_CHUNK: usize = 64 * 1024;

/// Invoked with (bytes transferred, total bytes) while a body streams.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

pub fn no_progress() -> ProgressCallback {
    Arc::new(|_, _| {})
}

/// The multipart body of an upload, built once per file and reused across
/// nodes and attempts.
#[derive(Debug, Clone)]
pub struct UploadPayload {
    pub file_id: String,
    pub descriptive_name: String,
    pub mime_type: String,
    pub extension: String,
    pub size: u64,
    pub created_at: i64,
    pub is_private: bool,
    pub device_id: String,
    pub context_json: String,
    pub bytes: Bytes,
}

impl UploadPayload {
    /// Reads the file content and captures the metadata fields the node
    /// expects alongside it.
    pub async fn build(file: &StoredFile, device_id: &str) -> TransferResult<Self> {
        let bytes = tokio::fs::read(&file.path).await?;
        let context_json = file
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_else(|| "{}".to_string());

        Ok(Self {
            file_id: file.id.clone(),
            descriptive_name: file.descriptive_name.clone(),
            mime_type: file.mime_type.clone(),
            extension: file.extension.clone(),
            size: file.size,
            created_at: file.created_at,
            is_private: file.is_private,
            device_id: device_id.to_string(),
            context_json,
            bytes: Bytes::from(bytes),
        })
    }
}

/// Acknowledgement of a successful upload.
#[derive(Debug, Clone, Default)]
pub struct UploadAck {
    pub file_id: String,
}

/// The HTTP face of a storage node, kept behind a trait so transfer
/// orchestration is testable without a network.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Asks the node for its uuid and type. Bounded by the control timeout.
    async fn identify(&self, node: &StorageNode) -> TransferResult<NodeIdentity>;

    /// Multipart upload of a file plus its metadata and serialized context.
    async fn upload(
        &self,
        node: &StorageNode,
        payload: &UploadPayload,
        progress: ProgressCallback,
    ) -> TransferResult<UploadAck>;

    async fn fetch_metadata(
        &self,
        node: &StorageNode,
        file_id: &str,
        device_id: &str,
    ) -> TransferResult<FileMetadata>;

    /// Streams the file body into `dest`. Returns the bytes written.
    async fn download(
        &self,
        node: &StorageNode,
        file_id: &str,
        device_id: &str,
        dest: &Path,
        progress: ProgressCallback,
    ) -> TransferResult<u64>;

    async fn delete_file(
        &self,
        node: &StorageNode,
        file_id: &str,
        device_id: &str,
    ) -> TransferResult<()>;

    /// Asks the node for files matching a usage context. Nodes that do not
    /// implement the search route simply contribute nothing.
    async fn search_files(
        &self,
        node: &StorageNode,
        context_json: &str,
        device_id: &str,
    ) -> TransferResult<Vec<FileMetadata>> {
        let _ = (node, context_json, device_id);
        Ok(Vec::new())
    }
}

/// Production transport over reqwest.
pub struct HttpTransport {
    control: reqwest::Client,
    bulk: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> TransferResult<Self> {
        let control = reqwest::Client::builder()
            .connect_timeout(CONTROL_TIMEOUT)
            .timeout(CONTROL_TIMEOUT)
            .build()?;
        let bulk = reqwest::Client::builder()
            .connect_timeout(BULK_CONNECT_TIMEOUT)
            .timeout(BULK_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { control, bulk })
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn identify(&self, node: &StorageNode) -> TransferResult<NodeIdentity> {
        let response = self
            .control
            .get(node.identity_url())
            .send()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| TransferError::MalformedReply(e.to_string()))?;
        serde_json::from_value(body)
            .map_err(|e| TransferError::MalformedReply(format!("identity reply: {e}")))
    }

    async fn upload(
        &self,
        node: &StorageNode,
        payload: &UploadPayload,
        progress: ProgressCallback,
    ) -> TransferResult<UploadAck> {
        let total = payload.bytes.len() as u64;
        let bytes = payload.bytes.clone();

        // Re-chunk the body so reqwest reports write progress as it streams.
        let counted = futures::stream::iter(
            (0..bytes.len())
                .step_by(UPLOAD_STREAM_CHUNK)
                .map(move |start| {
                    let end = (start + UPLOAD_STREAM_CHUNK).min(bytes.len());
                    Ok::<Bytes, std::io::Error>(bytes.slice(start..end))
                })
                .collect::<Vec<_>>(),
        )
        .inspect({
            let progress = progress.clone();
            let mut sent: u64 = 0;
            move |chunk| {
                if let Ok(chunk) = chunk {
                    sent += chunk.len() as u64;
                    progress(sent, total);
                }
            }
        });

        let file_part = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(counted),
            total,
        )
        .file_name(payload.file_id.clone())
        .mime_str(&payload.mime_type)
        .map_err(|e| TransferError::MalformedReply(e.to_string()))?;

        let form = reqwest::multipart::Form::new()
            .part("filedata", file_part)
            .text("descriptiveName", payload.descriptive_name.clone())
            .text("mimetype", payload.mime_type.clone())
            .text("extension", payload.extension.clone())
            .text("filesize", payload.size.to_string())
            .text("creationdate", payload.created_at.to_string())
            .text("isPrivate", payload.is_private.to_string())
            .text("phoneID", payload.device_id.clone())
            .text("context", payload.context_json.clone());

        let response = self
            .bulk
            .post(node.upload_url())
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransferError::Unreachable(format!(
                "upload status {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TransferError::MalformedReply(e.to_string()))?;
        expect_success(&body)?;
        Ok(UploadAck {
            file_id: payload.file_id.clone(),
        })
    }

    async fn fetch_metadata(
        &self,
        node: &StorageNode,
        file_id: &str,
        device_id: &str,
    ) -> TransferResult<FileMetadata> {
        let response = self
            .control
            .get(node.metadata_url(file_id, device_id))
            .send()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransferError::Unreachable(format!(
                "metadata status {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| TransferError::MalformedReply(e.to_string()))?;
        expect_success(&body)?;

        let metadata = body
            .get("reply")
            .and_then(|r| r.get("metadata"))
            .cloned()
            .ok_or_else(|| TransferError::MalformedReply("reply without metadata".into()))?;
        let mut meta: FileMetadata = serde_json::from_value(metadata)
            .map_err(|e| TransferError::MalformedReply(format!("metadata: {e}")))?;
        meta.node_type = Some(node.node_type);
        Ok(meta)
    }

    async fn download(
        &self,
        node: &StorageNode,
        file_id: &str,
        device_id: &str,
        dest: &Path,
        progress: ProgressCallback,
    ) -> TransferResult<u64> {
        let response = self
            .bulk
            .get(node.download_url(file_id, device_id))
            .send()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransferError::Unreachable(format!(
                "download status {}",
                response.status()
            )));
        }

        let total = response.content_length().unwrap_or(0);
        let mut stream = response.bytes_stream();
        let mut out = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransferError::Unreachable(e.to_string()))?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress(written, total);
        }
        out.flush().await?;
        Ok(written)
    }

    async fn delete_file(
        &self,
        node: &StorageNode,
        file_id: &str,
        device_id: &str,
    ) -> TransferResult<()> {
        let response = self
            .control
            .delete(node.delete_url(file_id, device_id))
            .send()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;

        // A node that no longer knows the file counts as deleted.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| TransferError::MalformedReply(e.to_string()))?;
        expect_success(&body)
    }

    async fn search_files(
        &self,
        node: &StorageNode,
        context_json: &str,
        device_id: &str,
    ) -> TransferResult<Vec<FileMetadata>> {
        let context: Value = serde_json::from_str(context_json)?;
        let response = self
            .control
            .post(node.search_url())
            .json(&serde_json::json!({ "context": context, "phoneID": device_id }))
            .send()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| TransferError::MalformedReply(e.to_string()))?;
        expect_success(&body)?;

        let files = body
            .get("reply")
            .and_then(|r| r.get("files"))
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(files)
            .map_err(|e| TransferError::MalformedReply(format!("search reply: {e}")))
    }
}

/// Checks the `{"error": 0, ...}` envelope every node reply carries.
/// A non-zero error code surfaces the node's `error_msg` when present.
fn expect_success(body: &Value) -> TransferResult<()> {
    match body.get("error").and_then(Value::as_i64) {
        Some(0) => Ok(()),
        Some(_) => {
            let msg = body
                .get("error_msg")
                .and_then(Value::as_str)
                .unwrap_or("(no message)");
            Err(TransferError::Rejected(msg.to_string()))
        }
        None => Err(TransferError::MalformedReply(
            "reply without error field".into(),
        )),
    }
}
