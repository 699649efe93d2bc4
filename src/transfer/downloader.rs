use crate::file::store::FileStore;
use crate::file::types::{FileMetadata, StoredFile};
use crate::matching::mapper::FileNodeMapper;
use crate::node::metric::rank_by_distance_metric;
use crate::node::registry::NodeRegistry;
use crate::node::types::StorageNode;
use crate::transfer::cancel::CancelFlag;
use crate::transfer::error::{TransferError, TransferResult};
use crate::transfer::events::{Event, EventBus};
use crate::transfer::guard::InFlightGuard;
use crate::transfer::master::MasterRegistry;
use crate::transfer::transport::{NodeTransport, ProgressCallback};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bound on the metadata round trip; a node that never answers must not
/// hang the download worker.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// How the node(s) to download from are resolved.
#[derive(Debug, Clone)]
pub enum DownloadMode {
    /// Single attempt against one caller-specified node.
    FromSpecifiedNode(Box<StorageNode>),
    /// Resolve candidates from the local file/node mapping (falling back to
    /// the master registry) and attempt them in distance-metric order.
    BasedOnMetric,
}

/// Download orchestration: per-file worker tasks guarded by the persisted
/// at-most-one-in-flight set.
///
/// Clones share the guard and running set, so a clone handed to a worker
/// task observes the same state.
#[derive(Clone)]
pub struct Downloader {
    guard: Arc<InFlightGuard>,
    registry: Arc<NodeRegistry>,
    mapper: Arc<FileNodeMapper>,
    master: Arc<dyn MasterRegistry>,
    transport: Arc<dyn NodeTransport>,
    files: FileStore,
    events: EventBus,
    device_id: String,
    target_dir: PathBuf,
    running: Arc<DashMap<String, CancelFlag>>,
}

impl Downloader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guard: Arc<InFlightGuard>,
        registry: Arc<NodeRegistry>,
        mapper: Arc<FileNodeMapper>,
        master: Arc<dyn MasterRegistry>,
        transport: Arc<dyn NodeTransport>,
        files: FileStore,
        events: EventBus,
        device_id: String,
        target_dir: PathBuf,
    ) -> Self {
        Self {
            guard,
            registry,
            mapper,
            master,
            transport,
            files,
            events,
            device_id,
            target_dir,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Requests a download. Returns false (without starting anything) when
    /// a download for this file id is already in flight; true when a worker
    /// was started.
    pub async fn request(
        &self,
        file_id: &str,
        mode: DownloadMode,
        request_id: &str,
        dir: Option<PathBuf>,
    ) -> TransferResult<bool> {
        if file_id.trim().is_empty() {
            return Err(TransferError::NoCandidates("empty file id".into()));
        }
        if !self.guard.try_begin(file_id).await? {
            tracing::debug!(file = %file_id, "download already in flight, skipping");
            return Ok(false);
        }

        let cancel = CancelFlag::new();
        self.running.insert(file_id.to_string(), cancel.clone());

        let downloader = self.clone();
        let file_id = file_id.to_string();
        let request_id = if request_id.is_empty() {
            "FileDownload".to_string()
        } else {
            request_id.to_string()
        };
        tokio::spawn(async move {
            let outcome = downloader
                .run_download(&file_id, mode, &request_id, dir, cancel)
                .await;
            // The guard is released exactly once, on success, failure and
            // cancellation alike.
            if let Err(e) = downloader.guard.finish(&file_id).await {
                tracing::error!(file = %file_id, error = %e, "guard release failed");
            }
            downloader.running.remove(&file_id);

            match outcome {
                Ok(path) => downloader.events.publish(Event::DownloadedFileReady {
                    file_id,
                    request_id,
                    path,
                }),
                Err(TransferError::Cancelled) => {
                    tracing::info!(file = %file_id, "download cancelled");
                }
                Err(e) => {
                    tracing::warn!(file = %file_id, error = %e, "download failed");
                    downloader
                        .events
                        .publish(Event::DownloadFailed { file_id });
                }
            }
        });
        Ok(true)
    }

    /// Cancels an in-flight download and frees its guard slot.
    pub fn cancel(&self, file_id: &str) {
        if let Some(flag) = self.running.get(file_id) {
            flag.cancel();
        }
    }

    async fn run_download(
        &self,
        file_id: &str,
        mode: DownloadMode,
        request_id: &str,
        dir: Option<PathBuf>,
        cancel: CancelFlag,
    ) -> TransferResult<PathBuf> {
        let candidates = match mode {
            DownloadMode::FromSpecifiedNode(node) => vec![*node],
            DownloadMode::BasedOnMetric => self.resolve_candidates(file_id).await?,
        };
        if candidates.is_empty() {
            return Err(TransferError::NoCandidates(file_id.to_string()));
        }

        let target_dir = dir.unwrap_or_else(|| self.target_dir.clone());
        let mut last_error = TransferError::NoCandidates(file_id.to_string());

        for node in candidates {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            match self
                .attempt(file_id, &node, request_id, &target_dir)
                .await
            {
                Ok(path) => return Ok(path),
                // A metadata or transfer failure on one node just advances
                // to the next candidate.
                Err(e) if e.is_node_local() => {
                    tracing::debug!(file = %file_id, node = %node.id, error = %e, "candidate failed");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Candidate nodes in attempt order: the local mapping first, the
    /// master registry as fallback, ranked by the distance metric when more
    /// than one node holds the file.
    async fn resolve_candidates(&self, file_id: &str) -> TransferResult<Vec<StorageNode>> {
        let mut node_ids = self.mapper.node_ids(file_id);
        if node_ids.is_empty() {
            node_ids = self.master.file_node_mapping(file_id).await?;
        }
        if node_ids.is_empty() {
            return Err(TransferError::NoCandidates(file_id.to_string()));
        }

        let nodes: Vec<StorageNode> = node_ids
            .iter()
            .filter_map(|id| self.registry.get(id))
            .collect();

        if nodes.len() <= 1 {
            return Ok(nodes);
        }
        Ok(rank_by_distance_metric(nodes))
    }

    /// One attempt against one node: metadata first (its failure aborts the
    /// attempt before the bulk transfer), then the body stream.
    async fn attempt(
        &self,
        file_id: &str,
        node: &StorageNode,
        request_id: &str,
        target_dir: &PathBuf,
    ) -> TransferResult<PathBuf> {
        let metadata = match tokio::time::timeout(
            METADATA_TIMEOUT,
            self.transport.fetch_metadata(node, file_id, &self.device_id),
        )
        .await
        {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(e)) => {
                self.events.publish(Event::MetadataFailed {
                    file_id: file_id.to_string(),
                });
                return Err(e);
            }
            Err(_) => {
                self.events.publish(Event::MetadataFailed {
                    file_id: file_id.to_string(),
                });
                return Err(TransferError::Unreachable("metadata timeout".into()));
            }
        };
        self.events.publish(Event::MetadataReady {
            file_id: file_id.to_string(),
            metadata: metadata.clone(),
        });
        self.events.publish(Event::DownloadStart {
            file_id: file_id.to_string(),
            node_id: node.id.clone(),
        });

        let dest = target_dir.join(format!("{}.{}", file_id, metadata.extension));
        let progress = self.progress_callback(file_id, request_id, metadata.filesize);
        self.transport
            .download(node, file_id, &self.device_id, &dest, progress)
            .await?;

        self.register_downloaded(file_id, &metadata, &dest).await;
        Ok(dest)
    }

    /// Adds the downloaded file to the local view of known files.
    async fn register_downloaded(&self, file_id: &str, metadata: &FileMetadata, dest: &PathBuf) {
        let mut file = StoredFile::new(
            file_id,
            &metadata.descriptive_name,
            &metadata.extension,
            dest,
        );
        file.mime_type = metadata.mime_type.clone();
        file.size = metadata.filesize;
        file.created_at = metadata.creation_timestamp;
        file.is_private = metadata.is_private;
        file.upload_pending = false;
        if let Err(e) = self.files.insert(&file).await {
            tracing::warn!(file = %file_id, error = %e, "registering downloaded file failed");
        }
    }

    fn progress_callback(
        &self,
        file_id: &str,
        request_id: &str,
        total_hint: u64,
    ) -> ProgressCallback {
        let events = self.events.clone();
        let file_id = file_id.to_string();
        let request_id = request_id.to_string();
        let last = AtomicU8::new(0);
        Arc::new(move |received, total| {
            let total = if total > 0 { total } else { total_hint };
            if total == 0 {
                return;
            }
            let percent = (((received as f64 / total as f64) * 100.0) as u8).min(100);
            let previous = last.load(Ordering::Relaxed);
            if percent > previous
                && last
                    .compare_exchange(previous, percent, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                events.publish(Event::DownloadProgress {
                    file_id: file_id.clone(),
                    request_id: request_id.clone(),
                    percent,
                });
            }
        })
    }
}
