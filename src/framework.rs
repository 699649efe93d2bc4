use crate::config::FrameworkConfig;
use crate::context::types::UsageContext;
use crate::error::{StoreError, StoreResult};
use crate::file::store::FileStore;
use crate::file::types::{mime_for_extension, StoredFile};
use crate::identity;
use crate::matching::clock::SystemClock;
use crate::matching::engine::MatchingEngine;
use crate::matching::mapper::FileNodeMapper;
use crate::matching::types::MatchingMode;
use crate::node::registry::NodeRegistry;
use crate::node::store::NodeStore;
use crate::node::types::StorageNode;
use crate::rule::store::RuleStore;
use crate::transfer::deleter;
use crate::transfer::downloader::{DownloadMode, Downloader};
use crate::transfer::events::{Event, EventBus};
use crate::transfer::guard::InFlightGuard;
use crate::transfer::master::{HttpMasterRegistry, MasterRegistry};
use crate::transfer::transport::{HttpTransport, NodeTransport};
use crate::transfer::uploader::Uploader;
use parking_lot::RwLock;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Top-level handle of the virtual storage framework. All components are
/// explicitly constructed and wired here; the instance owns their
/// lifecycle from `open` to `close`.
pub struct ContextStore {
    config: FrameworkConfig,
    pool: SqlitePool,
    device_id: String,
    events: EventBus,
    files: FileStore,
    rules: RuleStore,
    registry: Arc<NodeRegistry>,
    mapper: Arc<FileNodeMapper>,
    engine: MatchingEngine,
    uploader: Arc<Uploader>,
    downloader: Arc<Downloader>,
    guard: Arc<InFlightGuard>,
    master: Arc<dyn MasterRegistry>,
    transport: Arc<dyn NodeTransport>,
    current_context: RwLock<UsageContext>,
}

impl ContextStore {
    /// Opens a framework instance with the production HTTP transport and
    /// master-registry client.
    pub async fn open(config: FrameworkConfig) -> StoreResult<Self> {
        let transport: Arc<dyn NodeTransport> = Arc::new(HttpTransport::new()?);
        let master: Arc<dyn MasterRegistry> =
            Arc::new(HttpMasterRegistry::new(&config.master_url)?);
        Self::open_with(config, transport, master).await
    }

    /// Opens a framework instance with injected collaborators (tests swap
    /// in scripted transports here).
    pub async fn open_with(
        config: FrameworkConfig,
        transport: Arc<dyn NodeTransport>,
        master: Arc<dyn MasterRegistry>,
    ) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.base_dir)?;
        std::fs::create_dir_all(config.stored_files_dir())?;
        std::fs::create_dir_all(config.downloads_dir())?;

        let db_url = config.database_url();
        let pool = if db_url.contains(":memory:") {
            // A pooled in-memory database would hand every connection its
            // own empty schema.
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect(&db_url)
                .await?
        } else {
            SqlitePool::connect(&db_url).await?
        };

        let device_id = identity::device_id(&config.base_dir)?;
        let events = EventBus::new();

        let files = FileStore::new(pool.clone()).await?;
        let rules = RuleStore::new(pool.clone()).await?;
        let node_store = NodeStore::new(pool.clone()).await?;
        let guard = Arc::new(InFlightGuard::new(pool.clone()).await?);

        let registry = Arc::new(NodeRegistry::new(node_store, transport.clone()));
        registry.load_from_store().await?;

        let mapper = Arc::new(FileNodeMapper::new());
        let engine = MatchingEngine::new(
            registry.clone(),
            rules.clone(),
            Arc::new(SystemClock),
            events.clone(),
        );

        let uploader = Arc::new(Uploader::new(
            files.clone(),
            registry.clone(),
            mapper.clone(),
            master.clone(),
            transport.clone(),
            events.clone(),
            device_id.clone(),
        ));
        let downloader = Arc::new(Downloader::new(
            guard.clone(),
            registry.clone(),
            mapper.clone(),
            master.clone(),
            transport.clone(),
            files.clone(),
            events.clone(),
            device_id.clone(),
            config.downloads_dir(),
        ));

        let current_context = RwLock::new(load_context_snapshot(&config));

        let store = Self {
            config,
            pool,
            device_id,
            events,
            files,
            rules,
            registry,
            mapper,
            engine,
            uploader,
            downloader,
            guard,
            master,
            transport,
            current_context,
        };

        // Uploads interrupted by a restart go back into the queue; the
        // caller decides when to start them.
        store.uploader.restore_pending().await?;
        tracing::info!(device = %store.device_id, "framework opened");
        Ok(store)
    }

    /// Stores a file: copies it into the framework, rejects duplicate
    /// content, makes the node decision and schedules the background
    /// upload. Returns as soon as the decision is persisted.
    ///
    /// Only pre-decision failures are returned as errors; upload failures
    /// surface via events.
    pub async fn store(&self, file_path: &Path, is_private: bool) -> StoreResult<StoredFile> {
        if file_path.as_os_str().is_empty() {
            return Err(StoreError::Validation("file path must not be empty".into()));
        }
        if !file_path.is_file() {
            return Err(StoreError::Validation(format!(
                "not a file: {}",
                file_path.display()
            )));
        }

        let file_id = uuid::Uuid::new_v4().to_string();
        let descriptive_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let extension = file_path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();

        // Copy into the framework directory as <uuid>.<ext> first; all
        // failure paths from here on must remove this copy.
        let local_path = self
            .config
            .stored_files_dir()
            .join(format!("{file_id}.{extension}"));
        tokio::fs::copy(file_path, &local_path).await?;

        let result = self
            .store_copied(file_id, descriptive_name, extension, &local_path, is_private)
            .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&local_path).await;
        }
        result
    }

    async fn store_copied(
        &self,
        file_id: String,
        descriptive_name: String,
        extension: String,
        local_path: &Path,
        is_private: bool,
    ) -> StoreResult<StoredFile> {
        let content = tokio::fs::read(local_path).await?;
        let content_hash = blake3::hash(&content).to_hex().to_string();
        if self.files.is_content_stored(&content_hash).await? {
            return Err(StoreError::DuplicateContent);
        }

        let mut file = StoredFile::new(&file_id, &descriptive_name, &extension, local_path);
        file.mime_type = mime_for_extension(&extension).to_string();
        file.size = content.len() as u64;
        file.content_hash = content_hash;
        file.is_private = is_private;
        file.context = Some(self.current_context.read().clone());

        let decision = self.engine.decide(&file, self.config.matching_mode).await?;

        if decision.has_nodes() {
            for node_id in decision.node_ids() {
                file.add_node_id(&node_id);
            }
            self.files.insert(&file).await?;
            self.uploader.enqueue(&file).await?;
            self.uploader.start_all();
        } else {
            // No node decided: a valid outcome, the file stays local.
            file.upload_pending = false;
            self.files.insert(&file).await?;
        }

        tracing::info!(
            file = %file.id,
            nodes = file.node_ids.len(),
            "file stored"
        );
        Ok(file)
    }

    /// Requests a download of the given file, resolving candidate nodes by
    /// the distance metric. Returns false when the file is already being
    /// downloaded.
    pub async fn request_file(
        &self,
        file_id: &str,
        request_id: &str,
        dir: Option<PathBuf>,
    ) -> StoreResult<bool> {
        Ok(self
            .downloader
            .request(file_id, DownloadMode::BasedOnMetric, request_id, dir)
            .await?)
    }

    /// Requests a download from one specific node.
    pub async fn request_file_from_node(
        &self,
        file_id: &str,
        node_id: &str,
        request_id: &str,
        dir: Option<PathBuf>,
    ) -> StoreResult<bool> {
        let node = self
            .registry
            .get(node_id)
            .ok_or_else(|| StoreError::Validation(format!("unknown node: {node_id}")))?;
        Ok(self
            .downloader
            .request(
                file_id,
                DownloadMode::FromSpecifiedNode(Box::new(node)),
                request_id,
                dir,
            )
            .await?)
    }

    /// Marks a file for deletion and runs a deletion pass.
    pub async fn delete_file(&self, file_id: &str) -> StoreResult<()> {
        let file = self
            .files
            .get(file_id)
            .await?
            .ok_or_else(|| StoreError::Validation(format!("unknown file: {file_id}")))?;
        self.files
            .set_flags(&file.id, false, file.upload_failed, true)
            .await?;
        deleter::run_pending_deletions(
            &self.files,
            &self.registry,
            &self.mapper,
            &self.master,
            &self.transport,
            &self.events,
            &self.device_id,
        )
        .await?;
        Ok(())
    }

    /// Queries every known node for files matching the given context. The
    /// file/node mapping cache always restarts empty for a new search.
    pub async fn request_files_matching_context(
        &self,
        context: &UsageContext,
        request_id: &str,
    ) -> StoreResult<bool> {
        let nodes = self.registry.all_nodes();
        if nodes.is_empty() {
            return Ok(false);
        }
        self.mapper.clear();

        let context_json = context.to_json()?;
        for node in nodes {
            let transport = self.transport.clone();
            let events = self.events.clone();
            let mapper = self.mapper.clone();
            let device_id = self.device_id.clone();
            let request_id = request_id.to_string();
            let context_json = context_json.clone();
            tokio::spawn(async move {
                match transport
                    .search_files(&node, &context_json, &device_id)
                    .await
                {
                    Ok(found) => {
                        for meta in &found {
                            mapper.add_mapping(&meta.uuid, &node.id);
                        }
                        events.publish(Event::FilesMatchingContext {
                            request_id,
                            node_id: node.id.clone(),
                            files: found,
                        });
                    }
                    Err(e) => {
                        tracing::debug!(node = %node.id, error = %e, "context search failed");
                    }
                }
            });
        }
        Ok(true)
    }

    /// Re-seeds the node registry from the master registry's node list.
    pub async fn refresh_nodes_from_master(&self) -> StoreResult<usize> {
        let nodes = self.master.storage_node_list().await?;
        let count = nodes.len();
        for node in nodes {
            self.registry.import_node(node).await?;
        }
        Ok(count)
    }

    /// Provides a fresh usage-context snapshot for subsequent store calls.
    pub fn provide_context(&self, context: UsageContext) {
        *self.current_context.write() = context;
    }

    pub fn current_context(&self) -> UsageContext {
        self.current_context.read().clone()
    }

    /// Persists (or removes) the current context snapshot so it survives a
    /// restart.
    pub fn persist_context(&self, persistent: bool) -> StoreResult<()> {
        let path = self.config.context_snapshot_path();
        if persistent {
            let json = self.current_context.read().to_json()?;
            std::fs::write(path, json)?;
        } else if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn cancel_upload(&self, file_id: &str) {
        self.uploader.cancel(file_id);
    }

    pub fn cancel_download(&self, file_id: &str) {
        self.downloader.cancel(file_id);
    }

    /// Starts upload workers for everything in the queue.
    pub fn start_uploads(&self) {
        self.uploader.start_all();
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub async fn add_node(&self, candidate: StorageNode) -> StoreResult<StorageNode> {
        Ok(self.registry.add_node(candidate).await?)
    }

    pub fn matching_mode(&self) -> MatchingMode {
        self.config.matching_mode
    }

    /// Clean shutdown: releases all in-flight guard slots and closes the
    /// database pool.
    pub async fn close(&self) -> StoreResult<()> {
        self.guard.clear().await?;
        self.pool.close().await;
        Ok(())
    }
}

fn load_context_snapshot(config: &FrameworkConfig) -> UsageContext {
    match std::fs::read_to_string(config.context_snapshot_path()) {
        Ok(json) => UsageContext::from_json(&json).unwrap_or_default(),
        Err(_) => UsageContext::default(),
    }
}
