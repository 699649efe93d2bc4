use crate::file::store::FileStore;
use crate::file::types::StoredFile;
use crate::matching::mapper::FileNodeMapper;
use crate::node::registry::NodeRegistry;
use crate::transfer::cancel::CancelFlag;
use crate::transfer::error::{TransferError, TransferResult};
use crate::transfer::events::{Event, EventBus};
use crate::transfer::master::MasterRegistry;
use crate::transfer::transport::{NodeTransport, ProgressCallback, UploadPayload};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_ATTEMPTS: u32 = 3;
const SLEEP_BETWEEN_ATTEMPTS: Duration = Duration::from_secs(5);

/// One queued upload: the multipart payload is built once and reused across
/// target nodes and attempts.
struct UploadJob {
    node_ids: Vec<String>,
    payload: UploadPayload,
}

/// Upload orchestration: an in-memory queue keyed by file id, one worker
/// task per file, sequential node attempts with fixed retry backoff.
///
/// Clones share the queue and running set, so a clone handed to a worker
/// task observes the same state.
#[derive(Clone)]
pub struct Uploader {
    queue: Arc<DashMap<String, UploadJob>>,
    running: Arc<DashMap<String, CancelFlag>>,
    files: FileStore,
    registry: Arc<NodeRegistry>,
    mapper: Arc<FileNodeMapper>,
    master: Arc<dyn MasterRegistry>,
    transport: Arc<dyn NodeTransport>,
    events: EventBus,
    device_id: String,
}

impl Uploader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        files: FileStore,
        registry: Arc<NodeRegistry>,
        mapper: Arc<FileNodeMapper>,
        master: Arc<dyn MasterRegistry>,
        transport: Arc<dyn NodeTransport>,
        events: EventBus,
        device_id: String,
    ) -> Self {
        Self {
            queue: Arc::new(DashMap::new()),
            running: Arc::new(DashMap::new()),
            files,
            registry,
            mapper,
            master,
            transport,
            events,
            device_id,
        }
    }

    /// Adds a file to the upload queue. Idempotent: a file id that is
    /// already queued keeps its existing job.
    pub async fn enqueue(&self, file: &StoredFile) -> TransferResult<()> {
        if self.queue.contains_key(&file.id) {
            return Ok(());
        }
        let payload = UploadPayload::build(file, &self.device_id).await?;
        self.queue.insert(
            file.id.clone(),
            UploadJob {
                node_ids: file.node_ids.clone(),
                payload,
            },
        );
        Ok(())
    }

    /// Re-reads upload-pending files from the persistent store into the
    /// queue (startup recovery and the drain re-check). Returns how many
    /// files are queued afterwards.
    pub async fn restore_pending(&self) -> TransferResult<usize> {
        let pending = self.files.files_to_upload().await.map_err(io_like)?;
        for file in pending {
            // A pending file whose local copy went missing must not block
            // the rest of the queue.
            if let Err(e) = self.enqueue(&file).await {
                tracing::warn!(file = %file.id, error = %e, "re-queueing pending upload failed");
            }
        }
        Ok(self.queue.len())
    }

    /// Starts one worker task for every queued file that is not already
    /// being uploaded. The running-set insert is the atomic claim: two
    /// concurrent callers can never start two workers for one file.
    pub fn start_all(&self) {
        let ids: Vec<String> = self.queue.iter().map(|e| e.key().clone()).collect();
        for file_id in ids {
            let flag = CancelFlag::new();
            match self.running.entry(file_id.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(flag.clone());
                }
            }
            let uploader = self.clone();
            tokio::spawn(async move {
                uploader.run_file(&file_id, flag).await;
                uploader.finish_file(&file_id).await;
            });
        }
    }

    /// Cancels the in-flight upload of a file, releasing its worker slot.
    pub fn cancel(&self, file_id: &str) {
        if let Some(flag) = self.running.get(file_id) {
            flag.cancel();
        }
    }

    pub fn is_running(&self, file_id: &str) -> bool {
        self.running.contains_key(file_id)
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Drives the upload of one file: every target node is attempted in
    /// order, each with bounded retries; a node that fails permanently does
    /// not abort the remaining nodes.
    async fn run_file(&self, file_id: &str, cancel: CancelFlag) {
        let (node_ids, payload) = match self.queue.get(file_id) {
            Some(job) => (job.node_ids.clone(), job.payload.clone()),
            None => return,
        };

        if node_ids.is_empty() {
            self.events.publish(Event::UploadFailedCompletely {
                file_id: file_id.to_string(),
            });
            return;
        }

        let last_percent = Arc::new(AtomicU8::new(0));

        for node_id in &node_ids {
            if cancel.is_cancelled() {
                tracing::info!(file = %file_id, "upload cancelled");
                return;
            }
            let node = match self.registry.get(node_id) {
                Some(node) => node,
                None => {
                    self.events.publish(Event::UploadFailedPermanently {
                        file_id: file_id.to_string(),
                        node_id: node_id.clone(),
                        reason: "node not in registry".to_string(),
                    });
                    continue;
                }
            };

            let mut last_error: Option<TransferError> = None;
            let mut succeeded = false;

            for attempt in 1..=MAX_ATTEMPTS {
                if cancel.is_cancelled() {
                    return;
                }
                self.events.publish(Event::UploadBegin {
                    file_id: file_id.to_string(),
                    node_id: node_id.clone(),
                    attempt,
                });

                let started = Instant::now();
                let progress = self.progress_callback(file_id, last_percent.clone());
                match self.transport.upload(&node, &payload, progress).await {
                    Ok(_) => {
                        self.on_node_success(file_id, node_id, &payload, started).await;
                        succeeded = true;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            file = %file_id,
                            node = %node_id,
                            attempt,
                            error = %e,
                            "upload attempt failed"
                        );
                        self.events.publish(Event::UploadFailed {
                            file_id: file_id.to_string(),
                            node_id: node_id.clone(),
                            attempt,
                            will_retry: attempt < MAX_ATTEMPTS,
                        });
                        last_error = Some(e);
                        if attempt < MAX_ATTEMPTS
                            && cancel.sleep_unless_cancelled(SLEEP_BETWEEN_ATTEMPTS).await
                        {
                            return;
                        }
                    }
                }
            }

            if !succeeded {
                let reason = match &last_error {
                    Some(TransferError::Rejected(msg)) => {
                        // The node actively refused the file: no point in
                        // retrying it on a later pass.
                        let _ = self
                            .files
                            .set_flags(file_id, false, true, false)
                            .await;
                        format!("node replied: {msg}")
                    }
                    Some(e) => e.to_string(),
                    None => "unknown".to_string(),
                };
                self.events.publish(Event::UploadFailedPermanently {
                    file_id: file_id.to_string(),
                    node_id: node_id.clone(),
                    reason,
                });
            }
        }

        // Terminal regardless of per-node outcomes; those are reflected in
        // the per-node events above.
        self.events.publish(Event::UploadDoneCompletely {
            file_id: file_id.to_string(),
        });
    }

    async fn on_node_success(
        &self,
        file_id: &str,
        node_id: &str,
        payload: &UploadPayload,
        started: Instant,
    ) {
        if let Err(e) = self.files.set_flags(file_id, false, false, false).await {
            // The node accepted the file; a local flag-write failure must
            // not undo that. Surfaced separately, not swallowed.
            tracing::error!(file = %file_id, error = %e, "flag update after upload failed");
        }

        self.mapper.add_mapping(file_id, node_id);
        if let Err(e) = self.master.post_file_node_mapping(file_id, node_id).await {
            tracing::warn!(file = %file_id, node = %node_id, error = %e, "mapping registration failed");
            self.events.publish(Event::MappingUpdateFailed {
                file_id: file_id.to_string(),
                node_id: node_id.to_string(),
            });
        }

        let elapsed_ms = started.elapsed().as_millis().max(1) as u64;
        self.events.publish(Event::UploadDone {
            file_id: file_id.to_string(),
            node_id: node_id.to_string(),
            elapsed_ms,
            bytes_per_second: payload.size * 1000 / elapsed_ms,
        });
    }

    /// Progress reporting is monotonically increasing per file; duplicate or
    /// backward percentages are suppressed.
    fn progress_callback(&self, file_id: &str, last: Arc<AtomicU8>) -> ProgressCallback {
        let events = self.events.clone();
        let file_id = file_id.to_string();
        Arc::new(move |sent, total| {
            if total == 0 {
                return;
            }
            let percent = ((sent as f64 / total as f64) * 100.0) as u8;
            let percent = percent.min(100);
            let previous = last.load(Ordering::Relaxed);
            if percent > previous
                && last
                    .compare_exchange(previous, percent, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                events.publish(Event::UploadProgress {
                    file_id: file_id.clone(),
                    percent,
                });
            }
        })
    }

    /// Post-worker bookkeeping: drop the job, and when the queue drains,
    /// re-check the persistent pending set before declaring all done.
    async fn finish_file(&self, file_id: &str) {
        self.queue.remove(file_id);
        self.running.remove(file_id);

        if self.queue.is_empty() {
            match self.restore_pending().await {
                Ok(0) => self.events.publish(Event::AllUploadsDone),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "pending re-check failed"),
            }
        }
    }
}

fn io_like(e: crate::file::FileError) -> TransferError {
    match e {
        crate::file::FileError::Store(e) => TransferError::Store(e),
        crate::file::FileError::Serialization(e) => TransferError::Serialization(e),
        crate::file::FileError::Io(e) => TransferError::Io(e),
        other => TransferError::MalformedReply(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileMetadata;
    use crate::node::store::NodeStore;
    use crate::node::{NodeIdentity, NodeType, StorageNode};
    use crate::test_support::memory_pool;
    use crate::transfer::transport::UploadAck;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::Path;

    /// Scriptable transport: per-node queues of upload outcomes.
    #[derive(Default)]
    struct ScriptedTransport {
        upload_outcomes: Mutex<HashMap<String, Vec<TransferResult<UploadAck>>>>,
        upload_calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn script_upload(&self, node_id: &str, outcomes: Vec<TransferResult<UploadAck>>) {
            self.upload_outcomes
                .lock()
                .insert(node_id.to_string(), outcomes);
        }

        fn calls(&self) -> Vec<String> {
            self.upload_calls.lock().clone()
        }
    }

    #[async_trait]
    impl NodeTransport for ScriptedTransport {
        async fn identify(&self, _node: &StorageNode) -> TransferResult<NodeIdentity> {
            Err(TransferError::Unreachable("not scripted".into()))
        }

        async fn upload(
            &self,
            node: &StorageNode,
            payload: &UploadPayload,
            progress: ProgressCallback,
        ) -> TransferResult<UploadAck> {
            self.upload_calls.lock().push(node.id.clone());
            progress(payload.size / 2, payload.size);
            progress(payload.size, payload.size);
            let mut outcomes = self.upload_outcomes.lock();
            match outcomes.get_mut(&node.id) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => Err(TransferError::Unreachable("unscripted".into())),
            }
        }

        async fn fetch_metadata(
            &self,
            _node: &StorageNode,
            _file_id: &str,
            _device_id: &str,
        ) -> TransferResult<FileMetadata> {
            Err(TransferError::Unreachable("not scripted".into()))
        }

        async fn download(
            &self,
            _node: &StorageNode,
            _file_id: &str,
            _device_id: &str,
            _dest: &Path,
            _progress: ProgressCallback,
        ) -> TransferResult<u64> {
            Err(TransferError::Unreachable("not scripted".into()))
        }

        async fn delete_file(
            &self,
            _node: &StorageNode,
            _file_id: &str,
            _device_id: &str,
        ) -> TransferResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingMaster {
        posted: Mutex<Vec<(String, String)>>,
        fail_posts: bool,
    }

    #[async_trait]
    impl MasterRegistry for RecordingMaster {
        async fn file_node_mapping(&self, _file_id: &str) -> TransferResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn post_file_node_mapping(
            &self,
            file_id: &str,
            node_id: &str,
        ) -> TransferResult<()> {
            if self.fail_posts {
                return Err(TransferError::Unreachable("master down".into()));
            }
            self.posted
                .lock()
                .push((file_id.to_string(), node_id.to_string()));
            Ok(())
        }
        async fn delete_file_node_mapping(&self, _file_id: &str) -> TransferResult<()> {
            Ok(())
        }
        async fn storage_node_list(&self) -> TransferResult<Vec<StorageNode>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        uploader: Arc<Uploader>,
        transport: Arc<ScriptedTransport>,
        master: Arc<RecordingMaster>,
        files: FileStore,
        events: EventBus,
        _dir: tempfile::TempDir,
    }

    async fn fixture(fail_master: bool) -> Fixture {
        let pool = memory_pool().await;
        let files = FileStore::new(pool.clone()).await.unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let registry = Arc::new(NodeRegistry::new(
            NodeStore::new(pool.clone()).await.unwrap(),
            transport.clone(),
        ));
        registry
            .add_node(StorageNode::new("node-1", "10.0.0.1", 8080, NodeType::Cloudlet))
            .await
            .unwrap();
        registry
            .add_node(StorageNode::new("node-2", "10.0.0.2", 8080, NodeType::Cloud))
            .await
            .unwrap();

        let master = Arc::new(RecordingMaster {
            fail_posts: fail_master,
            ..Default::default()
        });
        let events = EventBus::new();
        let dir = tempfile::tempdir().unwrap();

        let uploader = Arc::new(Uploader::new(
            files.clone(),
            registry,
            Arc::new(FileNodeMapper::new()),
            master.clone(),
            transport.clone(),
            events.clone(),
            "device-1".into(),
        ));

        Fixture {
            uploader,
            transport,
            master,
            files,
            events,
            _dir: dir,
        }
    }

    async fn make_file(fx: &Fixture, id: &str, nodes: &[&str]) -> StoredFile {
        let path = fx._dir.path().join(format!("{id}.bin"));
        tokio::fs::write(&path, vec![7u8; 1024]).await.unwrap();
        let mut f = StoredFile::new(id, &format!("{id}.bin"), "bin", &path);
        f.size = 1024;
        f.content_hash = format!("hash-{id}");
        for n in nodes {
            f.add_node_id(n);
        }
        fx.files.insert(&f).await.unwrap();
        f
    }

    /// Collects events until (and including) the first one `done` accepts.
    async fn drain_until(
        rx: &mut tokio::sync::broadcast::Receiver<Event>,
        done: impl Fn(&Event) -> bool,
    ) -> Vec<Event> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
                .await
                .expect("event stream stalled")
                .expect("event channel closed");
            let stop = done(&event);
            seen.push(event);
            if stop {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_single_node_success() {
        let fx = fixture(false).await;
        let file = make_file(&fx, "f1", &["node-1"]).await;
        fx.transport
            .script_upload("node-1", vec![Ok(UploadAck::default())]);

        let mut rx = fx.events.subscribe();
        fx.uploader.enqueue(&file).await.unwrap();
        fx.uploader.start_all();

        let events =
            drain_until(&mut rx, |e| matches!(e, Event::AllUploadsDone)).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::UploadDone { node_id, .. } if node_id == "node-1")));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::UploadDoneCompletely { .. })));

        let stored = fx.files.get("f1").await.unwrap().unwrap();
        assert!(!stored.upload_pending);
        assert!(!stored.upload_failed);
        assert_eq!(
            fx.master.posted.lock().clone(),
            vec![("f1".to_string(), "node-1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failing_node_then_succeeding_node() {
        let fx = fixture(false).await;
        let file = make_file(&fx, "f1", &["node-1", "node-2"]).await;
        // Node 1 fails all three attempts, node 2 succeeds immediately.
        fx.transport.script_upload(
            "node-1",
            vec![
                Err(TransferError::Unreachable("500".into())),
                Err(TransferError::Unreachable("500".into())),
                Err(TransferError::Unreachable("500".into())),
            ],
        );
        fx.transport
            .script_upload("node-2", vec![Ok(UploadAck::default())]);

        let mut rx = fx.events.subscribe();
        fx.uploader.enqueue(&file).await.unwrap();
        fx.uploader.start_all();

        let events =
            drain_until(&mut rx, |e| matches!(e, Event::UploadDoneCompletely { .. })).await;

        let begins: Vec<(String, u32)> = events
            .iter()
            .filter_map(|e| match e {
                Event::UploadBegin {
                    node_id, attempt, ..
                } => Some((node_id.clone(), *attempt)),
                _ => None,
            })
            .collect();
        assert_eq!(
            begins,
            vec![
                ("node-1".to_string(), 1),
                ("node-1".to_string(), 2),
                ("node-1".to_string(), 3),
                ("node-2".to_string(), 1),
            ]
        );

        assert!(events.iter().any(
            |e| matches!(e, Event::UploadFailedPermanently { node_id, .. } if node_id == "node-1")
        ));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::UploadDone { node_id, .. } if node_id == "node-2")));
        assert_eq!(fx.transport.calls(), vec!["node-1", "node-1", "node-1", "node-2"]);
    }

    #[tokio::test]
    async fn test_no_target_nodes_fails_completely() {
        let fx = fixture(false).await;
        let file = make_file(&fx, "f1", &[]).await;

        let mut rx = fx.events.subscribe();
        fx.uploader.enqueue(&file).await.unwrap();
        fx.uploader.start_all();

        let events =
            drain_until(&mut rx, |e| matches!(e, Event::UploadFailedCompletely { .. })).await;
        assert!(events
            .iter()
            .all(|e| !matches!(e, Event::UploadBegin { .. })));
        assert!(fx.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let fx = fixture(false).await;
        let file = make_file(&fx, "f1", &["node-1"]).await;
        fx.uploader.enqueue(&file).await.unwrap();
        fx.uploader.enqueue(&file).await.unwrap();
        assert_eq!(fx.uploader.queued_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_upload_marks_failed_flag() {
        let fx = fixture(false).await;
        let file = make_file(&fx, "f1", &["node-1"]).await;
        fx.transport.script_upload(
            "node-1",
            vec![
                Err(TransferError::Rejected("quota exceeded".into())),
                Err(TransferError::Rejected("quota exceeded".into())),
                Err(TransferError::Rejected("quota exceeded".into())),
            ],
        );

        let mut rx = fx.events.subscribe();
        fx.uploader.enqueue(&file).await.unwrap();
        fx.uploader.start_all();

        drain_until(&mut rx, |e| matches!(e, Event::UploadDoneCompletely { .. })).await;

        let stored = fx.files.get("f1").await.unwrap().unwrap();
        assert!(!stored.upload_pending);
        assert!(stored.upload_failed);
    }

    #[tokio::test]
    async fn test_mapping_failure_does_not_roll_back_upload() {
        let fx = fixture(true).await;
        let file = make_file(&fx, "f1", &["node-1"]).await;
        fx.transport
            .script_upload("node-1", vec![Ok(UploadAck::default())]);

        let mut rx = fx.events.subscribe();
        fx.uploader.enqueue(&file).await.unwrap();
        fx.uploader.start_all();

        let events =
            drain_until(&mut rx, |e| matches!(e, Event::UploadDoneCompletely { .. })).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::MappingUpdateFailed { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::UploadDone { .. })));

        let stored = fx.files.get("f1").await.unwrap().unwrap();
        assert!(!stored.upload_pending);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let fx = fixture(false).await;
        let file = make_file(&fx, "f1", &["node-1"]).await;
        fx.transport.script_upload(
            "node-1",
            vec![
                Err(TransferError::Unreachable("drop".into())),
                Ok(UploadAck::default()),
            ],
        );

        let mut rx = fx.events.subscribe();
        fx.uploader.enqueue(&file).await.unwrap();
        fx.uploader.start_all();

        let events =
            drain_until(&mut rx, |e| matches!(e, Event::UploadDoneCompletely { .. })).await;
        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                Event::UploadProgress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        // The retry re-streams the body; repeated percentages must have
        // been suppressed.
        assert_eq!(percents, vec![50, 100]);
    }
}
