use crate::file::types::FileMetadata;
use crate::matching::types::MatchingMode;
use std::path::PathBuf;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Named events emitted by the framework. External subscribers (logging, a
/// UI) consume them; delivery is fire-and-forget and never confirmed.
#[derive(Debug, Clone)]
pub enum Event {
    MatchingStarted {
        file_id: String,
        mode: MatchingMode,
    },
    MatchingNodeDecided {
        file_id: String,
        node_ids: Vec<String>,
    },
    MatchingRuleUsed {
        file_id: String,
        rule_id: String,
        layer_index: Option<usize>,
    },

    UploadBegin {
        file_id: String,
        node_id: String,
        attempt: u32,
    },
    UploadProgress {
        file_id: String,
        percent: u8,
    },
    /// One node accepted the file; carries timing for the transfer log.
    UploadDone {
        file_id: String,
        node_id: String,
        elapsed_ms: u64,
        bytes_per_second: u64,
    },
    /// A single attempt failed and will be retried.
    UploadFailed {
        file_id: String,
        node_id: String,
        attempt: u32,
        will_retry: bool,
    },
    /// All attempts against one node are exhausted.
    UploadFailedPermanently {
        file_id: String,
        node_id: String,
        reason: String,
    },
    /// The file could not be handed to any node at all.
    UploadFailedCompletely {
        file_id: String,
    },
    /// Every target node of the file has been attempted (success or not is
    /// reflected in the earlier per-node events).
    UploadDoneCompletely {
        file_id: String,
    },
    /// The upload queue drained and no pending uploads remain.
    AllUploadsDone,

    /// Registering a file/node mapping after a successful upload failed.
    /// The upload itself stands; this is a separate inconsistency signal.
    MappingUpdateFailed {
        file_id: String,
        node_id: String,
    },

    MetadataReady {
        file_id: String,
        metadata: FileMetadata,
    },
    MetadataFailed {
        file_id: String,
    },
    DownloadStart {
        file_id: String,
        node_id: String,
    },
    DownloadProgress {
        file_id: String,
        request_id: String,
        percent: u8,
    },
    DownloadedFileReady {
        file_id: String,
        request_id: String,
        path: PathBuf,
    },
    DownloadFailed {
        file_id: String,
    },

    FileDeleted {
        file_id: String,
    },
    FilesMatchingContext {
        request_id: String,
        node_id: String,
        files: Vec<FileMetadata>,
    },
}

/// Fire-and-forget broadcast of framework events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
