use thiserror::Error;

/// Errors surfaced synchronously by `store()` and the other framework entry
/// points. Everything after the storage decision is asynchronous; failures
/// there are visible only via events.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A required argument was missing or unusable. Fails fast, before any
    /// I/O happens.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The same content (by hash) is already stored. Raised before any node
    /// is contacted; the local copy made for this attempt is cleaned up.
    #[error("a file with identical content is already stored")]
    DuplicateContent,

    /// The local persistent store failed; the current operation is aborted
    /// and any file copied into the store directory is removed.
    #[error("storage backend error: {0}")]
    StorageBackend(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    File(#[from] crate::file::FileError),

    #[error(transparent)]
    Rule(#[from] crate::rule::RuleError),

    #[error(transparent)]
    Node(#[from] crate::node::NodeError),

    #[error(transparent)]
    Matching(#[from] crate::matching::MatchError),

    #[error(transparent)]
    Transfer(#[from] crate::transfer::TransferError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
