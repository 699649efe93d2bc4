use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    /// Network-level failure talking to a node. Never fatal to the overall
    /// operation; callers fall back to the next candidate.
    #[error("node unreachable: {0}")]
    Unreachable(String),

    /// The node answered, but not in the expected shape. Treated like
    /// `Unreachable` for control flow.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// The node answered well-formed but flagged the request as failed.
    #[error("node rejected request: {0}")]
    Rejected(String),

    #[error("no candidate node holds file {0}")]
    NoCandidates(String),

    #[error("transfer for {0} is already in flight")]
    AlreadyInFlight(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransferError {
    /// Failures that advance to the next candidate node instead of aborting.
    pub fn is_node_local(&self) -> bool {
        matches!(
            self,
            TransferError::Unreachable(_)
                | TransferError::MalformedReply(_)
                | TransferError::Rejected(_)
                | TransferError::Http(_)
        )
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
