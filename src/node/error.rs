use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("node unreachable: {0}")]
    Unreachable(String),

    #[error("malformed reply from node: {0}")]
    MalformedReply(String),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("invalid node: {0}")]
    Invalid(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type NodeResult<T> = Result<T, NodeError>;
