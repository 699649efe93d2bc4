use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("rule not found: {0}")]
    NotFound(String),

    #[error("invalid rule: {0}")]
    Invalid(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type RuleResult<T> = Result<T, RuleError>;
