use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("rule error: {0}")]
    Rule(#[from] crate::rule::RuleError),
}

pub type MatchResult<T> = Result<T, MatchError>;
