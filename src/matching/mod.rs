pub mod clock;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod filter;
pub mod mapper;
pub mod types;

pub use clock::{Clock, SystemClock};
pub use engine::MatchingEngine;
pub use error::{MatchError, MatchResult};
pub use mapper::FileNodeMapper;
pub use types::{Decision, MatchingMode};
