pub mod error;
pub mod score;
pub mod store;
pub mod types;

pub use error::{RuleError, RuleResult};
pub use score::{compute_detail_score, default_context_weights};
pub use store::RuleStore;
pub use types::{DecisionLayer, DecisionRule, RuleContext, SharingDomain, TimeOfDay};
