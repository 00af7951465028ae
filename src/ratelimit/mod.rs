//! Rate limiting rules and request evaluation.

mod limiter;
pub mod pattern;
mod rules;

pub use limiter::{Decision, RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use rules::{parse_rules, Rule, RuleError, RuleKind, RuleSet, MAX_WINDOW_SECS};
