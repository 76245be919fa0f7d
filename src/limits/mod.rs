pub mod budget;
pub mod rate;

pub use budget::{BudgetDecision, BudgetEngine};
pub use rate::{RateLimitDecision, RateLimiter, Window};
