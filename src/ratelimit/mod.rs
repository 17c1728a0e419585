//! Rate limiting decisions.

mod caller;
mod decision;
mod limiter;

pub use caller::{Caller, Dimension};
pub use decision::{Decision, RejectReason};
pub use limiter::{LimiterSettings, RateLimiter, WINDOW};
