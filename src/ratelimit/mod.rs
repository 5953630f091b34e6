//! Rate limiting logic and state management.

mod counter;
mod decision;
mod engine;
mod identity;
mod rules;
mod window;

pub use counter::{CounterKey, MemoryCounterStore, WindowCounter, WindowCounterStore};
pub use decision::{Decision, Denial, DenyReason, RetryAfter};
pub use engine::RateDecisionEngine;
pub use identity::ClientIdentity;
pub use rules::{EndpointPolicy, RateLimitConfig, RateLimitRule};
pub use window::TimeWindow;
