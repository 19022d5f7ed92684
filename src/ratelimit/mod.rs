//! Cost resolution and GCRA admission control.

mod clock;
mod context;
mod gcra;
mod governor;
mod rules;
mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::Context;
pub use gcra::{Decision, GcraParams, RetryPolicy, StateManager};
pub use governor::{ResourceGovernor, DEFAULT_KEY_PREFIX};
pub use rules::{CostResolutionEngine, RouteRule, DEFAULT_COST};
pub use storage::{AtomicStorage, MemoryStorage};
