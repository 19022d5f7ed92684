//! Resource Governor - Distributed Cost-Weighted Rate Limiting
//!
//! This crate regulates traffic per tenant by the computational cost of each
//! operation rather than by raw request count. Route rules map requests to
//! cost weights, and a Generic Cell Rate Algorithm schedule persisted in
//! shared atomic storage keeps every gateway node drawing on the same budget.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{GovernorError, Result, StorageError};
pub use ratelimit::{
    AtomicStorage, Context, CostResolutionEngine, Decision, MemoryStorage, ResourceGovernor,
};
