//! The resource governor facade.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::clock::{Clock, SystemClock};
use super::context::Context;
use super::gcra::{Decision, GcraParams, RetryPolicy, StateManager};
use super::rules::{CostResolutionEngine, RouteRule};
use super::storage::AtomicStorage;
use crate::config::GovernorConfig;
use crate::error::Result;

/// Default prefix for per-tenant schedule keys.
pub const DEFAULT_KEY_PREFIX: &str = "quota:";

/// Cost-weighted, per-tenant admission control shared across gateway nodes.
///
/// Every tenant has exactly one budget, shared by all the routes it calls;
/// route rules only decide how much of that budget a request consumes.
pub struct ResourceGovernor {
    engine: CostResolutionEngine,
    state: StateManager,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("rules", &self.engine.len())
            .field("state", &self.state)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl ResourceGovernor {
    /// Create a governor over `storage` with a refill rate in units per
    /// second and a burst capacity in units.
    pub fn new(
        storage: Arc<dyn AtomicStorage>,
        refill_rate: f64,
        burst_capacity: u64,
    ) -> Result<Self> {
        let params = GcraParams::new(refill_rate, burst_capacity)?;

        info!(
            refill_rate = refill_rate,
            burst_capacity = burst_capacity,
            emission_interval_ns = params.emission_interval().as_nanos() as u64,
            "Resource governor initialized"
        );

        Ok(Self {
            engine: CostResolutionEngine::new(),
            state: StateManager::new(storage, params),
            clock: Arc::new(SystemClock),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    /// Create a governor from configuration and register every configured route.
    pub fn from_config(storage: Arc<dyn AtomicStorage>, config: &GovernorConfig) -> Result<Self> {
        config.validate()?;

        let governor = Self::new(
            storage,
            config.limits.refill_rate,
            config.limits.burst_capacity,
        )?
        .with_retry_policy(config.retry.policy())
        .with_key_prefix(config.storage.key_prefix.clone());

        for route in &config.routes {
            governor.register_route(&route.method, &route.path, &route.headers, route.cost);
        }

        info!(routes = config.routes.len(), "Loaded route cost rules from configuration");
        Ok(governor)
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the CAS contention policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.state.set_retry_policy(retry);
        self
    }

    /// Replace the prefix of per-tenant storage keys.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Register a route cost rule.
    pub fn register_route(
        &self,
        method: &str,
        path_pattern: &str,
        headers: &HashMap<String, String>,
        cost: u64,
    ) -> RouteRule {
        self.engine.register(method, path_pattern, headers, cost)
    }

    /// Remove route cost rules with exactly this identity.
    pub fn unregister_route(
        &self,
        method: &str,
        path_pattern: &str,
        headers: &HashMap<String, String>,
    ) -> usize {
        self.engine.unregister(method, path_pattern, headers)
    }

    /// The cost a request would be charged.
    pub fn resolve_cost(&self, method: &str, path: &str, headers: &HashMap<String, String>) -> u64 {
        self.engine.resolve(method, path, headers)
    }

    /// Decide whether a tenant's request may proceed, charging its cost if so.
    ///
    /// Storage errors and context expiry are returned as errors; a rejected
    /// request is `Ok` with `allowed == false`.
    #[instrument(
        skip(self, ctx, headers),
        fields(tenant = %tenant_id, method = %method, path = %path)
    )]
    pub async fn allow(
        &self,
        ctx: &Context,
        tenant_id: &str,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Decision> {
        let cost = self.engine.resolve(method, path, headers);
        let key = self.storage_key(tenant_id);
        let now = self.clock.now_nanos();

        let decision = self.state.consume(ctx, &key, cost, now).await?;

        debug!(
            cost = cost,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Admission decision made"
        );
        Ok(decision)
    }

    /// Budget units a tenant could spend right now.
    pub async fn remaining(&self, ctx: &Context, tenant_id: &str) -> Result<u64> {
        let key = self.storage_key(tenant_id);
        self.state.peek(ctx, &key, self.clock.now_nanos()).await
    }

    /// The storage key holding a tenant's schedule.
    pub fn storage_key(&self, tenant_id: &str) -> String {
        format!("{}{}", self.key_prefix, tenant_id)
    }

    pub fn engine(&self) -> &CostResolutionEngine {
        &self.engine
    }

    pub fn params(&self) -> &GcraParams {
        self.state.params()
    }
}
