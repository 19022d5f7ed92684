//! Generic Cell Rate Algorithm over distributed atomic storage.
//!
//! A tenant's entire rate limit state is one theoretical arrival time (TAT),
//! stored as nanoseconds since the Unix epoch under a single key. A request
//! of cost `c` pushes the TAT forward by `c × emission_interval`; it is
//! admitted only if the pushed TAT stays within `now + burst`. Because the
//! state is a single integer, one compare-and-swap commits a decision
//! atomically on every backend, with no coupled fields to keep consistent.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::context::Context;
use super::storage::AtomicStorage;
use crate::error::{GovernorError, Result};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Exponent cap for the backoff doubling.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Process-wide GCRA parameters shared by every tenant and route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcraParams {
    refill_rate: f64,
    burst_capacity: u64,
    /// Time cost of one unit of work
    emission_interval_nanos: i64,
    /// Maximum schedule slack, `burst_capacity × emission_interval`
    burst_nanos: i64,
}

impl GcraParams {
    /// Derive the schedule from a refill rate (units per second) and a burst
    /// capacity (units).
    pub fn new(refill_rate: f64, burst_capacity: u64) -> Result<Self> {
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(GovernorError::InvalidParameters(format!(
                "refill rate must be a positive finite number, got {}",
                refill_rate
            )));
        }
        if burst_capacity == 0 {
            return Err(GovernorError::InvalidParameters(
                "burst capacity must be at least 1".to_string(),
            ));
        }

        // Rounded to the nearest nanosecond rather than truncated, so a rate
        // of 3/s schedules every 333_333_333 ns and 1e9/s every 1 ns.
        let emission = (NANOS_PER_SEC / refill_rate).round();
        if emission < 1.0 {
            return Err(GovernorError::InvalidParameters(format!(
                "refill rate {} is finer than one unit per nanosecond",
                refill_rate
            )));
        }
        if emission > i64::MAX as f64 {
            return Err(GovernorError::InvalidParameters(format!(
                "refill rate {} is too slow to schedule",
                refill_rate
            )));
        }
        let emission_interval_nanos = emission as i64;

        let burst_nanos = i64::try_from(burst_capacity as i128 * emission_interval_nanos as i128)
            .map_err(|_| {
                GovernorError::InvalidParameters(format!(
                    "burst window of {} units at {} units/s overflows",
                    burst_capacity, refill_rate
                ))
            })?;

        Ok(Self {
            refill_rate,
            burst_capacity,
            emission_interval_nanos,
            burst_nanos,
        })
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn burst_capacity(&self) -> u64 {
        self.burst_capacity
    }

    /// Time it takes to earn back one unit of budget.
    pub fn emission_interval(&self) -> Duration {
        Duration::from_nanos(self.emission_interval_nanos as u64)
    }

    /// Width of the burst window.
    pub fn burst(&self) -> Duration {
        Duration::from_nanos(self.burst_nanos as u64)
    }

    /// Whole units that fit between two points on the schedule.
    fn units_between(&self, from: i128, to: i128) -> u64 {
        let span = (to - from).max(0);
        u64::try_from(span / self.emission_interval_nanos as i128).unwrap_or(u64::MAX)
    }
}

/// Outcome of a single consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Budget units left after an admitted request, or before a rejected one
    pub remaining: u64,
    /// How long a rejected request must wait before an identical one fits
    pub wait: Duration,
}

impl Decision {
    pub fn allowed(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            wait: Duration::ZERO,
        }
    }

    pub fn rejected(remaining: u64, wait: Duration) -> Self {
        Self {
            allowed: false,
            remaining,
            wait,
        }
    }

    /// `wait` rounded up to whole seconds, for a `Retry-After` header.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.wait.as_secs();
        if self.wait.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// How the consume loop behaves when it loses a CAS race.
///
/// The default retries forever with no delay; the caller's [`Context`] is
/// then the only bound on the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Give up after this many attempts; `None` retries until the context ends
    pub max_attempts: Option<u32>,
    /// First backoff delay; zero disables sleeping between attempts
    pub base_backoff: Duration,
    /// Upper bound on a single backoff delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    /// Retry immediately, without limit.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::from_millis(50),
        }
    }

    /// Retry at most `max_attempts` times with capped, jittered exponential backoff.
    pub fn bounded(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            base_backoff,
            max_backoff,
        }
    }

    /// Delay before the attempt following `conflicts` consecutive lost races.
    fn backoff(&self, conflicts: u32) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let shift = conflicts.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        let ceiling = self
            .base_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff);
        let ceiling_nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        // Full jitter keeps contending nodes from retrying in lockstep.
        Duration::from_nanos(rand::thread_rng().gen_range(0..=ceiling_nanos))
    }
}

/// Makes admit/reject decisions against shared storage.
pub struct StateManager {
    storage: Arc<dyn AtomicStorage>,
    params: GcraParams,
    retry: RetryPolicy,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("params", &self.params)
            .field("retry", &self.retry)
            .finish()
    }
}

impl StateManager {
    pub fn new(storage: Arc<dyn AtomicStorage>, params: GcraParams) -> Self {
        Self::with_retry_policy(storage, params, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        storage: Arc<dyn AtomicStorage>,
        params: GcraParams,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            params,
            retry,
        }
    }

    pub fn params(&self) -> &GcraParams {
        &self.params
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    /// Try to charge `cost` units to the schedule under `key` at time `now`
    /// (nanoseconds since the epoch).
    ///
    /// Rejections never touch storage. A lost CAS race restarts the whole
    /// read-decide-write cycle from a fresh read. Storage errors are returned
    /// as-is; the context is checked before every attempt.
    pub async fn consume(&self, ctx: &Context, key: &str, cost: u64, now: i64) -> Result<Decision> {
        let cost = cost.max(1);
        let increment = cost as i128 * self.params.emission_interval_nanos as i128;
        let limit = (now as i128 + self.params.burst_nanos as i128).min(i64::MAX as i128);
        let mut attempts: u32 = 0;

        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            attempts = attempts.saturating_add(1);

            let stored = self.storage.get(ctx, key).await?;
            let raw = stored.unwrap_or(0);
            // Idle time past the burst window earns nothing extra.
            let tat = match stored {
                Some(tat) if tat > now => tat as i128,
                _ => now as i128,
            };
            let new_tat = tat + increment;

            trace!(
                key = %key,
                cost = cost,
                attempt = attempts,
                tat = raw,
                "Evaluating GCRA schedule"
            );

            if new_tat > limit {
                let remaining = self.params.units_between(tat, limit);
                let wait = nanos_to_duration(new_tat - limit);
                debug!(
                    key = %key,
                    cost = cost,
                    remaining = remaining,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limit exceeded"
                );
                return Ok(Decision::rejected(remaining, wait));
            }

            // new_tat <= limit <= i64::MAX
            let committed = new_tat as i64;
            if self
                .storage
                .compare_and_swap(ctx, key, raw, committed)
                .await?
            {
                let remaining = self.params.units_between(new_tat, limit);
                trace!(key = %key, cost = cost, remaining = remaining, "Request admitted");
                return Ok(Decision::allowed(remaining));
            }

            debug!(key = %key, attempt = attempts, "Lost CAS race, retrying");

            if let Some(max) = self.retry.max_attempts {
                if attempts >= max {
                    warn!(key = %key, attempts = attempts, "Giving up under CAS contention");
                    return Err(GovernorError::Contention { attempts });
                }
            }

            let backoff = self.retry.backoff(attempts);
            if !backoff.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = ctx.token().cancelled() => {}
                }
            }
        }
    }

    /// Budget units currently available under `key`, without consuming any.
    pub async fn peek(&self, ctx: &Context, key: &str, now: i64) -> Result<u64> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let limit = (now as i128 + self.params.burst_nanos as i128).min(i64::MAX as i128);
        let tat = match self.storage.get(ctx, key).await? {
            Some(tat) if tat > now => tat as i128,
            _ => now as i128,
        };
        Ok(self.params.units_between(tat, limit))
    }
}

fn nanos_to_duration(nanos: i128) -> Duration {
    Duration::from_nanos(u64::try_from(nanos.max(0)).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::ratelimit::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const T0: i64 = 1_700_000_000_000_000_000;
    const SEC: i64 = 1_000_000_000;

    fn manager(refill_rate: f64, burst: u64) -> (StateManager, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let params = GcraParams::new(refill_rate, burst).unwrap();
        (StateManager::new(storage.clone(), params), storage)
    }

    /// Reports a lost race for the first `conflicts` CAS calls.
    struct ContendedStorage {
        inner: MemoryStorage,
        conflicts: AtomicU32,
        cas_calls: AtomicU32,
        cancel_on_conflict: bool,
    }

    impl ContendedStorage {
        fn new(conflicts: u32) -> Self {
            Self {
                inner: MemoryStorage::new(),
                conflicts: AtomicU32::new(conflicts),
                cas_calls: AtomicU32::new(0),
                cancel_on_conflict: false,
            }
        }
    }

    #[async_trait]
    impl AtomicStorage for ContendedStorage {
        async fn get(
            &self,
            ctx: &Context,
            key: &str,
        ) -> std::result::Result<Option<i64>, StorageError> {
            self.inner.get(ctx, key).await
        }

        async fn compare_and_swap(
            &self,
            ctx: &Context,
            key: &str,
            old: i64,
            new: i64,
        ) -> std::result::Result<bool, StorageError> {
            self.cas_calls.fetch_add(1, Ordering::SeqCst);
            let lose = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lose {
                if self.cancel_on_conflict {
                    ctx.cancel();
                }
                return Ok(false);
            }
            self.inner.compare_and_swap(ctx, key, old, new).await
        }

        async fn atomic_increment(
            &self,
            ctx: &Context,
            key: &str,
            delta: i64,
        ) -> std::result::Result<i64, StorageError> {
            self.inner.atomic_increment(ctx, key, delta).await
        }
    }

    #[test]
    fn test_params_derivation() {
        let params = GcraParams::new(10.0, 5).unwrap();
        assert_eq!(params.emission_interval(), Duration::from_millis(100));
        assert_eq!(params.burst(), Duration::from_millis(500));
    }

    #[test]
    fn test_emission_interval_rounds_to_nearest_nanosecond() {
        let params = GcraParams::new(3.0, 3).unwrap();
        assert_eq!(params.emission_interval(), Duration::from_nanos(333_333_333));
        assert_eq!(params.burst(), Duration::from_nanos(999_999_999));

        // 6.67 ns per unit rounds up, not down.
        let params = GcraParams::new(1.5e8, 1).unwrap();
        assert_eq!(params.emission_interval(), Duration::from_nanos(7));
    }

    #[test]
    fn test_params_validation() {
        assert!(matches!(
            GcraParams::new(0.0, 5),
            Err(GovernorError::InvalidParameters(_))
        ));
        assert!(GcraParams::new(-1.0, 5).is_err());
        assert!(GcraParams::new(f64::NAN, 5).is_err());
        assert!(GcraParams::new(f64::INFINITY, 5).is_err());
        assert!(GcraParams::new(10.0, 0).is_err());
        assert!(GcraParams::new(1e10, 5).is_err());
        assert!(GcraParams::new(1e-9, u64::MAX).is_err());
    }

    #[tokio::test]
    async fn test_burst_exhaustion() {
        let (manager, _) = manager(1.0, 5);
        let ctx = Context::background();

        for i in 0..5 {
            let decision = manager.consume(&ctx, "quota:t", 1, T0).await.unwrap();
            assert!(decision.allowed, "request {} should be admitted", i + 1);
            assert_eq!(decision.remaining, 4 - i);
        }

        let decision = manager.consume(&ctx, "quota:t", 1, T0).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.wait, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_weighted_cost() {
        let (manager, _) = manager(1.0, 10);
        let ctx = Context::background();

        let decision = manager.consume(&ctx, "quota:t", 7, T0).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);

        let decision = manager.consume(&ctx, "quota:t", 5, T0).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 3);
        assert_eq!(decision.wait, Duration::from_secs(2));

        let decision = manager.consume(&ctx, "quota:t", 3, T0).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_rejection_does_not_write() {
        let (manager, storage) = manager(1.0, 2);
        let ctx = Context::background();

        manager.consume(&ctx, "quota:t", 2, T0).await.unwrap();
        let before = storage.get(&ctx, "quota:t").await.unwrap();

        let decision = manager.consume(&ctx, "quota:t", 1, T0).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(storage.get(&ctx, "quota:t").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_wait_time_is_exact() {
        let (manager, _) = manager(1.0, 3);
        let ctx = Context::background();

        for _ in 0..3 {
            manager.consume(&ctx, "quota:t", 1, T0).await.unwrap();
        }
        let rejected = manager.consume(&ctx, "quota:t", 2, T0).await.unwrap();
        assert!(!rejected.allowed);
        let wait = rejected.wait.as_nanos() as i64;
        assert_eq!(wait, 2 * SEC);

        let early = manager.consume(&ctx, "quota:t", 2, T0 + wait - 1).await.unwrap();
        assert!(!early.allowed);
        assert_eq!(early.wait, Duration::from_nanos(1));

        let on_time = manager.consume(&ctx, "quota:t", 2, T0 + wait).await.unwrap();
        assert!(on_time.allowed);
    }

    #[tokio::test]
    async fn test_idle_time_is_capped_at_burst() {
        let (manager, _) = manager(1.0, 3);
        let ctx = Context::background();

        manager.consume(&ctx, "quota:t", 1, T0).await.unwrap();

        // A day of idleness still only yields the burst.
        let later = T0 + 86_400 * SEC;
        for _ in 0..3 {
            assert!(manager.consume(&ctx, "quota:t", 1, later).await.unwrap().allowed);
        }
        assert!(!manager.consume(&ctx, "quota:t", 1, later).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_cost_above_burst_is_always_rejected() {
        let (manager, storage) = manager(1.0, 5);
        let ctx = Context::background();

        let decision = manager.consume(&ctx, "quota:t", 6, T0).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 5);
        assert_eq!(decision.wait, Duration::from_secs(1));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_huge_cost_does_not_overflow() {
        let (manager, _) = manager(1000.0, 10);
        let ctx = Context::background();

        let decision = manager.consume(&ctx, "quota:t", u64::MAX, T0).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.wait, Duration::from_nanos(u64::MAX));

        // The limit saturates at the end of representable time.
        let decision = manager.consume(&ctx, "quota:t", 1, i64::MAX - 1).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.wait, Duration::from_nanos(999_999));
    }

    #[tokio::test]
    async fn test_zero_cost_counts_as_one() {
        let (manager, _) = manager(1.0, 2);
        let ctx = Context::background();

        assert_eq!(manager.consume(&ctx, "quota:t", 0, T0).await.unwrap().remaining, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (manager, _) = manager(2.0, 4);
        let ctx = Context::background();

        assert_eq!(manager.peek(&ctx, "quota:t", T0).await.unwrap(), 4);
        manager.consume(&ctx, "quota:t", 3, T0).await.unwrap();
        assert_eq!(manager.peek(&ctx, "quota:t", T0).await.unwrap(), 1);
        assert_eq!(manager.peek(&ctx, "quota:t", T0).await.unwrap(), 1);

        // Two units per second: one second earns back two units.
        assert_eq!(manager.peek(&ctx, "quota:t", T0 + SEC).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_lost_race_retries_from_fresh_read() {
        let storage = Arc::new(ContendedStorage::new(3));
        let params = GcraParams::new(1.0, 5).unwrap();
        let manager = StateManager::new(storage.clone(), params);
        let ctx = Context::background();

        let decision = manager.consume(&ctx, "quota:t", 1, T0).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(storage.cas_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_bounded_retry_gives_up() {
        let storage = Arc::new(ContendedStorage::new(u32::MAX));
        let params = GcraParams::new(1.0, 5).unwrap();
        let policy = RetryPolicy::bounded(3, Duration::from_micros(10), Duration::from_micros(100));
        let manager = StateManager::with_retry_policy(storage.clone(), params, policy);
        let ctx = Context::background();

        let err = manager.consume(&ctx, "quota:t", 1, T0).await.unwrap_err();
        assert!(matches!(err, GovernorError::Contention { attempts: 3 }));
        assert_eq!(storage.cas_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_between_retries() {
        let mut storage = ContendedStorage::new(u32::MAX);
        storage.cancel_on_conflict = true;
        let storage = Arc::new(storage);
        let params = GcraParams::new(1.0, 5).unwrap();
        let manager = StateManager::new(storage.clone(), params);
        let ctx = Context::background();

        let err = manager.consume(&ctx, "quota:t", 1, T0).await.unwrap_err();
        assert!(matches!(err, GovernorError::Cancelled));
        assert_eq!(storage.cas_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_skips_storage() {
        let storage = Arc::new(ContendedStorage::new(0));
        let manager = StateManager::new(storage.clone(), GcraParams::new(1.0, 5).unwrap());
        let ctx = Context::background();
        ctx.cancel();

        assert!(matches!(
            manager.consume(&ctx, "quota:t", 1, T0).await,
            Err(GovernorError::Cancelled)
        ));
        assert_eq!(storage.cas_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::bounded(10, Duration::from_millis(1), Duration::from_millis(8));
        for conflicts in 1..40 {
            assert!(policy.backoff(conflicts) <= Duration::from_millis(8));
        }
        assert_eq!(RetryPolicy::unbounded().backoff(5), Duration::ZERO);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(Decision::allowed(3).retry_after_secs(), 0);
        assert_eq!(Decision::rejected(0, Duration::from_secs(2)).retry_after_secs(), 2);
        assert_eq!(Decision::rejected(0, Duration::from_millis(2001)).retry_after_secs(), 3);
    }
}
