//! Rate Limiter / Concurrency Tracker
//!
//! The only state shared by every in-flight run. A permit combines one
//! concurrency slot (counted globally and per target) with one token from the
//! target's bucket. Waiters for the same target are served in ticket order, so
//! a later burst cannot starve an earlier run.
//!
//! Limits are supplied on every acquire, taken from the policy the job was
//! submitted under, so a policy reload never strands existing waiters.

use recon_core::domain::policy::RateLimits;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcquireError {
    #[error("no rate-limit token for target '{target}' within {timeout:?}")]
    Timeout { target: String, timeout: Duration },
}

/// Shared concurrency and rate limiter
///
/// Cheap to clone; clones share the same counters.
#[derive(Clone, Default)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    changed: Notify,
    next_ticket: AtomicU64,
}

#[derive(Default)]
struct State {
    global_in_flight: usize,
    targets: HashMap<String, TargetSlot>,
}

struct TargetSlot {
    in_flight: usize,
    waiters: VecDeque<u64>,
    bucket: TokenBucket,
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(limits: &RateLimits, now: Instant) -> Self {
        let capacity = f64::from(limits.burst);
        Self {
            tokens: capacity,
            capacity,
            rate: limits.requests_per_second,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    fn is_full(&self) -> bool {
        self.rate <= 0.0 || self.tokens >= self.capacity
    }
}

enum Grant {
    Granted,
    Blocked,
    RetryIn(Duration),
}

impl State {
    fn try_grant(&mut self, key: &str, ticket: u64, limits: &RateLimits, now: Instant) -> Grant {
        let global_in_flight = self.global_in_flight;
        let Some(slot) = self.targets.get_mut(key) else {
            return Grant::Blocked;
        };

        if slot.waiters.front() != Some(&ticket) {
            return Grant::Blocked;
        }
        if global_in_flight >= limits.max_concurrent_global
            || slot.in_flight >= limits.max_concurrent_per_target
        {
            return Grant::Blocked;
        }

        if limits.requests_per_second > 0.0 {
            slot.bucket.capacity = f64::from(limits.burst);
            slot.bucket.rate = limits.requests_per_second;
            slot.bucket.refill(now);
            if slot.bucket.tokens < 1.0 {
                let missing = 1.0 - slot.bucket.tokens;
                return Grant::RetryIn(Duration::from_secs_f64(
                    missing / limits.requests_per_second,
                ));
            }
            slot.bucket.tokens -= 1.0;
        }

        slot.waiters.pop_front();
        slot.in_flight += 1;
        self.global_in_flight += 1;
        Grant::Granted
    }

    fn release(&mut self, key: &str, now: Instant) {
        self.global_in_flight = self.global_in_flight.saturating_sub(1);
        if let Some(slot) = self.targets.get_mut(key) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        self.prune(key, now);
    }

    fn withdraw(&mut self, key: &str, ticket: u64, now: Instant) {
        if let Some(slot) = self.targets.get_mut(key) {
            slot.waiters.retain(|t| *t != ticket);
        }
        self.prune(key, now);
    }

    /// Drops a slot once it is idle and its bucket is full again; a fresh
    /// slot is indistinguishable from it
    fn prune(&mut self, key: &str, now: Instant) {
        let idle = match self.targets.get_mut(key) {
            Some(slot) => {
                slot.bucket.refill(now);
                slot.in_flight == 0 && slot.waiters.is_empty() && slot.bucket.is_full()
            }
            None => false,
        };
        if idle {
            self.targets.remove(key);
        }
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for a permit on `key` under `limits`
    ///
    /// Blocks cooperatively until a slot and a token are available. Waiting
    /// for a concurrency slot is unbounded; only time spent at the head of
    /// the queue waiting for a token counts against
    /// `limits.acquire_timeout()`. Dropping the returned future withdraws the
    /// request.
    pub async fn acquire(&self, key: &str, limits: &RateLimits) -> Result<Permit, AcquireError> {
        let ticket = self.enqueue(key, limits);
        let _ticket_guard = TicketGuard {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            ticket,
        };

        self.wait_turn(key, ticket, limits).await
    }

    /// Explicitly returns a permit; equivalent to dropping it
    pub fn release(&self, permit: Permit) {
        drop(permit);
    }

    /// Runs currently holding a permit, across all targets
    pub fn global_in_flight(&self) -> usize {
        self.lock().global_in_flight
    }

    pub fn in_flight(&self, key: &str) -> usize {
        self.lock().targets.get(key).map_or(0, |s| s.in_flight)
    }

    /// Requests queued for `key` and not yet granted
    pub fn waiting(&self, key: &str) -> usize {
        self.lock().targets.get(key).map_or(0, |s| s.waiters.len())
    }

    fn enqueue(&self, key: &str, limits: &RateLimits) -> u64 {
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.lock();
        state
            .targets
            .entry(key.to_string())
            .or_insert_with(|| TargetSlot {
                in_flight: 0,
                waiters: VecDeque::new(),
                bucket: TokenBucket::full(limits, now),
            })
            .waiters
            .push_back(ticket);
        ticket
    }

    async fn wait_turn(
        &self,
        key: &str,
        ticket: u64,
        limits: &RateLimits,
    ) -> Result<Permit, AcquireError> {
        let budget = limits.acquire_timeout();
        let mut token_wait = Duration::ZERO;

        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let grant = self.lock().try_grant(key, ticket, limits, Instant::now());
            match grant {
                Grant::Granted => {
                    // The head of this target's queue moved
                    self.inner.changed.notify_waiters();
                    return Ok(Permit {
                        inner: Arc::clone(&self.inner),
                        key: key.to_string(),
                    });
                }
                Grant::Blocked => changed.await,
                Grant::RetryIn(delay) => {
                    let remaining = budget.saturating_sub(token_wait);
                    if remaining.is_zero() {
                        debug!("Token wait for '{}' exceeded {:?}", key, budget);
                        return Err(AcquireError::Timeout {
                            target: key.to_string(),
                            timeout: budget,
                        });
                    }
                    let started = Instant::now();
                    tokio::select! {
                        _ = &mut changed => {}
                        _ = tokio::time::sleep(delay.min(remaining)) => {}
                    }
                    token_wait += started.elapsed();
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock_state(&self.inner)
    }
}

fn lock_state(inner: &Inner) -> MutexGuard<'_, State> {
    match inner.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A granted concurrency slot plus rate token, returned on drop
pub struct Permit {
    inner: Arc<Inner>,
    key: String,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").field("target", &self.key).finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        lock_state(&self.inner).release(&self.key, Instant::now());
        self.inner.changed.notify_waiters();
    }
}

/// Removes an abandoned ticket from its queue (timeout or cancellation)
struct TicketGuard {
    inner: Arc<Inner>,
    key: String,
    ticket: u64,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        lock_state(&self.inner).withdraw(&self.key, self.ticket, Instant::now());
        self.inner.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(rps: f64, burst: u32, global: usize, per_target: usize) -> RateLimits {
        RateLimits {
            requests_per_second: rps,
            burst,
            max_concurrent_global: global,
            max_concurrent_per_target: per_target,
            acquire_timeout_secs: 30,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_target_ceiling_blocks_until_release() {
        let limiter = RateLimiter::new();
        let limits = limits(0.0, 1, 10, 1);

        let first = limiter.acquire("example.com", &limits).await.unwrap();
        assert_eq!(limiter.in_flight("example.com"), 1);

        let waiter = {
            let limiter = limiter.clone();
            let limits = limits.clone();
            tokio::spawn(async move { limiter.acquire("example.com", &limits).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());
        assert_eq!(limiter.waiting("example.com"), 1);

        // A different target is not affected
        let other = limiter.acquire("other.org", &limits).await.unwrap();
        assert_eq!(limiter.global_in_flight(), 2);
        drop(other);

        limiter.release(first);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(limiter.in_flight("example.com"), 1);
        drop(second);
        assert_eq!(limiter.global_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_ceiling_spans_targets() {
        let limiter = RateLimiter::new();
        let mut limits = limits(0.0, 1, 2, 5);
        limits.acquire_timeout_secs = 1;

        let a = limiter.acquire("a", &limits).await.unwrap();
        let _b = limiter.acquire("b", &limits).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let limits = limits.clone();
            tokio::spawn(async move { limiter.acquire("c", &limits).await })
        };

        // Waiting for a slot is not bounded by the acquire timeout
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!waiter.is_finished());
        assert_eq!(limiter.waiting("c"), 1);

        drop(a);
        let permit = waiter.await.unwrap().unwrap();
        assert_eq!(limiter.in_flight("c"), 1);
        drop(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_wait_times_out() {
        let limiter = RateLimiter::new();
        let mut limits = limits(0.1, 1, 10, 10);
        limits.acquire_timeout_secs = 1;

        let first = limiter.acquire("t", &limits).await.unwrap();
        drop(first);

        // The next token is ten seconds away
        let err = limiter.acquire("t", &limits).await.unwrap_err();
        assert!(matches!(err, AcquireError::Timeout { .. }));
        assert_eq!(limiter.waiting("t"), 0, "timed out ticket is withdrawn");
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_order() {
        let limiter = RateLimiter::new();
        let limits = limits(0.0, 1, 10, 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = limiter.acquire("t", &limits).await.unwrap();
        let mut handles = Vec::new();
        for i in 0..5 {
            let limiter = limiter.clone();
            let limits = limits.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let permit = limiter.acquire("t", &limits).await.unwrap();
                order.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(permit);
            }));
            // Let each task take its ticket before the next is spawned
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_bounds_grants_per_window() {
        let limiter = RateLimiter::new();
        let limits = limits(2.0, 2, 100, 100);
        let start = Instant::now();
        let grants = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..9 {
            let limiter = limiter.clone();
            let limits = limits.clone();
            let grants = Arc::clone(&grants);
            handles.push(tokio::spawn(async move {
                let permit = limiter.acquire("10.0.0.1", &limits).await.unwrap();
                grants.lock().unwrap().push(Instant::now() - start);
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut grants = grants.lock().unwrap().clone();
        grants.sort();
        assert_eq!(grants.len(), 9);

        // burst + rate * window for a one second window
        let window = Duration::from_secs(1);
        let bound = 2 + 2;
        for (i, t) in grants.iter().enumerate() {
            let in_window = grants[i..].iter().filter(|g| **g < *t + window).count();
            assert!(in_window <= bound, "{} grants within {:?} of {:?}", in_window, window, t);
        }

        // Two immediately, then one every half second
        assert!(grants[1] < Duration::from_millis(1));
        assert!(grants[8] >= Duration::from_millis(3_400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_acquire_withdraws_ticket() {
        let limiter = RateLimiter::new();
        let limits = limits(0.0, 1, 10, 1);
        let held = limiter.acquire("t", &limits).await.unwrap();

        let pending = {
            let limiter = limiter.clone();
            let limits = limits.clone();
            tokio::spawn(async move { limiter.acquire("t", &limits).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(limiter.waiting("t"), 1);

        pending.abort();
        let _ = pending.await;
        assert_eq!(limiter.waiting("t"), 0);

        drop(held);
        let again = limiter.acquire("t", &limits).await;
        assert!(again.is_ok());
    }
}
