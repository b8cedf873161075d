use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Concurrency cap for calls to a shared upstream.
#[derive(Clone)]
pub struct Bulkhead {
    sem: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Wait for a slot. The permit releases on drop.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        // The semaphore is never closed, so acquire cannot fail.
        match Arc::clone(&self.sem).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("bulkhead semaphore closed"),
        }
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
}

/// Three-state circuit breaker: closed → open after `failure_threshold`
/// consecutive failures, half-open after `open_for`, closing again on the
/// next success.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    open_for: Duration,
    name: String,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, open_for: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
            }),
            failure_threshold,
            open_for,
            name: name.into(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Check whether a call may proceed. Open breakers transition to
    /// half-open once the cooldown has elapsed and admit a single probe.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.open_for {
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(anyhow!("circuit breaker '{}' is open", self.name))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().state == BreakerState::Open
    }

    /// Run a call through the breaker, recording the outcome.
    pub async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.try_acquire()?;
        match fut.await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let b = CircuitBreaker::new("t", 3, Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        assert!(b.try_acquire().is_ok());
        b.record_failure();
        assert!(b.is_open());
        assert!(b.try_acquire().is_err());
    }

    #[test]
    fn breaker_half_opens_after_cooldown_and_closes_on_success() {
        let b = CircuitBreaker::new("t", 1, Duration::from_millis(0));
        b.record_failure();
        assert!(b.is_open());
        // Cooldown of zero: next acquire transitions to half-open.
        assert!(b.try_acquire().is_ok());
        b.record_success();
        assert!(!b.is_open());
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = CircuitBreaker::new("t", 1, Duration::from_millis(0));
        b.record_failure();
        assert!(b.try_acquire().is_ok()); // half-open probe admitted
        b.record_failure();
        assert!(b.is_open());
    }

    #[test]
    fn success_resets_failure_count() {
        let b = CircuitBreaker::new("t", 2, Duration::from_secs(60));
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert!(!b.is_open(), "count must reset after success");
    }

    #[tokio::test]
    async fn breaker_call_records_outcomes() {
        let b = CircuitBreaker::new("t", 1, Duration::from_secs(60));
        let ok: Result<u32> = b.call(async { Ok(5) }).await;
        assert_eq!(ok.unwrap(), 5);
        let err: Result<u32> = b.call(async { Err(anyhow!("boom")) }).await;
        assert!(err.is_err());
        assert!(b.is_open());
        let blocked: Result<u32> = b.call(async { Ok(1) }).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn bulkhead_caps_concurrency() {
        let b = Bulkhead::new(2);
        let p1 = b.acquire().await;
        let _p2 = b.acquire().await;
        assert_eq!(b.available(), 0);
        drop(p1);
        assert_eq!(b.available(), 1);
    }
}
