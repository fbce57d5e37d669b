//! Retry policy, clock seam and cancellation for lock waits.
//!
//! Lock acquisition sleeps between attempts. Both the passage of time and the
//! sleeping are routed through [`Clock`] so contention and staleness can be
//! simulated in tests without real waiting.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

/// Source of wall-clock time and the ability to wait.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time (compared with lock file modification times).
    fn now(&self) -> SystemTime;
    /// Block the caller for `duration`.
    fn sleep(&self, duration: Duration);
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock that only moves when told to. `sleep` advances it instantly.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
    slept: Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Start the clock at `start`.
    #[must_use]
    pub const fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
            slept: Mutex::new(Vec::new()),
        }
    }

    /// Move the clock forward without recording a sleep.
    pub fn advance(&self, by: Duration) {
        *locked(&self.now) += by;
    }

    /// Every duration passed to [`Clock::sleep`] so far.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        locked(&self.slept).clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *locked(&self.now)
    }

    fn sleep(&self, duration: Duration) {
        locked(&self.slept).push(duration);
        self.advance(duration);
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Cooperative cancellation flag shared between a waiter and whoever may abort it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Waiters notice before their next attempt.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded retry with a fixed base delay plus random jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero behaves like one.
    pub max_attempts: usize,
    /// Delay between attempts.
    pub base_delay: Duration,
    /// Upper bound of the random extra delay added to `base_delay`.
    pub jitter: Duration,
    /// Optional cancellation checked before every wait.
    pub cancel: Option<CancelToken>,
}

impl RetryPolicy {
    /// Policy with no cancellation token.
    #[must_use]
    pub const fn new(max_attempts: usize, base_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter,
            cancel: None,
        }
    }

    /// A single attempt, no waiting.
    #[must_use]
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Whether the attached token (if any) was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Delay before the next attempt: `base_delay + uniform(0..=jitter)`.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).map_or(u64::MAX, |ms| ms);
        if jitter_ms == 0 {
            return self.base_delay;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.base_delay + Duration::from_millis(extra)
    }

    /// Worst-case total wait across all retries.
    #[must_use]
    pub fn max_total_wait(&self) -> Duration {
        let waits = u32::try_from(self.max_attempts.saturating_sub(1)).map_or(u32::MAX, |n| n);
        (self.base_delay + self.jitter).saturating_mul(waits)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(20, Duration::from_millis(400), Duration::from_millis(200))
    }
}
