//! Time source used by the rate governor and the service lifecycle.
//!
//! Every wait in the send path goes through [`Clock::sleep`], so tests can
//! swap in [`MockClock`] and run hour-long windows instantly.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Wall-clock reading plus an awaitable sleep.
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// Current local time.
    fn now(&self) -> DateTime<Local>;

    /// Suspend the calling task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the system time and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug)]
struct MockClockState {
    now: DateTime<Local>,
    sleeps: Vec<Duration>,
}

/// Virtual clock for tests.
///
/// `sleep` returns after advancing virtual time by the requested duration and
/// recording it, so callers observe exactly the waits they asked for. Clones
/// share the same time.
///
/// ```
/// use courier_core::clock::{Clock, MockClock};
/// use chrono::{Local, TimeZone};
/// use std::time::Duration;
///
/// let start = Local.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap();
/// let clock = MockClock::new(start);
/// clock.advance(Duration::from_secs(10));
/// assert_eq!(clock.now(), start + chrono::Duration::seconds(10));
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    state: Arc<Mutex<MockClockState>>,
}

impl MockClock {
    /// Create a mock clock starting at `start`.
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockClockState {
                now: start,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Advance the clock by a duration without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.now += to_chrono(duration);
    }

    /// Set the clock to a specific time.
    pub fn set(&self, now: DateTime<Local>) {
        self.lock().now = now;
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    /// Sum of all recorded sleeps.
    pub fn total_slept(&self) -> Duration {
        self.lock().sleeps.iter().sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Local> {
        self.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.lock();
            state.now += to_chrono(duration);
            state.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

/// Convert a std duration into a chrono one, saturating on overflow.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Convert a non-negative chrono duration into a std one; negatives become zero.
pub(crate) fn to_std(duration: chrono::Duration) -> Duration {
    duration.to_std().unwrap_or(Duration::ZERO)
}
