// ABOUTME: Sliding-window rate limiter for calls to the external generator API.
// ABOUTME: Enforces independent per-minute and per-hour ceilings.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Error returned when a rate limiter operation is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// One trailing window: a capacity and the timestamps recorded inside it.
struct Window {
    span: Duration,
    capacity: usize,
    calls: VecDeque<Instant>,
}

impl Window {
    fn new(span: Duration, capacity: usize) -> Self {
        Self {
            span,
            capacity,
            calls: VecDeque::new(),
        }
    }

    /// Drop timestamps that have aged out of the window.
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.calls.front() {
            if now.duration_since(*oldest) >= self.span {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until the oldest entry ages out, or zero if there is room.
    fn wait_time(&self, now: Instant) -> Duration {
        if self.calls.len() < self.capacity {
            return Duration::ZERO;
        }
        match self.calls.front() {
            Some(oldest) => self.span.saturating_sub(now.duration_since(*oldest)),
            None => Duration::ZERO,
        }
    }
}

/// Mutable state for the rate limiter, protected by a single mutex.
struct RateLimiterState {
    minute: Window,
    hour: Window,
}

impl RateLimiterState {
    fn prune(&mut self, now: Instant) {
        self.minute.prune(now);
        self.hour.prune(now);
    }
}

/// Snapshot of how many calls each window currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateUsage {
    pub last_minute: usize,
    pub last_hour: usize,
}

/// Sliding-window rate limiter with a per-minute and a per-hour ceiling.
///
/// Each successful [`acquire`](Self::acquire) records one timestamp in both
/// windows until it ages out. When a window is full the caller sleeps until
/// its oldest entry expires, then checks both windows again.
///
/// The room check and the recording happen under one lock acquisition, so
/// neither ceiling is ever exceeded. The lock is not held while sleeping;
/// waiters that wake together race for the freed slots and the losers go
/// back to sleep. Waiters are not served in any guaranteed order.
pub struct RateLimiter {
    state: Mutex<RateLimiterState>,
}

impl RateLimiter {
    /// Create a limiter allowing `per_minute` calls per minute and `per_hour`
    /// calls per hour.
    ///
    /// # Panics
    ///
    /// Panics if either limit is zero.
    pub fn new(per_minute: usize, per_hour: usize) -> Self {
        Self::with_windows((MINUTE, per_minute), (HOUR, per_hour))
    }

    /// Create a limiter with custom window spans. Each argument is
    /// `(span, capacity)`; the first window is checked before the second.
    ///
    /// # Panics
    ///
    /// Panics if either capacity is zero.
    pub fn with_windows(short: (Duration, usize), long: (Duration, usize)) -> Self {
        assert!(short.1 > 0, "short window capacity must be positive");
        assert!(long.1 > 0, "long window capacity must be positive");

        Self {
            state: Mutex::new(RateLimiterState {
                minute: Window::new(short.0, short.1),
                hour: Window::new(long.0, long.1),
            }),
        }
    }

    /// Wait until both windows have room, then record the call.
    pub async fn acquire(&self) {
        // A pending future never resolves, so cancellation cannot occur.
        let _ = self.acquire_with_cancel(std::future::pending::<()>()).await;
    }

    /// Like [`acquire`](Self::acquire), but gives up with `Err(Cancelled)` if
    /// `cancel` completes while waiting. Nothing is recorded on cancellation.
    pub async fn acquire_with_cancel<F>(&self, cancel: F) -> Result<(), Cancelled>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(cancel);

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.prune(now);
                let wait = state.minute.wait_time(now).max(state.hour.wait_time(now));
                if wait.is_zero() {
                    state.minute.calls.push_back(now);
                    state.hour.calls.push_back(now);
                    return Ok(());
                }
                wait
            };
            Self::sleep_or_cancel(wait, &mut cancel).await?;
        }
    }

    /// Current number of calls recorded in each window.
    pub async fn usage(&self) -> RateUsage {
        let mut state = self.state.lock().await;
        state.prune(Instant::now());
        RateUsage {
            last_minute: state.minute.calls.len(),
            last_hour: state.hour.calls.len(),
        }
    }

    async fn sleep_or_cancel<F>(
        wait: Duration,
        cancel: &mut std::pin::Pin<&mut F>,
    ) -> Result<(), Cancelled>
    where
        F: std::future::Future<Output = ()>,
    {
        tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");

        tokio::select! {
            biased;
            () = cancel.as_mut() => Err(Cancelled),
            () = tokio::time::sleep(wait) => Ok(()),
        }
    }
}
