//! Waiting on cluster state
//!
//! Readiness is observed by polling. `poll_until` keeps that behind one
//! primitive so callers only say what "ready" and "failed" mean.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of one check
#[derive(Debug)]
pub enum Check<T, E> {
    Ready(T),
    Pending,
    Failed(E),
}

/// Why `poll_until` gave up
#[derive(Debug, PartialEq, Eq)]
pub enum WaitError<E> {
    /// Still pending when the deadline passed
    TimedOut(Duration),
    /// The check reported a failure
    Failed(E),
}

/// How often to check and for how long
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub multiplier: u32,
    pub deadline: Option<Duration>,
}

impl PollPolicy {
    #[must_use]
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            multiplier: 1,
            deadline: None,
        }
    }

    #[must_use]
    pub fn exponential(initial: Duration, max_interval: Duration) -> Self {
        Self {
            interval: initial,
            max_interval,
            multiplier: 2,
            deadline: None,
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Check until it is ready, fails, or the policy's deadline passes
///
/// The check runs once immediately, and once more at the deadline.
pub async fn poll_until<T, E, F, Fut>(policy: PollPolicy, mut check: F) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Check<T, E>>,
{
    let started = Instant::now();
    let mut interval = policy.interval;

    loop {
        match check().await {
            Check::Ready(value) => return Ok(value),
            Check::Failed(err) => return Err(WaitError::Failed(err)),
            Check::Pending => {}
        }

        let mut sleep_for = interval;
        if let Some(deadline) = policy.deadline {
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(WaitError::TimedOut(deadline));
            }
            sleep_for = sleep_for.min(deadline - elapsed);
        }

        tokio::time::sleep(sleep_for).await;
        interval = interval
            .saturating_mul(policy.multiplier)
            .min(policy.max_interval);
    }
}

/// Capped exponential delay for reconnect loops
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to sleep now; doubles the next one up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
