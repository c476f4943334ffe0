//! Fixed-interval polling with a bounded number of attempts.

use std::future::Future;
use std::time::Duration;
use tracing::trace;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Done(T),
    NotYet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Done(T),
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedRetry {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl BoundedRetry {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound on the time spent sleeping between probes.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }

    /// Run `probe` until it reports `Done` or the attempts run out.
    ///
    /// The probe runs first without delay; the interval is slept after every
    /// `NotYet`. The probe receives the zero-based attempt number.
    pub async fn poll<T, F, Fut>(&self, mut probe: F) -> PollOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Probe<T>>,
    {
        for attempt in 0..self.max_attempts {
            if let Probe::Done(value) = probe(attempt).await {
                return PollOutcome::Done(value);
            }
            trace!(attempt, interval_ms = self.interval.as_millis() as u64, "Probe not ready");
            tokio::time::sleep(self.interval).await;
        }
        PollOutcome::Exhausted {
            attempts: self.max_attempts,
        }
    }
}
