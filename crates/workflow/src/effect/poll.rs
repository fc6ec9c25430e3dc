//! Poll-until-terminal helper for continuous effects

use crate::error::EffectError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// How often, and for how long, a probe is repeated
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Delay before the second probe
    pub interval: Duration,
    /// Upper bound for the delay once backoff kicks in
    pub max_interval: Duration,
    /// Multiplier applied to the delay after every probe; `1.0` polls at a fixed rate
    pub backoff: f64,
    /// Give up once this much time has passed
    pub deadline: Option<Duration>,
    /// Give up after this many probes
    pub max_attempts: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            backoff: 1.5,
            deadline: Some(Duration::from_secs(600)),
            max_attempts: None,
        }
    }
}

impl PollPolicy {
    /// Fixed interval without a deadline
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            backoff: 1.0,
            deadline: None,
            max_attempts: None,
        }
    }

    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff = factor;
        self.max_interval = max_interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay following `current`
    pub fn next_delay(&self, current: Duration) -> Duration {
        let cap = self.max_interval.max(self.interval);
        if !(self.backoff.is_finite() && self.backoff > 1.0) {
            return current.min(cap);
        }
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff)
            .map_or(cap, |next| next.min(cap))
    }
}

/// Run `probe` until it yields a value, the policy gives up, or `cancel` fires.
///
/// The probe runs immediately, then after each delay. Probe errors abort polling.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T, EffectError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, EffectError>>,
{
    let started = Instant::now();
    let mut delay = policy.interval;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(EffectError::Cancelled);
        }
        attempt += 1;
        if let Some(value) = probe(attempt).await? {
            return Ok(value);
        }

        let elapsed = started.elapsed();
        let out_of_time = policy.deadline.is_some_and(|deadline| elapsed >= deadline);
        let out_of_attempts = policy.max_attempts.is_some_and(|max| attempt >= max);
        if out_of_time || out_of_attempts {
            return Err(EffectError::Timeout { elapsed });
        }

        trace!(attempt, delay_ms = delay.as_millis() as u64, "Polling again");
        tokio::select! {
            _ = cancel.cancelled() => return Err(EffectError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = policy.next_delay(delay);
    }
}
