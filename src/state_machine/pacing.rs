use std::time::Duration;

/// Default wait between retries of a non-advancing state.
pub const DEFAULT_PACING: Duration = Duration::from_secs(5);

/// Strategy for how long to wait before re-running a state that did not
/// advance. `attempt` is the number of consecutive non-advancing runs of the
/// current state, starting at 1.
pub trait Pacing: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Fixed delay between retries.
///
/// The machine still tracks the consecutive-failure count and hands it to the
/// strategy, but this default ignores it: stuck states are re-tried at a
/// steady cadence while the external system converges.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

impl Default for FixedDelay {
    fn default() -> Self {
        Self(DEFAULT_PACING)
    }
}

impl Pacing for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Pacing for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        (self.base * 2u32.saturating_pow(exponent)).min(self.max)
    }
}
