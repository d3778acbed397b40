use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::pacing::{FixedDelay, Pacing};
use super::spec::StateSpec;

/// A workflow driven by a [`RetryingStateMachine`].
///
/// Each state's handler receives the recommended next state (the entry
/// following the current one in specification order) and returns the actual
/// next state. Returning the recommendation is the common case; returning the
/// current state means "not done yet, retry me"; returning any other listed
/// state is a legal jump.
#[async_trait]
pub trait Workflow: Send {
    type State: Copy + Eq + fmt::Display + Send + Sync + 'static;

    fn spec(&self) -> StateSpec<Self::State>;

    fn name(&self) -> &str;

    async fn step(
        &mut self,
        state: Self::State,
        recommended: Option<Self::State>,
    ) -> Result<Self::State>;
}

/// Returned by [`RetryingStateMachine::run`] when a cancellation token fires.
#[derive(Debug, Error)]
#[error("state machine \"{0}\" canceled")]
pub struct Canceled(pub String);

/// Drives a [`Workflow`] from its initial state to its terminal state.
///
/// Designed for mostly-linear provisioning workflows against an eventually
/// consistent external system: a handler error is caught, logged and treated
/// as "retry the same state", with no retry limit. An entity whose external
/// dependency never becomes ready spins at the pacing cadence until an
/// operator intervenes (or a cancellation token is installed).
pub struct RetryingStateMachine<W: Workflow> {
    workflow: W,
    state: W::State,
    backoff: u32,
    retries_total: u32,
    pacing: Box<dyn Pacing>,
    cancel: Option<CancellationToken>,
}

impl<W: Workflow> RetryingStateMachine<W> {
    pub fn new(workflow: W) -> Self {
        let state = workflow.spec().initial();
        Self {
            workflow,
            state,
            backoff: 0,
            retries_total: 0,
            pacing: Box::new(FixedDelay::default()),
            cancel: None,
        }
    }

    pub fn with_pacing(mut self, pacing: impl Pacing + 'static) -> Self {
        self.pacing = Box::new(pacing);
        self
    }

    /// Install a cancellation token checked at loop boundaries and during
    /// pacing sleeps. Without one the machine retries forever.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn state(&self) -> W::State {
        self.state
    }

    /// Consecutive non-advancing runs of the current state.
    pub fn backoff(&self) -> u32 {
        self.backoff
    }

    /// Non-advancing runs over the machine's whole lifetime.
    pub fn retries_total(&self) -> u32 {
        self.retries_total
    }

    pub fn workflow(&self) -> &W {
        &self.workflow
    }

    pub fn into_inner(self) -> W {
        self.workflow
    }

    /// Loop until the workflow reaches its terminal state. The terminal
    /// state's handler is never invoked.
    pub async fn run(&mut self) -> Result<()> {
        let spec = self.workflow.spec();

        while self.state != spec.terminal() {
            if let Some(token) = &self.cancel
                && token.is_cancelled()
            {
                return Err(Canceled(self.workflow.name().to_owned()).into());
            }

            let recommended = spec.recommended_after(self.state);
            info!(
                machine = self.workflow.name(),
                state = %self.state,
                "running state"
            );

            let next = match self.workflow.step(self.state, recommended).await {
                Ok(next) => next,
                Err(error) => {
                    warn!(
                        machine = self.workflow.name(),
                        state = %self.state,
                        "state failed, will retry: {error:#}"
                    );
                    self.state
                }
            };

            if next == self.state {
                self.backoff += 1;
                self.retries_total += 1;
                self.pause().await?;
            } else {
                self.state = next;
                self.backoff = 0;
            }
        }

        info!(machine = self.workflow.name(), "state machine complete");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        let delay = self.pacing.delay(self.backoff);
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        Err(Canceled(self.workflow.name().to_owned()).into())
                    }
                    _ = sleep(delay) => Ok(()),
                }
            }
            None => {
                sleep(delay).await;
                Ok(())
            }
        }
    }
}
