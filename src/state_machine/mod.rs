mod machine;
mod pacing;
mod spec;

pub use machine::{Canceled, RetryingStateMachine, Workflow};
pub use pacing::{DEFAULT_PACING, ExponentialBackoff, FixedDelay, Pacing};
pub use spec::StateSpec;
