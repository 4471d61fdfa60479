mod check;
mod cli;
pub mod config;
mod context;
mod definition;
mod executor;
mod init;
mod monitor;
mod progress;
mod retry;
mod run;
mod run_state;
mod scheduler;
mod shutdown;
mod stage;
mod transport;
mod types;
mod vu;

#[cfg(test)]
mod test_support;

pub mod prelude {
    pub use crate::check::{Checks, Predicate};
    pub use crate::cli::SquallCli;
    pub use crate::config::{OverflowPolicy, RunConfig, ScenarioConfig};
    pub use crate::context::{RunnerContext, UserValuesConstraint, VuContext};
    pub use crate::definition::{HookResult, ScenarioDefinitionBuilder};
    pub use crate::executor::Executor;
    pub use crate::init::init;
    pub use crate::retry::{Backoff, RetryOutcome, RetryPolicy};
    pub use crate::run::{exit_code, run, RunOutcome, EXIT_CONFIG_FAULT, EXIT_THRESHOLDS_FAILED};
    pub use crate::run_state::{RunState, ScenarioPhase};
    pub use crate::stage::{Stage, Stages};
    pub use crate::transport::{Request, Response, Transport, TransportError};
    pub use crate::types::SquallResult;

    pub use squall_core::prelude::*;
    pub use squall_instruments::prelude::*;
}
