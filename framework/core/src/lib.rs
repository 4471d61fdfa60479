mod outcome;
mod shutdown;

pub mod prelude {
    pub use crate::outcome::{IterationError, IterationOutcome, IterationResult};
    pub use crate::shutdown::{DelegatedShutdownListener, ShutdownHandle, ShutdownSignalError};
}
