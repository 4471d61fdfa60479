use std::fmt::{Display, Formatter};

use crate::shutdown::ShutdownSignalError;

/// The result type for a single iteration of a scenario's iteration body.
///
/// Use `?` freely inside an iteration. Anything that isn't one of the specific [IterationError]
/// variants is converted through [IterationError::Other] and counted as a failed assertion.
pub type IterationResult = Result<(), IterationError>;

#[derive(Debug, thiserror::Error)]
pub enum IterationError {
    /// A check on a response, or any other assertion made by the iteration body, did not hold.
    #[error("Assertion failed: {0}")]
    Assertion(String),
    /// The transport could not deliver a request at all.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The iteration observed the shutdown signal and gave up part way through.
    #[error(transparent)]
    Cancelled(#[from] ShutdownSignalError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IterationError {
    pub fn assertion(msg: impl Into<String>) -> Self {
        Self::Assertion(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

/// How a single iteration ended.
///
/// Every iteration that a VU starts produces exactly one outcome, and the outcome is what gets
/// accounted for in the iteration metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Success,
    FailedAssertion(String),
    TransportError(String),
    /// The iteration was interrupted, either by the hard stop after the graceful stop period or by
    /// the iteration itself observing a shutdown.
    Aborted,
}

impl IterationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, IterationOutcome::Success)
    }

    /// Failed iterations ran to completion but did not succeed. Aborted iterations are not failed,
    /// they are tracked separately.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            IterationOutcome::FailedAssertion(_) | IterationOutcome::TransportError(_)
        )
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, IterationOutcome::Aborted)
    }
}

impl From<IterationResult> for IterationOutcome {
    fn from(result: IterationResult) -> Self {
        match result {
            Ok(()) => IterationOutcome::Success,
            Err(IterationError::Assertion(msg)) => IterationOutcome::FailedAssertion(msg),
            Err(IterationError::Transport(msg)) => IterationOutcome::TransportError(msg),
            Err(IterationError::Cancelled(_)) => IterationOutcome::Aborted,
            Err(IterationError::Other(e)) => {
                if e.is::<ShutdownSignalError>() {
                    IterationOutcome::Aborted
                } else {
                    IterationOutcome::FailedAssertion(format!("{e:#}"))
                }
            }
        }
    }
}

impl Display for IterationOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IterationOutcome::Success => write!(f, "success"),
            IterationOutcome::FailedAssertion(msg) => write!(f, "failed assertion: {msg}"),
            IterationOutcome::TransportError(msg) => write!(f, "transport error: {msg}"),
            IterationOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_results() {
        assert_eq!(IterationOutcome::from(Ok(())), IterationOutcome::Success);
        assert_eq!(
            IterationOutcome::from(Err(IterationError::assertion("status is 200"))),
            IterationOutcome::FailedAssertion("status is 200".to_string())
        );
        assert_eq!(
            IterationOutcome::from(Err(IterationError::transport("connection refused"))),
            IterationOutcome::TransportError("connection refused".to_string())
        );
        let cancelled: IterationResult = Err(ShutdownSignalError::default().into());
        assert!(IterationOutcome::from(cancelled).is_aborted());
    }

    #[test]
    fn anyhow_errors_are_failed_unless_shutdown() {
        let result: IterationResult = Err(anyhow::anyhow!("bad payload").into());
        let outcome = IterationOutcome::from(result);
        assert!(outcome.is_failed());

        let result: IterationResult = Err(anyhow::Error::new(ShutdownSignalError::default()).into());
        let outcome = IterationOutcome::from(result);
        assert!(outcome.is_aborted());
        assert!(!outcome.is_failed());
    }
}
