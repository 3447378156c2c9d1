//! Supervisor error types.

use std::time::Duration;

use thiserror::Error;

use crate::schema::Interval;

/// Step of the open protocol that a timeout interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStep {
    Connect,
    Subscribe,
    Interval,
}

impl std::fmt::Display for OpenStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OpenStep::Connect => "connect",
            OpenStep::Subscribe => "subscribe",
            OpenStep::Interval => "interval open",
        })
    }
}

/// Failure of one open / close unit of work.
///
/// Admission errors are raised before any network effect; every
/// other variant is isolated to the single key it names.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Symbol empty or not alphanumeric after normalization.
    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),

    /// Interval outside the configured interval set.
    #[error("interval {0} is not in the configured interval set")]
    IntervalNotConfigured(Interval),

    /// Registry is at `max_symbols × |intervals|`.
    #[error("capacity exceeded: registry holds the maximum of {limit} streams")]
    CapacityExceeded { limit: usize },

    /// Another open for the same key has not finished yet.
    #[error("an open for {0} is already in progress")]
    OpenInProgress(String),

    /// Still denied after waiting out one rate-limit window.
    #[error("rate limited, retry in {wait_ms}ms")]
    RateLimited { wait_ms: u64 },

    #[error("upstream client unavailable: {0}")]
    ClientInit(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("message handler wiring failed: {0}")]
    Wiring(String),

    #[error("{step} timed out after {timeout:?}")]
    StepTimeout { step: OpenStep, timeout: Duration },
}

impl StreamError {
    /// True for failures rejected before any network call.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            StreamError::InvalidSymbol(_)
                | StreamError::IntervalNotConfigured(_)
                | StreamError::CapacityExceeded { .. }
                | StreamError::OpenInProgress(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_admission_errors() {
        assert!(StreamError::CapacityExceeded { limit: 7 }.is_admission());
        assert!(StreamError::InvalidSymbol("".into()).is_admission());
        assert!(!StreamError::Connect("refused".into()).is_admission());
    }

    #[test]
    fn messages_name_the_failed_step() {
        let err = StreamError::StepTimeout {
            step: OpenStep::Subscribe,
            timeout: Duration::from_secs(15),
        };
        assert_eq!(err.to_string(), "subscribe timed out after 15s");
    }
}
