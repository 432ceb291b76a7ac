use std::fmt;

/// Result of asking the guest whether a condition holds yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome<T> {
    Ready(T),
    NotYet,
    Failed(String),
}

impl<T> ProbeOutcome<T> {
    pub fn failed(cause: impl fmt::Display) -> Self {
        ProbeOutcome::Failed(cause.to_string())
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, ProbeOutcome::Ready(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ProbeOutcome<U> {
        match self {
            ProbeOutcome::Ready(value) => ProbeOutcome::Ready(f(value)),
            ProbeOutcome::NotYet => ProbeOutcome::NotYet,
            ProbeOutcome::Failed(cause) => ProbeOutcome::Failed(cause),
        }
    }
}

impl<T, E: fmt::Display> From<Result<Option<T>, E>> for ProbeOutcome<T> {
    fn from(result: Result<Option<T>, E>) -> Self {
        match result {
            Ok(Some(value)) => ProbeOutcome::Ready(value),
            Ok(None) => ProbeOutcome::NotYet,
            Err(e) => ProbeOutcome::failed(e),
        }
    }
}
