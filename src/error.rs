//! Engine-wide error taxonomy
//!
//! Every public operation on a binding returns an explicit result; nothing
//! escapes the engine boundary by panicking. Transport-level failures are
//! carried verbatim in `Transport` and are also what the sink receives as
//! the terminal result.

use thiserror::Error;

use crate::binding::state::BindState;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("no transport registered for scheme: {0}")]
    SchemeNotSupported(String),

    #[error("operation `{op}` invalid in state {state:?}")]
    InvalidState { op: &'static str, state: BindState },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("allocation failed: {0}")]
    Allocation(&'static str),

    #[error("redirect rejected: {0}")]
    RedirectRejected(String),
}

impl BindError {
    /// Stable identifier for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            BindError::SchemeNotSupported(_) => "SCHEME_NOT_SUPPORTED",
            BindError::InvalidState { .. } => "INVALID_STATE",
            BindError::Transport(_) => "TRANSPORT_FAILURE",
            BindError::Allocation(_) => "ALLOCATION_FAILURE",
            BindError::RedirectRejected(_) => "REDIRECT_REJECTED",
        }
    }
}

impl From<TransportError> for BindError {
    fn from(value: TransportError) -> Self {
        BindError::Transport(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BindError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = BindError::SchemeNotSupported("gopher".to_string());
        assert_eq!(err.code(), "SCHEME_NOT_SUPPORTED");

        let err = BindError::InvalidState {
            op: "terminate",
            state: BindState::Active,
        };
        assert_eq!(err.code(), "INVALID_STATE");
        assert!(err.to_string().contains("terminate"));
    }

    #[test]
    fn test_transport_error_carried_verbatim() {
        let err: BindError =
            TransportError::Failed("connection reset".to_string()).into();
        assert!(err.to_string().contains("connection reset"));
    }
}
