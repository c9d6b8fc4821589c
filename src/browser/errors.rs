//! Relay error types

use thiserror::Error;

/// Errors surfaced by the relay.
///
/// `Clone` is required: launch, session creation and engine reset are all
/// single-flighted, and every waiter on a shared in-flight task receives
/// the same outcome.
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("Failed to launch browser engine: {0}")]
    LaunchFailed(String),

    #[error("Browser engine unavailable: {0}")]
    Unavailable(String),

    #[error("Session creation failed: {0}")]
    SessionCreation(String),

    #[error("Request execution failed: {0}")]
    RequestFailed(String),
}

impl From<RelayError> for String {
    fn from(err: RelayError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_variant_context() {
        let err = RelayError::SessionCreation("no context".to_string());
        assert_eq!(err.to_string(), "Session creation failed: no context");

        let message: String = RelayError::Unavailable("shut down".to_string()).into();
        assert!(message.contains("unavailable"));
    }
}
