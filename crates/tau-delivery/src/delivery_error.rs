use thiserror::Error;

use crate::delivery_connection::ConnectionState;

/// Error returned when a connection transition is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionTransitionError {
    #[error("invalid connection transition: {from} -> {to}")]
    Invalid {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Malformed input rejected at the pipeline boundary without mutating state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryInputError {
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },
    #[error("{field} exceeds {max} chars")]
    TooLong { field: &'static str, max: usize },
}

impl DeliveryInputError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::EmptyField { .. } => "input_empty_field",
            Self::TooLong { .. } => "input_too_long",
        }
    }
}

/// Enumerates channel send failures surfaced by transports or the gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelSendError {
    #[error("channel transport failed: {0}")]
    Transport(String),
    #[error("channel send timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("channel transport returned no result")]
    EmptyResult,
}

impl ChannelSendError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "send_transport_failed",
            Self::Timeout { .. } => "send_timeout",
            Self::EmptyResult => "send_empty_result",
        }
    }
}

/// Validates that a required text field carries non-whitespace content.
pub fn require_non_empty(field: &'static str, value: &str) -> Result<(), DeliveryInputError> {
    if value.trim().is_empty() {
        return Err(DeliveryInputError::EmptyField { field });
    }
    Ok(())
}
