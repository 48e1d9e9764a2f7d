use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::frame::FrameError;

/// Error body carried by a `res` frame with `ok:false`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("gateway not connected")]
    NotConnected,
    #[error("gateway handshake rejected: {}", .0.message)]
    HandshakeRejected(RemoteError),
    #[error("gateway closed ({code}): {reason}")]
    ConnectionClosed { code: u16, reason: String },
    #[error("gateway client stopped")]
    ClientStopped,
    #[error("{}", .0.message)]
    Remote(RemoteError),
    #[error("gateway request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("invalid response payload: {0}")]
    InvalidPayload(String),
    #[error("gateway connect failed: {0}")]
    Connect(String),
    #[error("invalid gateway config: {0}")]
    Config(String),
}

impl GatewayError {
    /// Server-supplied error code, when the failure came from the gateway.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            GatewayError::Remote(err) | GatewayError::HandshakeRejected(err) => Some(&err.code),
            _ => None,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            GatewayError::NotConnected
                | GatewayError::ConnectionClosed { .. }
                | GatewayError::ClientStopped
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_displays_server_message_only() {
        let err = GatewayError::Remote(RemoteError::new("E_UNAVAILABLE", "db down"));
        assert_eq!(err.to_string(), "db down");
        assert_eq!(err.remote_code(), Some("E_UNAVAILABLE"));
    }

    #[test]
    fn connection_closed_mentions_code_and_reason() {
        let err = GatewayError::ConnectionClosed {
            code: 1006,
            reason: String::new(),
        };
        assert_eq!(err.to_string(), "gateway closed (1006): ");
        assert!(err.is_disconnect());
        assert!(!GatewayError::Timeout(Duration::from_secs(1)).is_disconnect());
    }
}
