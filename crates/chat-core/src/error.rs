use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Error taxonomy used for retry decisions and user-facing remediation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChatErrorKind {
    /// Credential failed local shape validation. Never retried.
    InvalidCredentialFormat,
    /// Remote refused the credential while connecting. Never retried.
    CredentialRejected,
    /// Network failure or timeout while connecting or mid-session.
    TransientConnectionFailure,
    /// Remote service answered with a server-side failure.
    ServiceUnavailable,
    /// Remote reported the session token as expired. Terminal.
    AuthorizationExpired,
    /// Remote closed the conversation.
    RemoteClosed,
    /// Payload could not be normalized. Diagnostic only.
    MalformedActivity,
    /// Timestamp far from the local clock. Diagnostic only.
    OrderingAnomaly,
    /// Session-history persistence failure.
    Storage,
    /// Invalid configuration or input.
    Config,
    /// Invariant break or invalid state transition.
    Internal,
}

impl ChatErrorKind {
    /// Whether the supervisor may retry after this error.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::TransientConnectionFailure | Self::ServiceUnavailable
        )
    }
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind:?}:{code}: {message}")]
pub struct ChatError {
    pub kind: ChatErrorKind,
    /// Stable machine-readable error code.
    pub code: String,
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    pub fn new(kind: ChatErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorKind::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is in state {current:?}"),
        )
    }

    pub fn invalid_credential(reason: impl Into<String>) -> Self {
        Self::new(
            ChatErrorKind::InvalidCredentialFormat,
            "invalid_credential_format",
            reason,
        )
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ChatErrorKind::TransientConnectionFailure,
            "connect_timeout",
            format!("connection attempt timed out after {}ms", after.as_millis()),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Map HTTP status codes returned while opening a conversation.
pub fn classify_http_status(status: u16) -> ChatErrorKind {
    match status {
        401 | 403 => ChatErrorKind::CredentialRejected,
        408 | 429 => ChatErrorKind::TransientConnectionFailure,
        400..=499 => ChatErrorKind::Config,
        500..=599 => ChatErrorKind::ServiceUnavailable,
        _ => ChatErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), ChatErrorKind::CredentialRejected);
        assert_eq!(classify_http_status(403), ChatErrorKind::CredentialRejected);
        assert_eq!(
            classify_http_status(429),
            ChatErrorKind::TransientConnectionFailure
        );
        assert_eq!(classify_http_status(404), ChatErrorKind::Config);
        assert_eq!(classify_http_status(503), ChatErrorKind::ServiceUnavailable);
        assert_eq!(classify_http_status(700), ChatErrorKind::Internal);
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = ChatError::invalid_state(ConnectionState::Online, "start");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.kind, ChatErrorKind::Internal);
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = ChatError::new(
            ChatErrorKind::TransientConnectionFailure,
            "rate_limited",
            "wait",
        )
        .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }

    #[test]
    fn only_network_and_service_failures_are_retryable() {
        assert!(ChatErrorKind::TransientConnectionFailure.is_retryable());
        assert!(ChatErrorKind::ServiceUnavailable.is_retryable());
        assert!(!ChatErrorKind::CredentialRejected.is_retryable());
        assert!(!ChatErrorKind::AuthorizationExpired.is_retryable());
        assert!(!ChatErrorKind::InvalidCredentialFormat.is_retryable());
    }
}
