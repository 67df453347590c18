//! Typed error kinds for the RTM protocol engine.
//!
//! Every error a handler can return is a variant here, not a string-sniffed
//! `anyhow::Error`, so the dispatcher's kind-to-wire-string mapping is the
//! single place that needs updating when a new failure mode is added.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtmError {
    #[error("malformed frame: {0}")]
    BadSchema(String),

    #[error("action {action:?} needs authentication")]
    Unauthenticated { action: String },

    #[error("action {action:?} permission denied")]
    PermissionDenied { action: String },

    #[error("missing or invalid field: {0}")]
    BadRequest(String),

    #[error("subscription {0:?} already exists")]
    DuplicateSubscription(String),

    #[error("no such subscription {0:?}")]
    UnknownSubscription(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend error: {0}")]
    BackendError(String),

    #[error("authentication failed")]
    AuthFailed,
}

impl RtmError {
    /// Machine-stable kind string carried alongside the human message in
    /// every `/error` response body.
    pub fn kind(&self) -> &'static str {
        match self {
            RtmError::BadSchema(_) => "bad_schema",
            RtmError::Unauthenticated { .. } => "unauthenticated",
            RtmError::PermissionDenied { .. } => "permission_denied",
            RtmError::BadRequest(_) => "bad_request",
            RtmError::DuplicateSubscription(_) => "duplicate_subscription",
            RtmError::UnknownSubscription(_) => "unknown_subscription",
            RtmError::BackendUnavailable(_) => "backend_unavailable",
            RtmError::BackendError(_) => "backend_error",
            RtmError::AuthFailed => "auth_failed",
        }
    }

    /// Whether this error leaves the connection unusable — only a malformed
    /// frame does; everything else is recoverable on the same socket.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, RtmError::BadSchema(_))
    }
}

/// Backend-specific failures, narrower than [`RtmError`] — the backend
/// client deals only in these and callers fold them into `BackendUnavailable`
/// / `BackendError` at the handler boundary.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("protocol parse error: {0}")]
    Protocol(String),
    #[error("server error: {0}")]
    Server(String),
}

impl BackendError {
    /// Transient failures are worth a reconnect-and-retry; a `Server` reply
    /// is a real error the caller must surface and stop retrying on.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::ConnectionRefused(_) | BackendError::Timeout(_) | BackendError::ConnectionReset(_)
        )
    }
}

impl From<BackendError> for RtmError {
    fn from(e: BackendError) -> Self {
        if e.is_transient() {
            RtmError::BackendUnavailable(e.to_string())
        } else {
            RtmError::BackendError(e.to_string())
        }
    }
}

impl From<redis::RedisError> for BackendError {
    fn from(e: redis::RedisError) -> Self {
        use redis::ErrorKind;
        if e.is_connection_refusal() {
            BackendError::ConnectionRefused(e.to_string())
        } else if e.is_timeout() {
            BackendError::Timeout(e.to_string())
        } else if e.is_connection_dropped() {
            BackendError::ConnectionReset(e.to_string())
        } else {
            match e.kind() {
                ErrorKind::TypeError | ErrorKind::ParseError => BackendError::Protocol(e.to_string()),
                _ => BackendError::Server(e.to_string()),
            }
        }
    }
}
