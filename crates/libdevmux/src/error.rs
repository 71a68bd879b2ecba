use devmux_protocol::{ConnId, ErrorCode, SessionId};
use thiserror::Error;

/// Failures reported by a terminal engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("connection {conn_id} not attached to session {session_id}")]
    ConnectionNotFound {
        session_id: SessionId,
        conn_id: ConnId,
    },

    #[error("session already exited: {0}")]
    SessionExited(SessionId),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A virtual path that does not stay inside the sandbox root.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("path escapes sandbox root: {0}")]
    Escape(String),

    #[error("path contains a NUL byte")]
    NulByte,
}

/// Delivery failure on an attached stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("stream closed")]
    Closed,

    #[error("stream write failed: {0}")]
    Write(String),
}

/// Errors returned by the terminal RPC handlers.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("permission denied: execute capability required")]
    PermissionDenied,

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("sandbox violation: {0}")]
    SandboxViolation(#[from] SandboxError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ManagerError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            ManagerError::Validation(_) => (ErrorCode::InvalidRequest, self.to_string()),
            ManagerError::PermissionDenied => (ErrorCode::PermissionDenied, self.to_string()),
            ManagerError::SessionNotFound(_) => (ErrorCode::SessionNotFound, self.to_string()),
            ManagerError::SandboxViolation(_) => (ErrorCode::SandboxViolation, self.to_string()),
            ManagerError::Internal(_) => (ErrorCode::ServerError, "internal error".to_string()),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ManagerError::Validation(message.into())
    }
}
