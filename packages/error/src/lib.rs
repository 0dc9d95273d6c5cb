use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    Forbidden,
    NotFound,
    Capacity,
    Upstream,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Capacity => 503,
            Self::Upstream => 502,
            Self::Timeout => 504,
            Self::Internal => 500,
        }
    }
}

/// Wire shape for every error response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub detail: String,
}

impl ErrorBody {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{message}")]
    Validation { message: String },
    #[error("{message}")]
    Auth { message: String },
    #[error("{message}")]
    Forbidden { message: String },
    #[error("Thread not found: {thread_id}")]
    ThreadNotFound { thread_id: String },
    #[error("Maximum concurrent sessions ({max_sessions}) reached")]
    Capacity { max_sessions: usize },
    #[error("Session for user {user_id} has a turn in flight")]
    SessionBusy { user_id: String },
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Error: Authorization service unavailable")]
    AuthorizationUnavailable,
    #[error("upstream agent failure: {message}")]
    Upstream {
        message: String,
        stderr_tail: Option<String>,
    },
    #[error("turn timed out after {seconds}s")]
    TurnTimeout { seconds: u64 },
    #[error("{message}")]
    Internal { message: String },
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::ThreadNotFound { .. } => ErrorKind::NotFound,
            Self::Capacity { .. }
            | Self::SessionBusy { .. }
            | Self::ShuttingDown
            | Self::AuthorizationUnavailable => ErrorKind::Capacity,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::TurnTimeout { .. } => ErrorKind::Timeout,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    /// User-visible `detail` string. The stderr tail of an upstream failure
    /// is appended so operators can see crash diagnostics without shell
    /// access to the host.
    pub fn to_body(&self) -> ErrorBody {
        match self {
            Self::Upstream {
                message,
                stderr_tail: Some(tail),
            } if !tail.trim().is_empty() => {
                ErrorBody::new(format!("{message} (stderr: {})", tail.trim()))
            }
            other => ErrorBody::new(other.to_string()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            stderr_tail: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_kind() {
        assert_eq!(
            BridgeError::validation("Empty message").status_code(),
            400
        );
        assert_eq!(
            BridgeError::ThreadNotFound {
                thread_id: "t".into()
            }
            .status_code(),
            404
        );
        assert_eq!(BridgeError::Capacity { max_sessions: 1 }.status_code(), 503);
        assert_eq!(
            BridgeError::SessionBusy {
                user_id: "u".into()
            }
            .status_code(),
            503
        );
        assert_eq!(BridgeError::upstream("died").status_code(), 502);
        assert_eq!(BridgeError::TurnTimeout { seconds: 1 }.status_code(), 504);
    }

    #[test]
    fn thread_not_found_detail_matches_surface_contract() {
        let err = BridgeError::ThreadNotFound {
            thread_id: "invalid-id".into(),
        };
        assert_eq!(err.to_body().detail, "Thread not found: invalid-id");
    }

    #[test]
    fn upstream_detail_carries_stderr_tail() {
        let err = BridgeError::Upstream {
            message: "handshake failed".into(),
            stderr_tail: Some("panic: boom\n".into()),
        };
        assert_eq!(
            err.to_body().detail,
            "handshake failed (stderr: panic: boom)"
        );
    }
}
