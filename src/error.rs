use hyper::StatusCode;
use thiserror::Error;

/// Status returned when the relay refuses to proxy a scheme it does not support.
///
/// Distinguishes "we refused this" from "the upstream failed".
pub const STATUS_UNSUPPORTED_PROTOCOL: u16 = 557;

/// Unified error type for the Rotor relay
#[derive(Error, Debug)]
pub enum RotorError {
    // Authentication errors
    #[error("No token found")]
    MissingToken,

    #[error("Authentication failed")]
    AuthenticationFailed,

    // Routing errors
    #[error("Project {project_id} is not active")]
    ProjectInactive { project_id: String },

    #[error("No proxy available for project {project_id}")]
    NoProxyAvailable { project_id: String },

    #[error("Project {project_id} is scaling up, retry later")]
    ScalingUp { project_id: String },

    // Transport errors
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("{message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    // Protocol errors
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    // Certificate errors
    #[error("Certificate error: {0}")]
    Certificate(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Rotor operations
pub type Result<T> = std::result::Result<T, RotorError>;

impl RotorError {
    /// Build a transport error without an upstream status
    pub fn transport(message: impl Into<String>) -> Self {
        RotorError::Transport {
            status: None,
            message: message.into(),
        }
    }

    /// Build a transport error carrying the upstream's own status
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        RotorError::Transport {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            RotorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            RotorError::MissingToken | RotorError::AuthenticationFailed => {
                StatusCode::UNAUTHORIZED
            }

            // 503 Service Unavailable, retryable
            RotorError::ProjectInactive { .. }
            | RotorError::NoProxyAvailable { .. }
            | RotorError::ScalingUp { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // Upstream status when the upstream gave one, 502 otherwise
            RotorError::Transport { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),

            RotorError::Tls(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            RotorError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 557 reserved
            RotorError::UnsupportedProtocol(_) => {
                StatusCode::from_u16(STATUS_UNSUPPORTED_PROTOCOL)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }

            // 500 Internal Server Error
            RotorError::TransportNotFound(_)
            | RotorError::Certificate(_)
            | RotorError::InvalidConfig(_)
            | RotorError::Io(_)
            | RotorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable identifier used in error bodies and status lines
    pub fn error_id(&self) -> &'static str {
        match self {
            RotorError::MissingToken => "no_token",
            RotorError::AuthenticationFailed => "no_project",
            RotorError::ProjectInactive { .. } => "project_inactive",
            RotorError::NoProxyAvailable { .. } => "no_proxy",
            RotorError::ScalingUp { .. } => "scaling_up",
            RotorError::TransportNotFound(_) => "build_request",
            RotorError::Transport { .. } => "transport_error",
            RotorError::Tls(_) => "tls_error",
            RotorError::UnsupportedProtocol(_) => "unsupported_protocol",
            RotorError::Certificate(_) => "certificate_error",
            RotorError::InvalidRequest(_) => "wrong_url",
            RotorError::Timeout => "timeout",
            RotorError::InvalidConfig(_) => "invalid_config",
            RotorError::Io(_) => "socket_error",
            RotorError::Internal(_) => "internal_error",
        }
    }

    /// Routing errors may succeed if the client retries later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RotorError::ProjectInactive { .. }
                | RotorError::NoProxyAvailable { .. }
                | RotorError::ScalingUp { .. }
        )
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl From<hyper::Error> for RotorError {
    fn from(err: hyper::Error) -> Self {
        RotorError::transport(err.to_string())
    }
}

impl From<rustls::Error> for RotorError {
    fn from(err: rustls::Error) -> Self {
        RotorError::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for RotorError {
    fn from(err: rcgen::Error) -> Self {
        RotorError::Certificate(err.to_string())
    }
}

impl From<url::ParseError> for RotorError {
    fn from(err: url::ParseError) -> Self {
        RotorError::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            RotorError::MissingToken.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            RotorError::AuthenticationFailed.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            RotorError::NoProxyAvailable {
                project_id: "p".to_string()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RotorError::UnsupportedProtocol("file:".to_string())
                .status_code()
                .as_u16(),
            557
        );
        assert_eq!(RotorError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            RotorError::transport("socket hang up").status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_transport_error_keeps_upstream_status() {
        let err = RotorError::upstream(407, "Proxy Authentication Required");
        assert_eq!(
            err.status_code(),
            StatusCode::PROXY_AUTHENTICATION_REQUIRED
        );
        assert_eq!(err.to_string(), "Proxy Authentication Required");

        // A 200 reported alongside a failure is not a usable error status
        let err = RotorError::upstream(200, "weird");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_retryable_and_class_helpers() {
        assert!(RotorError::ScalingUp {
            project_id: "p".to_string()
        }
        .is_retryable());
        assert!(!RotorError::AuthenticationFailed.is_retryable());
        assert!(!RotorError::UnsupportedProtocol("ftp:".into()).is_retryable());

        assert!(RotorError::InvalidRequest("bad".to_string()).is_client_error());
        assert!(RotorError::Timeout.is_server_error());
    }
}
