//! Error types for the busgate core.
//!
//! Every failure that can leave an endpoint or a session is expressed as a
//! [`GatewayError`]. Failures are never raised across the reactor; they are
//! handed to status handlers, response handlers or request handlers instead.

use thiserror::Error;

/// Main error type for the busgate core.
#[derive(Debug, Error)]
pub enum GatewayError {
    // Endpoint setup errors
    #[error("Missing connection parameters")]
    NoParams,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Cannot resolve {host}:{service}: {message}")]
    CannotResolve {
        host: String,
        service: String,
        message: String,
    },

    // Connection lifecycle errors
    #[error("No connection could be established to {target}")]
    NoConnection { target: String },

    #[error("Connection hung up: {0}")]
    HungUp(String),

    #[error("Connection closed")]
    Closed,

    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    // OS-level socket errors
    #[error("{context}: {source}")]
    Socket {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // JSON-RPC errors, either protocol violations or produced by an application handler
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for busgate operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Coarse classification of a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Name or service lookup failed.
    Resolution,
    /// No candidate address could be connected, or the session lost its connection.
    Connection,
    /// The remote side hung up.
    PeerClosed,
    /// Closed from this side.
    LocalClosed,
    /// Raw OS-level socket or framing failure.
    Transport,
    /// Malformed JSON-RPC envelope.
    Protocol,
    /// Error produced by an application request handler.
    Application,
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Socket {
            context: "Socket I/O error".to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl GatewayError {
    /// Wrap an OS error with a description of what was being attempted.
    pub fn socket(context: impl Into<String>, source: std::io::Error) -> Self {
        GatewayError::Socket {
            context: context.into(),
            source,
        }
    }

    /// Create a JSON-RPC error without data.
    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        GatewayError::Rpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::NoParams
            | GatewayError::Unsupported(_)
            | GatewayError::CannotResolve { .. }
            | GatewayError::Config { .. } => ErrorCategory::Resolution,

            GatewayError::NoConnection { .. }
            | GatewayError::ConnectionClosed
            | GatewayError::NotConnected => ErrorCategory::Connection,

            GatewayError::HungUp(_) => ErrorCategory::PeerClosed,

            GatewayError::Closed => ErrorCategory::LocalClosed,

            GatewayError::Socket { .. } | GatewayError::FrameTooLarge { .. } => {
                ErrorCategory::Transport
            }

            GatewayError::Json { .. } => ErrorCategory::Protocol,

            // -32768..=-32600 is reserved by JSON-RPC for protocol-level errors
            GatewayError::Rpc { code, .. } if (-32768..=-32600).contains(code) => {
                ErrorCategory::Protocol
            }
            GatewayError::Rpc { .. } => ErrorCategory::Application,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32603: Internal error
    /// - -32000: Transport-surfaced error
    ///
    /// `Rpc` errors keep the code they carry.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            GatewayError::Rpc { code, .. } => *code,

            GatewayError::Json { .. } => crate::rpc::PARSE_ERROR,

            GatewayError::Socket { .. }
            | GatewayError::FrameTooLarge { .. }
            | GatewayError::HungUp(_)
            | GatewayError::NoConnection { .. }
            | GatewayError::NotConnected => crate::rpc::SERVER_ERROR,

            _ => crate::rpc::INTERNAL_ERROR,
        }
    }

    /// Check if a caller-side restart policy may reasonably retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Resolution | ErrorCategory::Connection | ErrorCategory::PeerClosed
        ) && !matches!(
            self,
            GatewayError::NoParams | GatewayError::Unsupported(_) | GatewayError::Config { .. }
        )
    }
}
