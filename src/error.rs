//! Error types for the CRI proxy.

use std::result;
use std::time::Duration;

use thiserror::Error;
use tonic::{Code, Status};

use crate::cri::Revision;

/// A specialized Result type for proxy operations.
pub type Result<T> = result::Result<T, ProxyError>;

/// Failure of a single connection attempt.
///
/// Cloneable so one attempt's outcome can be handed to every caller that
/// was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to connect to {address:?}: {reason}")]
pub struct ConnectError {
    pub address: String,
    pub reason: String,
}

impl ConnectError {
    pub fn new(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            reason: reason.into(),
        }
    }
}

/// The error type for proxy operations.
#[derive(Error, Debug)]
pub enum ProxyError {
    // ─────────────────────────────────────────────────────────────────────
    // Startup
    // ─────────────────────────────────────────────────────────────────────
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ─────────────────────────────────────────────────────────────────────
    // Backend availability
    // ─────────────────────────────────────────────────────────────────────
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("{address:?}: not connected")]
    NotConnected { address: String },

    #[error("criproxy: target runtime {0:?} is not available")]
    TargetUnavailable(String),

    #[error("{address:?}: runtime did not become ready within {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("{address:?}: connection was replaced while the call was in flight")]
    StaleConnection { address: String },

    // ─────────────────────────────────────────────────────────────────────
    // Routing
    // ─────────────────────────────────────────────────────────────────────
    #[error("criproxy: unknown runtime: {0:?}")]
    UnknownRuntime(String),

    #[error("criproxy: image {0:?} is for a wrong runtime")]
    WrongRuntime(String),

    #[error("criproxy: no image specified")]
    NoImage,

    #[error("criproxy: {frontend} requests cannot be served by a {backend} runtime")]
    IncompatibleRevision { frontend: Revision, backend: Revision },

    #[error("no handler for method {0:?}")]
    UnknownMethod(String),

    // ─────────────────────────────────────────────────────────────────────
    // Backend-reported
    // ─────────────────────────────────────────────────────────────────────
    /// Status returned by a backend, not yet classified. `generation`
    /// is that of the channel the call went out on.
    #[error("{}", .status.message())]
    Rpc { status: Status, generation: u64 },

    #[error("{address:?}: {}", .status.message())]
    Backend { address: String, status: Status },

    #[error("{}", .0.join("\n"))]
    Broadcast(Vec<String>),

    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl ProxyError {
    /// gRPC code this error is reported with.
    pub fn code(&self) -> Code {
        match self {
            ProxyError::Config(_) | ProxyError::IncompatibleRevision { .. } => {
                Code::FailedPrecondition
            }
            ProxyError::Transport(_) | ProxyError::Io(_) => Code::Internal,
            ProxyError::Connect(_)
            | ProxyError::NotConnected { .. }
            | ProxyError::TargetUnavailable(_)
            | ProxyError::ConnectTimeout { .. }
            | ProxyError::StaleConnection { .. } => Code::Unavailable,
            ProxyError::UnknownRuntime(_)
            | ProxyError::WrongRuntime(_)
            | ProxyError::NoImage
            | ProxyError::Decode(_) => Code::InvalidArgument,
            ProxyError::UnknownMethod(_) => Code::Unimplemented,
            ProxyError::Rpc { status, .. } | ProxyError::Backend { status, .. } => status.code(),
            ProxyError::Broadcast(_) => Code::Unknown,
        }
    }
}

impl From<config::ConfigError> for ProxyError {
    fn from(err: config::ConfigError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::Config(format!("invalid stream url: {}", err))
    }
}

impl From<ProxyError> for Status {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Rpc { status, .. } => status,
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_keeps_code() {
        let err = ProxyError::Backend {
            address: "/run/alt.sock".to_string(),
            status: Status::not_found("no such sandbox"),
        };
        let status: Status = err.into();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "\"/run/alt.sock\": no such sandbox");
    }

    #[test]
    fn test_routing_errors_are_invalid_argument() {
        for err in [
            ProxyError::NoImage,
            ProxyError::UnknownRuntime("kata".to_string()),
            ProxyError::WrongRuntime("alt/nginx".to_string()),
        ] {
            assert_eq!(Status::from(err).code(), Code::InvalidArgument);
        }
    }

    #[test]
    fn test_broadcast_joins_messages() {
        let err = ProxyError::Broadcast(vec!["a: down".to_string(), "b: down".to_string()]);
        assert_eq!(err.to_string(), "a: down\nb: down");
        assert_eq!(Status::from(err).code(), Code::Unknown);
    }
}
