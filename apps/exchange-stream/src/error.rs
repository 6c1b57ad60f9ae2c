//! Crate-level error taxonomy.
//!
//! Setup-time failures of `watch_*`/`unwatch_*` calls are reported as a
//! [`StreamError`]. Each variant maps to a stable [`ErrorCode`] so callers can
//! branch on the failure class without matching on message text.
//!
//! | Code | Raised when |
//! |------|-------------|
//! | `CONNECT_FAIL` | Dialing an endpoint failed or timed out |
//! | `READ_FAIL` | The socket failed while a setup step was waiting on it |
//! | `INVALID_MESSAGE` | A frame could not be built or parsed |
//! | `UNAUTHORIZED` | Login was rejected, or no credentials were configured |
//! | `TIMEOUT` | Login did not complete within the configured bound |
//! | `PARAM_REQUIRED` | A watch call is missing a required argument |
//! | `PARAM_INVALID` | A watch argument is out of range or unknown |
//! | `NOT_SUPPORTED` | The exchange protocol has no such stream |
//! | `BAD_SYMBOL` | The market catalog does not know the symbol |
//! | `CONNECTION_CLOSED` | The connection went away during setup |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::ports::CatalogError;
use crate::infrastructure::ws::{AuthError, ConnectionError};

/// Stable error codes for the streaming engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Dialing an endpoint failed.
    ConnectFail,
    /// Reading from a socket failed.
    ReadFail,
    /// A frame was malformed.
    InvalidMessage,
    /// Authentication failed.
    Unauthorized,
    /// An operation timed out.
    Timeout,
    /// A required parameter is missing.
    ParamRequired,
    /// A parameter is invalid.
    ParamInvalid,
    /// The stream is not supported by the exchange.
    NotSupported,
    /// Unknown symbol.
    BadSymbol,
    /// The connection closed.
    ConnectionClosed,
}

impl ErrorCode {
    /// Get the reason string for this code.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::ConnectFail => "CONNECT_FAIL",
            Self::ReadFail => "READ_FAIL",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Timeout => "TIMEOUT",
            Self::ParamRequired => "PARAM_REQUIRED",
            Self::ParamInvalid => "PARAM_INVALID",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::BadSymbol => "BAD_SYMBOL",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
        }
    }

    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectFail | Self::ReadFail | Self::Timeout | Self::ConnectionClosed
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

/// Errors returned by the engine's watch and unwatch operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Could not connect to an endpoint.
    #[error("connect to {url} failed: {reason}")]
    ConnectFail {
        /// Endpoint URL.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// Reading from the socket failed.
    #[error("read failed: {0}")]
    ReadFail(String),

    /// A frame could not be encoded or decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The exchange rejected the login, or credentials are missing.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// An operation exceeded its time bound.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A required argument was not supplied.
    #[error("missing required parameter: {0}")]
    ParamRequired(String),

    /// An argument was out of range or not recognized.
    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    /// The exchange protocol does not offer this stream.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Market catalog lookup failed.
    #[error(transparent)]
    Market(#[from] CatalogError),

    /// The connection closed before the operation finished.
    #[error("connection closed")]
    ConnectionClosed,
}

impl StreamError {
    /// Get the stable error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ConnectFail { .. } => ErrorCode::ConnectFail,
            Self::ReadFail(_) => ErrorCode::ReadFail,
            Self::InvalidMessage(_) => ErrorCode::InvalidMessage,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::ParamRequired(_) => ErrorCode::ParamRequired,
            Self::ParamInvalid(_) => ErrorCode::ParamInvalid,
            Self::NotSupported(_) => ErrorCode::NotSupported,
            Self::Market(_) => ErrorCode::BadSymbol,
            Self::ConnectionClosed => ErrorCode::ConnectionClosed,
        }
    }
}

impl From<AuthError> for StreamError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredentials(account) => {
                Self::Unauthorized(format!("no credentials for account {account}"))
            }
            AuthError::Rejected { code, message } => {
                Self::Unauthorized(format!("login rejected ({code}): {message}"))
            }
            AuthError::Timeout => Self::Timeout("login".to_string()),
            AuthError::ConnectionLost | AuthError::SendFailed => Self::ConnectionClosed,
            AuthError::Signing(reason) => Self::InvalidMessage(reason),
        }
    }
}

impl From<ConnectionError> for StreamError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Connect { url, reason } => Self::ConnectFail { url, reason },
            ConnectionError::ConnectTimeout { url } => Self::ConnectFail {
                url,
                reason: "timed out".to_string(),
            },
            ConnectionError::Read(reason) => Self::ReadFail(reason),
            ConnectionError::Encode(reason) => Self::InvalidMessage(reason),
            ConnectionError::Reset
            | ConnectionError::Eof
            | ConnectionError::Closed { .. }
            | ConnectionError::SendQueueClosed
            | ConnectionError::ClientClosed => Self::ConnectionClosed,
            ConnectionError::SendQueueFull => Self::Timeout("send queue full".to_string()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_from_variants() {
        assert_eq!(
            StreamError::ParamInvalid("depth".into()).code(),
            ErrorCode::ParamInvalid
        );
        assert_eq!(StreamError::ConnectionClosed.code(), ErrorCode::ConnectionClosed);
        assert_eq!(
            StreamError::Market(CatalogError::UnknownSymbol("X/Y".into())).code(),
            ErrorCode::BadSymbol
        );
    }

    #[test]
    fn auth_errors_convert() {
        let err: StreamError = AuthError::Timeout.into();
        assert_eq!(err.code(), ErrorCode::Timeout);

        let err: StreamError = AuthError::Rejected {
            code: "60009".into(),
            message: "Login failed.".into(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
        assert!(err.to_string().contains("60009"));
    }

    #[test]
    fn connection_errors_convert() {
        let err: StreamError = ConnectionError::Connect {
            url: "wss://x".into(),
            reason: "refused".into(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::ConnectFail);
        assert!(err.code().is_transient());

        let err: StreamError = ConnectionError::Eof.into();
        assert_eq!(err.code(), ErrorCode::ConnectionClosed);
    }

    #[test]
    fn reason_strings_are_screaming_snake() {
        assert_eq!(ErrorCode::BadSymbol.reason(), "BAD_SYMBOL");
        assert_eq!(ErrorCode::Unauthorized.to_string(), "UNAUTHORIZED");
    }
}
