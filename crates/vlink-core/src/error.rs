//! Unified error types for the vlink core library.
//!
//! [`LinkError`] is the error every public operation returns. Its variants are
//! the failure kinds callers branch on (not connected, circuit open, timed out,
//! retries exhausted, ...), so an API layer can tell a systemically unhealthy
//! link apart from a one-off failure without matching on strings.
//!
//! [`TransportError`] is what the transport collaborator reports. It is wrapped
//! into [`LinkError::Transport`] with the name of the operation as it crosses
//! into the core.
//!
//! # Example
//!
//! ```rust
//! use vlink_core::error::{LinkError, Result};
//!
//! fn require_session(active: bool) -> Result<()> {
//!     if !active {
//!         return Err(LinkError::NotConnected);
//!     }
//!     Ok(())
//! }
//!
//! assert!(require_session(false).unwrap_err().is_connection_error());
//! ```

use thiserror::Error;

/// The unified error type for all vlink operations.
///
/// Every variant is `Clone` so the last failure of a connection can be kept
/// around and reported later, and so retry exhaustion can carry the final
/// underlying error.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    // =========================================================================
    // CONNECTION ERRORS
    // =========================================================================
    /// There is no active session with the vehicle.
    #[error("not connected to vehicle")]
    NotConnected,

    /// A health probe or an operation found the session dead.
    #[error("connection to vehicle lost: {source}")]
    ConnectionLost {
        /// What the probe or operation observed.
        source: Box<LinkError>,
    },

    /// Scanning for the vehicle failed on every scan attempt.
    #[error("failed to scan for vehicle {vin} after {attempts} attempts: {source}")]
    ScanFailed {
        /// VIN that was being scanned for.
        vin: String,
        /// Number of scan attempts made.
        attempts: u32,
        /// Failure of the last scan attempt.
        source: Box<LinkError>,
    },

    // =========================================================================
    // CONTEXT ERRORS
    // =========================================================================
    /// A bounded operation exceeded its deadline.
    #[error("operation timed out")]
    OperationTimeout,

    /// The operation's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // RESILIENCE ERRORS
    // =========================================================================
    /// Every retry attempt failed.
    #[error("retry attempts exhausted: {operation} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Label of the retried operation.
        operation: String,
        /// Total number of attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        source: Box<LinkError>,
    },

    /// The circuit breaker rejected the call without running it.
    #[error("circuit breaker is open")]
    CircuitOpen,

    // =========================================================================
    // COLLABORATOR ERRORS
    // =========================================================================
    /// The transport failed while performing an operation.
    #[error("failed to {operation}: {source}")]
    Transport {
        /// What the core was doing when the transport failed.
        operation: &'static str,
        /// The transport's error.
        #[source]
        source: TransportError,
    },

    /// The vehicle answered with data the core could not interpret.
    #[error("invalid response from vehicle: {0}")]
    InvalidResponse(String),

    /// Configuration could not be loaded, saved or validated.
    #[error("configuration error: {0}")]
    Config(String),
}

/// A specialized [`Result`] type for vlink operations.
pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    /// Wraps a transport error with the name of the operation it interrupted.
    ///
    /// A dropped link is promoted to [`LinkError::ConnectionLost`] so callers
    /// can trigger the self-healing path.
    #[must_use]
    pub fn transport(operation: &'static str, source: TransportError) -> Self {
        if matches!(source, TransportError::Disconnected) {
            Self::ConnectionLost {
                source: Box::new(Self::Transport { operation, source }),
            }
        } else {
            Self::Transport { operation, source }
        }
    }

    /// Returns `true` if this is a circuit-breaker rejection.
    #[inline]
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }

    /// Returns `true` if a deadline expired.
    #[inline]
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::OperationTimeout)
    }

    /// Returns `true` if the context was cancelled or timed out.
    #[inline]
    #[must_use]
    pub const fn is_context_error(&self) -> bool {
        matches!(self, Self::OperationTimeout | Self::Cancelled)
    }

    /// Returns `true` if this error is about the link itself being down.
    #[inline]
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectionLost { .. } | Self::ScanFailed { .. }
        )
    }

    /// Returns `true` if this error reports exhausted retries.
    #[inline]
    #[must_use]
    pub const fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Follows the wrapped-error chain down to the innermost [`LinkError`].
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::ConnectionLost { source }
            | Self::ScanFailed { source, .. }
            | Self::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotConnected => "NOT_CONNECTED",
            Self::ConnectionLost { .. } => "CONNECTION_LOST",
            Self::ScanFailed { .. } => "SCAN_FAILED",
            Self::OperationTimeout => "OPERATION_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::InvalidResponse(_) => "INVALID_RESPONSE",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

/// Errors reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The Bluetooth adapter is missing or powered off.
    #[error("Bluetooth adapter unavailable: {message}")]
    AdapterUnavailable {
        /// Adapter diagnostic.
        message: String,
    },

    /// No advertisement from the vehicle was seen.
    #[error("vehicle {vin} not found. Ensure it is awake and within range.")]
    DeviceNotFound {
        /// VIN that was scanned for.
        vin: String,
    },

    /// The BLE connection could not be established.
    #[error("connection failed: {message}")]
    ConnectFailed {
        /// Failure detail.
        message: String,
    },

    /// The authenticated session could not be started.
    #[error("session handshake failed: {message}")]
    HandshakeFailed {
        /// Failure detail.
        message: String,
    },

    /// The link dropped underneath an open session.
    #[error("link disconnected")]
    Disconnected,

    /// The vehicle refused a command.
    #[error("command rejected by vehicle: {message}")]
    Rejected {
        /// Reason given by the vehicle.
        message: String,
    },

    /// Low-level I/O failure on the link.
    #[error("I/O error: {message}")]
    Io {
        /// Failure detail.
        message: String,
    },
}

// =============================================================================
// CONVERSIONS
// =============================================================================

impl From<crate::config::ConfigError> for LinkError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        assert!(LinkError::NotConnected.is_connection_error());
        assert!(LinkError::ConnectionLost {
            source: Box::new(LinkError::OperationTimeout)
        }
        .is_connection_error());
        assert!(!LinkError::CircuitOpen.is_connection_error());
        assert!(!LinkError::OperationTimeout.is_connection_error());
    }

    #[test]
    fn test_context_error_classification() {
        assert!(LinkError::OperationTimeout.is_timeout());
        assert!(LinkError::OperationTimeout.is_context_error());
        assert!(LinkError::Cancelled.is_context_error());
        assert!(!LinkError::Cancelled.is_timeout());
        assert!(!LinkError::NotConnected.is_context_error());
    }

    #[test]
    fn test_disconnect_is_promoted_to_connection_lost() {
        let err = LinkError::transport("query vehicle state", TransportError::Disconnected);
        assert!(matches!(err, LinkError::ConnectionLost { .. }));

        let err = LinkError::transport(
            "query vehicle state",
            TransportError::Io {
                message: "broken pipe".into(),
            },
        );
        assert!(matches!(err, LinkError::Transport { .. }));
        assert!(err.to_string().starts_with("failed to query vehicle state"));
    }

    #[test]
    fn test_retry_exhausted_message() {
        let err = LinkError::RetryExhausted {
            operation: "get_state".into(),
            attempts: 1,
            source: Box::new(LinkError::NotConnected),
        };
        let message = err.to_string();
        assert!(message.contains("get_state"));
        assert!(message.contains("failed after 1 attempts"));
        assert!(message.contains("not connected"));
        assert!(err.is_retry_exhausted());
    }

    #[test]
    fn test_root_cause_unwraps_nested_errors() {
        let err = LinkError::RetryExhausted {
            operation: "connect".into(),
            attempts: 4,
            source: Box::new(LinkError::ScanFailed {
                vin: "5YJ3E1EA4KF000001".into(),
                attempts: 3,
                source: Box::new(LinkError::CircuitOpen),
            }),
        };
        assert!(err.root_cause().is_circuit_open());
        assert!(LinkError::NotConnected.root_cause().is_connection_error());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(LinkError::NotConnected.error_code(), "NOT_CONNECTED");
        assert_eq!(LinkError::CircuitOpen.error_code(), "CIRCUIT_OPEN");
        assert_eq!(LinkError::OperationTimeout.error_code(), "OPERATION_TIMEOUT");
        assert_eq!(
            LinkError::InvalidResponse("empty".into()).error_code(),
            "INVALID_RESPONSE"
        );
    }

    #[test]
    fn test_error_display_messages() {
        let err = LinkError::transport(
            "scan for vehicle",
            TransportError::DeviceNotFound {
                vin: "5YJ3E1EA4KF000001".into(),
            },
        );
        assert!(err.to_string().contains("5YJ3E1EA4KF000001"));
        assert!(LinkError::CircuitOpen.to_string().contains("circuit breaker"));
    }

    #[test]
    fn test_error_is_send_sync_and_clone() {
        fn assert_traits<T: Send + Sync + Clone + 'static>() {}

        assert_traits::<LinkError>();
        assert_traits::<TransportError>();
    }
}
