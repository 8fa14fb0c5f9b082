//! Error types for the marshalling and acquisition engine.
//!
//! Errors fall into four categories, each with its own handling policy:
//!
//! | Variant | Raised by | Policy |
//! |---------|-----------|--------|
//! | [`EchemError::InvalidParameter`] | Marshaller, driver rejection of a bundle | Never retried, fails the load synchronously |
//! | [`EchemError::Communication`] | Driver calls, timeouts | Retried by the executor, then the channel is `Errored` |
//! | [`EchemError::Decode`] | Telemetry decoder | Row dropped and logged, acquisition continues |
//! | [`EchemError::ChannelState`] | Executor | Surfaced to the caller, never retried |
//!
//! Native driver failures arrive as [`DriverError`] values carrying the raw
//! status code. [`EchemError::from_driver`] folds them into the taxonomy
//! above.

use crate::catalog;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EchemError>;

/// Coarse classification of a native driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// No instrument connected, or the connection was refused.
    NotConnected,
    /// The driver rejected the supplied parameters.
    InvalidParameters,
    /// Transport level failure between host and instrument.
    Communication,
    /// The call did not complete within its deadline.
    Timeout,
    /// Another call into the library is already in progress.
    Busy,
    /// Channel firmware missing or incompatible.
    Firmware,
    /// Technique file missing, incompatible or corrupted.
    TechniqueFile,
    /// The instrument reported an internal fault.
    Hardware,
    /// Unclassified failure.
    Other,
}

impl DriverErrorKind {
    /// Whether a failed call of this kind may succeed when repeated.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Communication | Self::Timeout | Self::Busy)
    }
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotConnected => "not connected",
            Self::InvalidParameters => "invalid parameters",
            Self::Communication => "communication",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::Firmware => "firmware",
            Self::TechniqueFile => "technique file",
            Self::Hardware => "hardware",
            Self::Other => "driver",
        };
        f.write_str(name)
    }
}

/// A failure reported by a [`DriverInterface`](crate::driver::DriverInterface) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error{}: {message}", code_suffix(.code))]
pub struct DriverError {
    /// Raw status code returned by the native library, if any.
    pub code: Option<i32>,
    /// Classification of the failure.
    pub kind: DriverErrorKind,
    /// Human readable description.
    pub message: String,
}

fn code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" ({c})")).unwrap_or_default()
}

impl DriverError {
    /// Creates an error without a native status code.
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: None,
            kind,
            message: message.into(),
        }
    }

    /// Builds an error from a native status code using the static code table.
    ///
    /// Unknown codes classify as [`DriverErrorKind::Other`].
    pub fn from_code(code: i32) -> Self {
        match catalog::driver_error(code) {
            Some(desc) => Self {
                code: Some(code),
                kind: desc.kind,
                message: format!("{}: {}", desc.name, desc.message),
            },
            None => Self {
                code: Some(code),
                kind: DriverErrorKind::Other,
                message: format!("unknown error code {code}"),
            },
        }
    }
}

/// Primary error type for the engine.
#[derive(Debug, Clone, Error)]
pub enum EchemError {
    /// A parameter value could not be represented, or a bundle violated its
    /// technique's declaration (unknown name, arity, index continuity).
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A driver call failed in a way that may be transient.
    ///
    /// The executor retries these according to its
    /// [`RetryPolicy`](crate::retry::RetryPolicy) before giving up on the
    /// channel.
    #[error("Communication error during {operation}: {message}")]
    Communication {
        /// Driver operation that failed (`"load"`, `"poll"`, ...).
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// An acquisition row could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The operation is not valid in the executor's current state.
    #[error("Cannot {operation} while channel is {state}")]
    ChannelState {
        /// Requested operation.
        operation: &'static str,
        /// State the channel was in.
        state: String,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A non-transient driver failure that fits no other category.
    #[error("Driver error: {0}")]
    Driver(DriverError),
}

impl EchemError {
    /// Creates an [`EchemError::InvalidParameter`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    /// Creates an [`EchemError::Decode`].
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Creates an [`EchemError::Communication`] for `operation`.
    pub fn communication(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Communication {
            operation,
            message: message.into(),
        }
    }

    /// Classifies a driver failure raised while performing `operation`.
    pub fn from_driver(operation: &'static str, err: DriverError) -> Self {
        match err.kind {
            kind if kind.is_transient() => Self::communication(operation, err.to_string()),
            DriverErrorKind::InvalidParameters | DriverErrorKind::TechniqueFile => {
                Self::InvalidParameter(err.to_string())
            }
            _ => Self::Driver(err),
        }
    }

    /// Whether the executor should retry the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication { .. })
    }
}

impl From<figment::Error> for EchemError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EchemError::invalid("Scan_Rate out of range");
        assert_eq!(err.to_string(), "Invalid parameter: Scan_Rate out of range");

        let err = EchemError::communication("poll", "link down");
        assert!(err.to_string().contains("during poll"));
    }

    #[test]
    fn test_driver_error_from_code() {
        let err = DriverError::from_code(-200);
        assert_eq!(err.kind, DriverErrorKind::Communication);
        assert_eq!(err.code, Some(-200));
        assert!(err.message.contains("COMMFAILED"));

        let err = DriverError::from_code(-9999);
        assert_eq!(err.kind, DriverErrorKind::Other);
        assert!(err.to_string().contains("-9999"));
    }

    #[test]
    fn test_driver_error_classification() {
        let comm = EchemError::from_driver("start", DriverError::from_code(-12));
        assert!(comm.is_retryable());

        let invalid = EchemError::from_driver("load", DriverError::from_code(-4));
        assert!(matches!(invalid, EchemError::InvalidParameter(_)));
        assert!(!invalid.is_retryable());

        let missing_file = EchemError::from_driver("load", DriverError::from_code(-400));
        assert!(matches!(missing_file, EchemError::InvalidParameter(_)));

        let firmware = EchemError::from_driver("start", DriverError::from_code(-308));
        assert!(matches!(firmware, EchemError::Driver(_)));
    }
}
