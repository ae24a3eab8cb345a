//! Error types for the execution engine

use thiserror::Error;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Closed set of error kinds the engine can surface at its API boundary.
///
/// Every host-facing failure (a semaphore wait failing, a thread failing to spawn, a
/// timer failing to arm) is passed through a mapping that lands in this set;
/// unmappable conditions become [`ErrorKind::Io`].
///
/// Discriminants start at 1, not 0: ordinal 0 is reserved so that the handle encoding
/// (`-(ordinal - 1)`) of the first variant lands on the same bit pattern as the empty
/// handle sentinel, matching the handle round-trip described in the data model.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorKind {
    /// Caller is not the owner thread, or a wait was given no valid handles.
    #[error("operation not permitted")]
    NotPermitted = 1,
    /// The deadline passed before the operation completed.
    #[error("operation timed out")]
    TimedOut,
    /// The host-mapped wait failed in a way that maps to cancellation.
    #[error("operation canceled")]
    Canceled,
    /// A slot or chunk allocation failed.
    #[error("out of memory")]
    NoMemory,
    /// A slot index would exceed the representable range.
    #[error("index overflow")]
    Overflow,
    /// A caller-supplied argument violated a documented precondition.
    #[error("invalid argument")]
    InvalidArgument,
    /// An underlying OS primitive failed in a way with no closer mapping.
    #[error("I/O error")]
    Io,
}

impl ErrorKind {
    /// Encode this error kind as a non-positive handle payload: `-(ordinal - 1)`.
    pub(crate) fn to_handle_payload(self) -> i32 {
        -(self as i32 - 1)
    }

    /// Decode a non-positive handle payload back into an error kind.
    ///
    /// Any ordinal outside the known range maps to [`ErrorKind::Io`] rather than panicking,
    /// since a handle can in principle be corrupted by caller misuse.
    pub(crate) fn from_handle_payload(id: i32) -> Self {
        let ordinal = -(id - 1);
        match ordinal {
            1 => ErrorKind::NotPermitted,
            2 => ErrorKind::TimedOut,
            3 => ErrorKind::Canceled,
            4 => ErrorKind::NoMemory,
            5 => ErrorKind::Overflow,
            6 => ErrorKind::InvalidArgument,
            _ => ErrorKind::Io,
        }
    }

    /// Whether this failure is expected under normal contention and safe to retry.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::TimedOut | ErrorKind::Io)
    }
}

/// Richer host-boundary error for APIs that aren't squeezed through a [`Handle`](crate::handle::Handle)'s
/// 32 bits and so can afford to carry a message: `Config` construction, pool setup.
///
/// Engine operations that return a [`Handle`](crate::handle::Handle) or operate on one
/// (`push`, `wait_single`, `wait_all`, ...) use the bare [`ErrorKind`] instead, since
/// those results are the thing that gets encoded into a handle or compared against a
/// closed set of recoverable codes; this type exists one layer up, the way a
/// transport-level error sits above its lower-level ring-buffer return codes.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A bare [`ErrorKind`] with no further context.
    #[error("{kind}")]
    Kind {
        /// The underlying kind.
        kind: ErrorKind,
    },

    /// A `Config` value failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the violated invariant.
        message: String,
    },

    /// A caller on a thread other than the pool's owner invoked an owner-only
    /// operation.
    #[error("owner thread violation: {message}")]
    OwnerViolation {
        /// Description of the offending call.
        message: String,
    },

    /// A host I/O failure, typically a thread failing to spawn.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        EngineError::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn owner_violation(message: impl Into<String>) -> Self {
        EngineError::OwnerViolation {
            message: message.into(),
        }
    }

    /// Whether this failure is expected under normal contention and safe to retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Kind { kind } => kind.is_recoverable(),
            EngineError::Io(_) => true,
            EngineError::InvalidConfig { .. } | EngineError::OwnerViolation { .. } => false,
        }
    }
}

impl From<ErrorKind> for EngineError {
    fn from(kind: ErrorKind) -> Self {
        EngineError::Kind { kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_payload_round_trip() {
        for kind in [
            ErrorKind::NotPermitted,
            ErrorKind::TimedOut,
            ErrorKind::Canceled,
            ErrorKind::NoMemory,
            ErrorKind::Overflow,
            ErrorKind::InvalidArgument,
        ] {
            let payload = kind.to_handle_payload();
            assert!(payload <= 0);
            assert_eq!(ErrorKind::from_handle_payload(payload), kind);
        }
    }

    #[test]
    fn test_unknown_ordinal_maps_to_io() {
        assert_eq!(ErrorKind::from_handle_payload(-1000), ErrorKind::Io);
    }

    #[test]
    fn test_is_recoverable() {
        assert!(ErrorKind::TimedOut.is_recoverable());
        assert!(!ErrorKind::NotPermitted.is_recoverable());
        assert!(!ErrorKind::NoMemory.is_recoverable());
    }

    #[test]
    fn test_engine_error_wraps_kind() {
        let e: EngineError = ErrorKind::Overflow.into();
        assert!(!e.is_recoverable());
        assert_eq!(e.to_string(), ErrorKind::Overflow.to_string());
    }

    #[test]
    fn test_engine_error_config_message() {
        let e = EngineError::config("worker_count must be > 0");
        assert!(e.to_string().contains("worker_count"));
        assert!(!e.is_recoverable());
    }
}
