//! Error taxonomy shared by every layer.
//!
//! Each layer keeps its own `thiserror` enum; this module only classifies them
//! so callers can decide between fixing input, retrying, or giving up.

use std::fmt;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Validation failed; retry with corrected input.
    InvalidParam,
    /// A referenced customer, product, order or wallet does not exist.
    ResourceNotFound,
    /// The entity is in a state that forbids the operation.
    ConflictOrState,
    /// A business rule rejected the operation (balance, frozen wallet).
    BusinessRule,
    /// Timeouts and lock waits; retry with the same idempotency key.
    Transient,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        self == ErrorKind::Transient
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidParam => "invalid_param",
            ErrorKind::ResourceNotFound => "resource_not_found",
            ErrorKind::ConflictOrState => "conflict_or_state",
            ErrorKind::BusinessRule => "business_rule",
            ErrorKind::Transient => "transient",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Stable machine-readable classification of an error.
pub trait ErrorCode {
    fn kind(&self) -> ErrorKind;

    /// Stable snake-case code, e.g. `insufficient_balance`.
    fn code(&self) -> &'static str;
}
