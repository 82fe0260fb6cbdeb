//! Error types for tierstore
//!
//! A single error enum shared by the cache tiers, the metadata index, the
//! placement engine, and the sync handler. Every public operation returns
//! exactly one of these; per-tier diagnostics ride along on `Unavailable`.

use thiserror::Error;

// =============================================================================
// Error Kind
// =============================================================================

/// Coarse error classification used by the placement engine when aggregating
/// per-tier failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Unavailable,
    Transient,
    Capacity,
    Auth,
    Unsupported,
    Corruption,
    Cancelled,
    Deadline,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Transient => "transient",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Auth => "auth",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Deadline => "deadline",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Per-Tier Failure Attribution
// =============================================================================

/// One tier's contribution to an aggregated read/write failure.
#[derive(Debug, Clone)]
pub struct TierFailure {
    /// Tier name (from its descriptor)
    pub tier: String,
    /// What kind of failure the tier reported
    pub kind: ErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl TierFailure {
    pub fn new(tier: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TierFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.tier, self.kind, self.message)
    }
}

// =============================================================================
// Error
// =============================================================================

/// Unified error type for tierstore
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Lookup / Placement Errors
    // =========================================================================
    #[error("content not found on any tier")]
    NotFound,

    #[error("content unavailable: {} tier(s) failed", tier_errors.len())]
    Unavailable {
        /// Per-tier failure attribution, in probe order
        tier_errors: Vec<TierFailure>,
    },

    #[error("transient error: {0}")]
    Transient(String),

    // =========================================================================
    // Admission / Write Errors
    // =========================================================================
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    #[error("corruption detected: {0}")]
    Corruption(String),

    // =========================================================================
    // Cancellation
    // =========================================================================
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    Deadline,

    // =========================================================================
    // Local Errors
    // =========================================================================
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("fingerprint parse error: {0}")]
    FingerprintParse(String),

    // =========================================================================
    // Conversions
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Classify this error for aggregation and retry decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound => ErrorKind::NotFound,
            Error::Unavailable { .. } => ErrorKind::Unavailable,
            Error::Transient(_) | Error::Http(_) => ErrorKind::Transient,
            Error::Capacity(_) => ErrorKind::Capacity,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Corruption(_) => ErrorKind::Corruption,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Deadline => ErrorKind::Deadline,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether the placement engine may retry this error on the same tier
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Whether this error must never be auto-retried anywhere
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cancelled | ErrorKind::Deadline)
    }

    /// Build an aggregated read failure from per-tier attributions.
    ///
    /// `NotFound` only when every tier reported `NotFound`; anything else
    /// surfaces as `Unavailable` carrying the full attribution list.
    pub fn aggregate(tier_errors: Vec<TierFailure>) -> Self {
        if !tier_errors.is_empty() && tier_errors.iter().all(|t| t.kind == ErrorKind::NotFound) {
            Error::NotFound
        } else {
            Error::Unavailable { tier_errors }
        }
    }
}

/// Result type alias for tierstore
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::NotFound.kind(), ErrorKind::NotFound);
        assert_eq!(Error::Transient("net".into()).kind(), ErrorKind::Transient);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(Error::Capacity("full".into()).kind(), ErrorKind::Capacity);
    }

    #[test]
    fn test_retry_policy() {
        assert!(Error::Transient("timeout".into()).is_retryable());
        assert!(!Error::NotFound.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(Error::Cancelled.is_terminal());
        assert!(Error::Deadline.is_terminal());
        assert!(!Error::Transient("x".into()).is_terminal());
    }

    #[test]
    fn test_aggregate_all_not_found() {
        let errs = vec![
            TierFailure::new("content-store", ErrorKind::NotFound, "miss"),
            TierFailure::new("object-store", ErrorKind::NotFound, "miss"),
        ];
        assert!(matches!(Error::aggregate(errs), Error::NotFound));
    }

    #[test]
    fn test_aggregate_mixed() {
        let errs = vec![
            TierFailure::new("content-store", ErrorKind::NotFound, "miss"),
            TierFailure::new("object-store", ErrorKind::Transient, "timeout"),
        ];
        match Error::aggregate(errs) {
            Error::Unavailable { tier_errors } => assert_eq!(tier_errors.len(), 2),
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }
}
