//! Structured error taxonomy for the loader control plane.
//!
//! Internal crates do their own IO with `anyhow::Result` and convert to
//! `LoaderError` at their public boundary. `LoaderError::kind()` gives
//! callers a stable, machine-readable classification without exposing
//! the underlying library error type.

use std::fmt;

/// Primary error type returned by every public operation in this workspace.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// Connection borrow timeout, dropped connection, query deadline
    /// exceeded. Scheduler auto-recovery retries these.
    #[error("transient source error for {source_code}: {detail}")]
    TransientSource { source_code: String, detail: String },

    /// Authentication failure, read-only violation, syntax error in
    /// `sql_text`. Auto-recovery still retries; an operator is expected to
    /// fix the underlying cause.
    #[error("permanent source error for {source_code}: {detail}")]
    PermanentSource { source_code: String, detail: String },

    /// Uniqueness violation under `FAIL_ON_DUPLICATE`.
    #[error("signal sink conflict for loader {loader_code}: {detail}")]
    SinkConflict { loader_code: String, detail: String },

    /// Approve a non-`PENDING_APPROVAL` draft, update a non-`DRAFT`, etc.
    #[error("illegal transition on {entity_code}: {detail}")]
    InvalidTransition { entity_code: String, detail: String },

    /// Attempt to create a second `ACTIVE` or second draft row — in
    /// practice surfaced when the partial unique index rejects an insert.
    #[error("integrity violation on {entity_code}: {detail}")]
    IntegrityViolation { entity_code: String, detail: String },

    /// Entity code or draft id absent.
    #[error("not found: {what}")]
    NotFound { what: String },
}

/// Classification of a `LoaderError` for monitoring and for the per-run
/// structured execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderErrorKind {
    TransientSource,
    PermanentSource,
    SinkConflict,
    InvalidTransition,
    IntegrityViolation,
    NotFound,
}

impl fmt::Display for LoaderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoaderErrorKind::TransientSource => "TRANSIENT_SOURCE",
            LoaderErrorKind::PermanentSource => "PERMANENT_SOURCE",
            LoaderErrorKind::SinkConflict => "SINK_CONFLICT",
            LoaderErrorKind::InvalidTransition => "INVALID_TRANSITION",
            LoaderErrorKind::IntegrityViolation => "INTEGRITY_VIOLATION",
            LoaderErrorKind::NotFound => "NOT_FOUND",
        };
        write!(f, "{s}")
    }
}

impl LoaderError {
    pub fn kind(&self) -> LoaderErrorKind {
        match self {
            LoaderError::TransientSource { .. } => LoaderErrorKind::TransientSource,
            LoaderError::PermanentSource { .. } => LoaderErrorKind::PermanentSource,
            LoaderError::SinkConflict { .. } => LoaderErrorKind::SinkConflict,
            LoaderError::InvalidTransition { .. } => LoaderErrorKind::InvalidTransition,
            LoaderError::IntegrityViolation { .. } => LoaderErrorKind::IntegrityViolation,
            LoaderError::NotFound { .. } => LoaderErrorKind::NotFound,
        }
    }

    /// Whether the scheduler's fixed-delay auto-recovery is
    /// expected to make progress by retrying. Reported for
    /// observability/logging only — auto-recovery sweeps every `FAILED`
    /// row after the timeout regardless of kind, so this does not gate
    /// the transition, it only explains it in logs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoaderError::TransientSource { .. } | LoaderError::SinkConflict { .. }
        )
    }

    /// Whether the failure should be rejected synchronously to the caller
    /// rather than surfacing through the scheduler's async failure path.
    pub fn is_synchronous_rejection(&self) -> bool {
        matches!(
            self,
            LoaderError::InvalidTransition { .. }
                | LoaderError::IntegrityViolation { .. }
                | LoaderError::NotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_source_is_retryable_and_not_synchronous() {
        let e = LoaderError::TransientSource {
            source_code: "SRC1".into(),
            detail: "timeout".into(),
        };
        assert_eq!(e.kind(), LoaderErrorKind::TransientSource);
        assert!(e.is_retryable());
        assert!(!e.is_synchronous_rejection());
    }

    #[test]
    fn invalid_transition_is_synchronous_and_not_retryable() {
        let e = LoaderError::InvalidTransition {
            entity_code: "DAILY_SALES".into(),
            detail: "draft is not PENDING_APPROVAL".into(),
        };
        assert_eq!(e.kind(), LoaderErrorKind::InvalidTransition);
        assert!(!e.is_retryable());
        assert!(e.is_synchronous_rejection());
    }

    #[test]
    fn kind_display_is_screaming_snake_case() {
        assert_eq!(LoaderErrorKind::SinkConflict.to_string(), "SINK_CONFLICT");
    }
}
