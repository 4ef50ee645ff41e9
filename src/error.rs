//! Error types for workq.
//!
//! Every store operation surfaces backend failures verbatim as
//! [`Error::StoreUnreachable`]; ownership and ordering violations get their
//! own variants so callers can branch on [`Error::kind`].

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate item: {dedup_key} is already queued or in flight")]
    DuplicateItem { dedup_key: String },

    #[error("lease expired or was taken over by another worker")]
    LeaseExpiredOrStolen,

    #[error("renewal must extend the lease beyond {current}")]
    LeaseNotExtended { current: DateTime<Utc> },

    #[error("lock {name} expired or is held under another token")]
    LockExpiredOrStolen { name: String },

    #[error("lock {name} is already held")]
    AlreadyLocked { name: String },

    #[error(
        "progress regression for {consumer}/{partition}: {attempted} is not beyond {current}"
    )]
    ProgressRegression {
        consumer: String,
        partition: String,
        current: i64,
        attempted: i64,
    },

    #[error("store unreachable: {0}")]
    StoreUnreachable(#[from] sqlx::Error),

    #[error("malformed configuration: {0}")]
    MalformedConfiguration(String),

    #[error("telemetry: {0}")]
    Telemetry(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of an [`Error`], stable across variants' payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DuplicateItem,
    LeaseExpiredOrStolen,
    LeaseNotExtended,
    LockExpiredOrStolen,
    AlreadyLocked,
    ProgressRegression,
    StoreUnreachable,
    MalformedConfiguration,
    Telemetry,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateItem { .. } => ErrorKind::DuplicateItem,
            Error::LeaseExpiredOrStolen => ErrorKind::LeaseExpiredOrStolen,
            Error::LeaseNotExtended { .. } => ErrorKind::LeaseNotExtended,
            Error::LockExpiredOrStolen { .. } => ErrorKind::LockExpiredOrStolen,
            Error::AlreadyLocked { .. } => ErrorKind::AlreadyLocked,
            Error::ProgressRegression { .. } => ErrorKind::ProgressRegression,
            Error::StoreUnreachable(_) => ErrorKind::StoreUnreachable,
            Error::MalformedConfiguration(_) => ErrorKind::MalformedConfiguration,
            Error::Telemetry(_) => ErrorKind::Telemetry,
            Error::Other(_) => ErrorKind::Other,
        }
    }

    /// Transient backend failures the caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::StoreUnreachable
    }

    /// The caller no longer owns the lease or lock it was working under.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::LeaseExpiredOrStolen | ErrorKind::LockExpiredOrStolen
        )
    }
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DuplicateItem => "duplicate_item",
            ErrorKind::LeaseExpiredOrStolen => "lease_expired_or_stolen",
            ErrorKind::LeaseNotExtended => "lease_not_extended",
            ErrorKind::LockExpiredOrStolen => "lock_expired_or_stolen",
            ErrorKind::AlreadyLocked => "already_locked",
            ErrorKind::ProgressRegression => "progress_regression",
            ErrorKind::StoreUnreachable => "store_unreachable",
            ErrorKind::MalformedConfiguration => "malformed_configuration",
            ErrorKind::Telemetry => "telemetry",
            ErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_failures_are_transient() {
        let err = Error::StoreUnreachable(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
        assert_eq!(err.kind(), ErrorKind::StoreUnreachable);

        let err = Error::AlreadyLocked {
            name: "job-x".to_string(),
        };
        assert!(!err.is_transient());
        assert!(!err.is_ownership_lost());
    }

    #[test]
    fn lost_leases_and_locks_report_ownership_loss() {
        assert!(Error::LeaseExpiredOrStolen.is_ownership_lost());
        assert!(
            Error::LockExpiredOrStolen {
                name: "job-x".to_string()
            }
            .is_ownership_lost()
        );
    }
}
