// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cloudenv-core.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the continuation engine itself.
///
/// Handler failures are not reported through this type; they travel as
/// [`crate::dispatcher::DispatchError`] so the activator can decide whether to retry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Two handlers claimed the same continuation target during registration.
    #[error("target '{target}' is claimed by both '{first}' and '{second}'")]
    AmbiguousHandler {
        /// Target string encoding.
        target: &'static str,
        /// First handler name.
        first: &'static str,
        /// Second handler name.
        second: &'static str,
    },

    /// No registered handler claims a target.
    #[error("no handler registered for target '{target}'")]
    MissingHandler {
        /// Target string encoding.
        target: &'static str,
    },

    /// A handler broke the result contract.
    #[error("contract violation: {reason}")]
    ContractViolation {
        /// What was wrong with the result.
        reason: String,
    },

    /// A data-plane location has no owning control-plane region.
    #[error("unknown data-plane location '{location}'")]
    UnknownLocation {
        /// The location that could not be resolved.
        location: String,
    },

    /// A payload had to leave this region but no cross-region transport is configured.
    #[error("no cross-region transport configured for region '{region}'")]
    CrossRegionUnavailable {
        /// The destination region.
        region: String,
    },

    /// A queue transport failed.
    #[error("queue error: {0}")]
    Queue(String),

    /// A lease backend failed.
    #[error("lease error: {0}")]
    Lease(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AmbiguousHandler { .. } => "AMBIGUOUS_HANDLER",
            Self::MissingHandler { .. } => "MISSING_HANDLER",
            Self::ContractViolation { .. } => "CONTRACT_VIOLATION",
            Self::UnknownLocation { .. } => "UNKNOWN_LOCATION",
            Self::CrossRegionUnavailable { .. } => "CROSS_REGION_UNAVAILABLE",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Lease(_) => "LEASE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            CoreError::MissingHandler { target: "x" }.error_code(),
            "MISSING_HANDLER"
        );
        assert_eq!(
            CoreError::UnknownLocation {
                location: "westus2".into()
            }
            .error_code(),
            "UNKNOWN_LOCATION"
        );
        assert_eq!(CoreError::Queue("boom".into()).error_code(), "QUEUE_ERROR");
    }

    #[test]
    fn test_display_includes_context() {
        let err = CoreError::AmbiguousHandler {
            target: "start-environment",
            first: "a",
            second: "b",
        };
        let msg = err.to_string();
        assert!(msg.contains("start-environment"));
        assert!(msg.contains("'a'"));
    }
}
