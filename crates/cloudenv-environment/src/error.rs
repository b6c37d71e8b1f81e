// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cloudenv-environment.

use cloudenv_core::HandlerError;
use thiserror::Error;

use crate::providers::{BrokerError, ProviderError, RepositoryError};

/// Environment errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Continuation engine failed.
    #[error("Core error: {0}")]
    Core(#[from] cloudenv_core::CoreError),

    /// Environment repository failed.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Resource broker failed.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Heartbeat, monitor or manager call failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A phase tried to move backwards.
    #[error("Workflow error: {0}")]
    PhaseRegression(#[from] crate::handlers::PhaseRegression),

    /// A phase tried to replace a resource reference.
    #[error("Workflow error: {0}")]
    ResourceConflict(#[from] crate::handlers::ResourceConflict),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using Environment Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for HandlerError {
    fn from(err: Error) -> Self {
        match err {
            Error::Broker(BrokerError::Unavailable {
                retry_after,
                message,
            })
            | Error::Provider(ProviderError::Unavailable {
                retry_after,
                message,
            }) => HandlerError::TemporarilyUnavailable {
                retry_after,
                message,
            },
            other => HandlerError::other(other),
        }
    }
}
