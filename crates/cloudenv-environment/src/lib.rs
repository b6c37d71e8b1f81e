// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! cloudenv Environment - Cloud Environment Lifecycle Workflows
//!
//! This crate implements the lifecycle of a cloud development environment on top of
//! the cloudenv-core continuation engine. Every lifecycle operation is a workflow of
//! short phases; each phase reads the environment record, drives the resource broker
//! one step, persists what it learned and hands the next phase back to the queue.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐ submit ┌──────────────────────────────────────────────┐
//! │ API / TaskRunner   │───────►│ ContinuationWorker (cloudenv-core)           │
//! └────────────────────┘        └──────────────────────┬───────────────────────┘
//!                                                      │ one phase
//!                                                      ▼
//!                               ┌──────────────────────────────────────────────┐
//!                               │ WorkflowHandler<W> (this crate)              │
//!                               │   load record ─► run_phase ─► track          │
//!                               └───────┬──────────────┬──────────────┬────────┘
//!                                       │              │              │
//!                                       ▼              ▼              ▼
//!                              ┌──────────────┐ ┌─────────────┐ ┌────────────────┐
//!                              │ Environment  │ │  Resource   │ │ Heartbeats /   │
//!                              │ Repository   │ │  Broker     │ │ Monitor / Mgr  │
//!                              └──────────────┘ └─────────────┘ └────────────────┘
//! ```
//!
//! # Environment State Machine
//!
//! ```text
//!  Created ─► Provisioning ─► Starting ─► Available ─► ShuttingDown ─► Shutdown
//!                 │              │                                     │    ▲
//!                 ▼              ▼                                archive   │ start
//!               Failed ◄─────────┘                                     ▼    │
//!                 │                                                 Archived┘
//!          delete │
//!                 ▼
//!              Deleted
//! ```
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CLOUDENV_REGION` | Yes | - | Control-plane region this instance serves |
//! | `CLOUDENV_DATABASE_URL` | No | - | PostgreSQL connection string |
//! | `CLOUDENV_DATA_PLANE_LOCATIONS` | No | region | Locations scanned by periodic tasks |
//! | `CLOUDENV_LOCATION_REGIONS` | No | - | `location=region` routing pairs |
//! | `CLOUDENV_ARCHIVE_AFTER_HOURS` | No | `168` | Shutdown-to-archival delay |
//! | `CLOUDENV_TASKS_ENABLED` | No | `false` | Run the periodic scans |
//!
//! See [`config::Config::from_env`] for the full list.
//!
//! # Modules
//!
//! - [`target`]: the workflow kinds
//! - [`model`]: the environment aggregate
//! - [`providers`]: traits for the infrastructure the workflows drive
//! - [`handlers`]: one workflow per target
//! - [`tasks`]: lease-guarded periodic scans
//! - [`runtime`]: embeddable runtime wiring it all together
//! - [`db`]: PostgreSQL repositories
//! - [`mock`]: in-memory providers for tests and demos

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// PostgreSQL repositories for environments and heartbeats.
pub mod db;

/// Error types for environment workflows.
pub mod error;

/// Workflow handlers, one per target.
pub mod handlers;

/// Database migrations for cloudenv-environment.
pub mod migrations;

/// In-memory providers for tests and demos.
pub mod mock;

/// The environment aggregate.
pub mod model;

/// Infrastructure traits the workflows drive.
pub mod providers;

/// Embeddable runtime.
pub mod runtime;

/// Workflow targets.
pub mod target;

/// Lease-guarded periodic tasks.
pub mod tasks;

pub use error::{Error, Result};
pub use model::{CloudEnvironment, EnvironmentOperation, EnvironmentState};
pub use runtime::EnvironmentRuntime;
pub use target::EnvironmentTarget;
