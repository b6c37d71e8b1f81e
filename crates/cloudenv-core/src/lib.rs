// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! cloudenv Core - Continuation Engine
//!
//! This crate runs long-lived infrastructure workflows as a chain of short, stateless
//! steps. Each step is a queue message; a handler runs one phase against it and returns
//! either the input for the next phase (with an optional delay) or a terminal outcome.
//! No step holds a thread across waits, and any worker in the fleet can pick up any step.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ submit  ┌─────────────────────┐  pull   ┌──────────────────────┐
//! │  API / tasks │────────►│  ContinuationQueue  │────────►│  ContinuationWorker  │
//! └──────────────┘         │ (per control-plane  │◄────────│                      │
//!        │                 │       region)       │ requeue └──────────┬───────────┘
//!        │ remote region   └─────────────────────┘                    │ activate
//!        ▼                                                            ▼
//! ┌──────────────────┐                                   ┌──────────────────────────┐
//! │ CrossRegionQueue │                                   │  ContinuationActivator   │
//! └──────────────────┘                                   │   └─► Dispatcher         │
//!                                                        │        └─► PhaseHandler  │
//!                                                        └──────────────────────────┘
//! ```
//!
//! # Step Semantics
//!
//! | Handler outcome | Activator action |
//! |-----------------|------------------|
//! | `InProgress` + next input | Enqueue next input under the same target after `retry_after` |
//! | `Succeeded` / `Failed` / `Cancelled` | Nothing further; the handler has persisted final state |
//! | `TemporarilyUnavailable` | Enqueue the same input after the requested delay |
//! | Error or panic | Enqueue the same input with exponential backoff, then abandon |
//! | Contract violation or expired workflow | Abandon |
//!
//! Delivery is at least once. Handlers must make every phase safe to repeat.
//!
//! # Modules
//!
//! - [`envelope`]: payload, result and target types
//! - [`handler`]: the phase handler contract
//! - [`registry`]: target-to-handler routing
//! - [`dispatcher`]: runs one step with panic capture and identity scoping
//! - [`activator`]: submission and step-to-step chaining
//! - [`queue`]: in-memory and PostgreSQL queue transports
//! - [`lease`]: claimed distributed leases for periodic tasks
//! - [`identity`]: caller identity and scoped elevation
//! - [`worker`]: the queue-draining background worker
//! - [`config`]: environment-based configuration
//! - [`migrations`]: embedded PostgreSQL schema

#![deny(missing_docs)]

pub mod activator;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod identity;
pub mod lease;
pub mod migrations;
pub mod queue;
pub mod registry;
pub mod resource;
pub mod worker;

pub use activator::{
    ActivationOutcome, ContinuationActivator, ContinuationSubmitter, FaultRetryPolicy,
    RegionResolver, StaticRegionMap,
};
pub use config::{Config, ConfigError};
pub use dispatcher::{DispatchError, Dispatcher};
pub use envelope::{ContinuationQueuePayload, ContinuationResult, ContinuationTarget, OperationState};
pub use error::{CoreError, Result};
pub use handler::{DispatchContext, HandlerError, PhaseHandler};
pub use identity::{Elevation, Identity, IdentityScope, ScopedIdentityGuard};
pub use lease::{ClaimedLease, InMemoryLease, LeaseGuard, PostgresLease};
pub use queue::{
    ContinuationQueue, CrossRegionQueue, InMemoryCrossRegionQueue, InMemoryQueue, PostgresCrossRegionQueue,
    PostgresQueue,
};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder};
pub use resource::{ResourceRef, ResourceType};
pub use worker::{ContinuationWorker, WorkerConfig};
