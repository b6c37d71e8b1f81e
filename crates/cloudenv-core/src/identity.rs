// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller identity and scoped elevation.
//!
//! The identity a workflow runs under is passed to handlers explicitly through
//! [`crate::handler::DispatchContext`]. [`IdentityScope`] additionally tracks the identity
//! of the current call for code that only has the scope at hand, and
//! [`ScopedIdentityGuard`] restores the previous identity when it goes out of scope,
//! whether the call returned, failed or panicked.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Who a unit of work runs on behalf of.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    /// No authenticated caller.
    #[default]
    Anonymous,
    /// An end user owning environments.
    User {
        /// Owner id matched against aggregates.
        user_id: String,
    },
    /// An internal service.
    Service {
        /// Service name, for logs.
        name: String,
    },
    /// Unrestricted system identity used by background triggers.
    Superuser,
}

impl Identity {
    /// Shorthand for a user identity.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self::User {
            user_id: user_id.into(),
        }
    }

    /// Shorthand for a service identity.
    pub fn service(name: impl Into<String>) -> Self {
        Self::Service { name: name.into() }
    }

    /// Whether this is the superuser.
    pub fn is_superuser(&self) -> bool {
        matches!(self, Self::Superuser)
    }

    /// Whether this identity may act on an aggregate owned by `owner_id`.
    ///
    /// Services are trusted callers; only users are restricted to what they own.
    pub fn can_act_for(&self, owner_id: &str) -> bool {
        match self {
            Self::Superuser | Self::Service { .. } => true,
            Self::User { user_id } => user_id == owner_id,
            Self::Anonymous => false,
        }
    }
}

/// Privilege a handler needs to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Elevation {
    /// Run under the identity that submitted the workflow.
    #[default]
    Caller,
    /// Run under [`Identity::Superuser`].
    Superuser,
}

impl Elevation {
    /// Identity the handler runs under, given the submitting identity.
    pub fn effective(self, submitted: &Identity) -> Identity {
        match self {
            Self::Caller => submitted.clone(),
            Self::Superuser => Identity::Superuser,
        }
    }
}

/// Tracks the identity of the current call.
#[derive(Debug, Clone, Default)]
pub struct IdentityScope {
    current: Arc<Mutex<Identity>>,
}

impl IdentityScope {
    /// Create a scope starting at `initial`.
    pub fn new(initial: Identity) -> Self {
        Self {
            current: Arc::new(Mutex::new(initial)),
        }
    }

    /// The identity currently in effect.
    pub fn current(&self) -> Identity {
        lock(&self.current).clone()
    }

    /// Switch to `identity` until the returned guard is dropped.
    #[must_use = "the previous identity is restored when the guard drops"]
    pub fn enter(&self, identity: Identity) -> ScopedIdentityGuard {
        let previous = std::mem::replace(&mut *lock(&self.current), identity);
        ScopedIdentityGuard {
            current: Arc::clone(&self.current),
            previous: Some(previous),
        }
    }
}

/// Restores the previous identity of an [`IdentityScope`] on drop.
#[derive(Debug)]
pub struct ScopedIdentityGuard {
    current: Arc<Mutex<Identity>>,
    previous: Option<Identity>,
}

impl Drop for ScopedIdentityGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *lock(&self.current) = previous;
        }
    }
}

// A poisoned lock still holds a valid identity.
fn lock(m: &Mutex<Identity>) -> MutexGuard<'_, Identity> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
