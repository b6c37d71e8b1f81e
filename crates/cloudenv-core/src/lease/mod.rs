// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Claimed distributed leases.
//!
//! A claimed lease is a named lease that can be taken at most once per claim window,
//! where windows are consecutive multiples of the claim period counted from UTC
//! midnight. Periodic tasks use it so that exactly one instance in the fleet runs each
//! unit of work per period, even when the first holder finishes early and releases.
//!
//! A held lease expires after [`LEASE_TIME`] unless renewed. [`LeaseGuard`] renews it
//! every [`RENEW_INTERVAL`] until it is released or dropped.

mod memory;
mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Timelike, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

pub use memory::InMemoryLease;
pub use postgres::PostgresLease;

/// How long a lease is held without renewal.
pub const LEASE_TIME: Duration = Duration::from_secs(60);

/// How often a held lease is renewed.
pub const RENEW_INTERVAL: Duration = Duration::from_millis(52_500);

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Identifies a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    /// Group the lease belongs to.
    pub container: String,
    /// Lease name, normalized by [`sanitize_name`].
    pub name: String,
}

impl LeaseKey {
    /// Build a key, normalizing both parts.
    pub fn new(container: &str, name: &str) -> Self {
        Self {
            container: sanitize_name(container),
            name: sanitize_name(name),
        }
    }
}

/// Normalize a lease name: underscores removed, lowercased.
pub fn sanitize_name(name: &str) -> String {
    name.replace('_', "").to_lowercase()
}

/// Start of the claim window containing `now`.
///
/// Windows start at UTC midnight and repeat every `period`. Periods of a day or more
/// collapse to one window per day.
pub fn claim_window_start(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let midnight = Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN));
    let period_secs = period.as_secs().clamp(1, SECONDS_PER_DAY);
    let since_midnight = u64::from(now.num_seconds_from_midnight());
    let offset = (since_midnight / period_secs) * period_secs;
    midnight + chrono::Duration::seconds(offset as i64)
}

/// Storage operations a [`LeaseGuard`] needs after the lease was obtained.
#[async_trait]
pub trait LeaseBackend: Send + Sync + 'static {
    /// Extend a held lease. Returns false if `holder` no longer holds it.
    async fn renew(&self, key: &LeaseKey, holder: Uuid, lease_time: Duration) -> Result<bool>;

    /// Release a held lease, stamping it as claimed now.
    async fn release(&self, key: &LeaseKey, holder: Uuid) -> Result<()>;
}

/// Obtains claimed leases.
#[async_trait]
pub trait ClaimedLease: Send + Sync {
    /// Obtain `name` in `container`.
    ///
    /// Returns `None` if the lease is held elsewhere, or if `claim_period` is given and the
    /// lease was already claimed in the current window.
    async fn obtain(
        &self,
        container: &str,
        name: &str,
        claim_period: Option<Duration>,
    ) -> Result<Option<LeaseGuard>>;

    /// Like [`Self::obtain`], retrying up to `attempts` times with `delay` in between.
    async fn try_obtain(
        &self,
        container: &str,
        name: &str,
        claim_period: Option<Duration>,
        attempts: u32,
        delay: Duration,
    ) -> Result<Option<LeaseGuard>> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(guard) = self.obtain(container, name, claim_period).await? {
                return Ok(Some(guard));
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(None)
    }
}

/// A held lease. Renewed in the background until released.
pub struct LeaseGuard {
    key: LeaseKey,
    holder: Uuid,
    backend: Option<Arc<dyn LeaseBackend>>,
    renewal: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    /// Wrap a freshly obtained lease and start renewing it.
    pub fn new(key: LeaseKey, holder: Uuid, backend: Arc<dyn LeaseBackend>) -> Self {
        Self::with_renewal(key, holder, backend, RENEW_INTERVAL, LEASE_TIME)
    }

    /// Wrap a freshly obtained lease with custom renewal timing.
    pub fn with_renewal(
        key: LeaseKey,
        holder: Uuid,
        backend: Arc<dyn LeaseBackend>,
        renew_every: Duration,
        lease_time: Duration,
    ) -> Self {
        let renewal = {
            let backend = Arc::clone(&backend);
            let key = key.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(renew_every).await;
                    match backend.renew(&key, holder, lease_time).await {
                        Ok(true) => debug!(container = %key.container, name = %key.name, "Renewed lease"),
                        Ok(false) => {
                            warn!(container = %key.container, name = %key.name, "Lease lost before renewal");
                            break;
                        }
                        Err(e) => {
                            warn!(container = %key.container, name = %key.name, error = %e, "Failed to renew lease");
                        }
                    }
                }
            })
        };

        Self {
            key,
            holder,
            backend: Some(backend),
            renewal: Some(renewal),
        }
    }

    /// The lease key.
    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    /// Token identifying this holder.
    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Stop renewing and release the lease.
    pub async fn release(mut self) -> Result<()> {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        match self.backend.take() {
            Some(backend) => backend.release(&self.key, self.holder).await,
            None => Ok(()),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        let Some(backend) = self.backend.take() else {
            return;
        };
        // Not released explicitly; release in the background if a runtime is still up,
        // otherwise the lease expires on its own.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let key = self.key.clone();
            let holder = self.holder;
            handle.spawn(async move {
                if let Err(e) = backend.release(&key, holder).await {
                    warn!(container = %key.container, name = %key.name, error = %e, "Failed to release dropped lease");
                }
            });
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_window_start_aligns_to_midnight_multiples() {
        let hour = Duration::from_secs(3600);
        assert_eq!(claim_window_start(at(13, 59, 59), hour), at(13, 0, 0));
        assert_eq!(claim_window_start(at(14, 0, 0), hour), at(14, 0, 0));

        let seven_minutes = Duration::from_secs(420);
        // 00:42 is 6 * 7 minutes after midnight.
        assert_eq!(claim_window_start(at(0, 45, 10), seven_minutes), at(0, 42, 0));
    }

    #[test]
    fn test_long_periods_collapse_to_midnight() {
        let week = Duration::from_secs(7 * 24 * 3600);
        assert_eq!(claim_window_start(at(18, 30, 0), week), at(0, 0, 0));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Archive_Scan-westus2"), "archivescan-westus2");
        let key = LeaseKey::new("Background_Tasks", "X_Y");
        assert_eq!(key.container, "backgroundtasks");
        assert_eq!(key.name, "xy");
    }
}
