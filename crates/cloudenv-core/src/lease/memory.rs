// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process claimed leases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{ClaimedLease, LEASE_TIME, LeaseBackend, LeaseGuard, LeaseKey, claim_window_start};
use crate::error::Result;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
struct Record {
    holder: Option<Uuid>,
    held_until: DateTime<Utc>,
    last_claimed: Option<DateTime<Utc>>,
}

struct Backend {
    records: Mutex<HashMap<LeaseKey, Record>>,
    clock: Clock,
}

impl Backend {
    fn records(&self) -> MutexGuard<'_, HashMap<LeaseKey, Record>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lease_time_delta(lease_time: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease_time).unwrap_or(chrono::Duration::MAX)
}

#[async_trait]
impl LeaseBackend for Backend {
    async fn renew(&self, key: &LeaseKey, holder: Uuid, lease_time: Duration) -> Result<bool> {
        let now = (self.clock)();
        let mut records = self.records();
        match records.get_mut(key) {
            Some(record) if record.holder == Some(holder) => {
                record.held_until = now + lease_time_delta(lease_time);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &LeaseKey, holder: Uuid) -> Result<()> {
        let now = (self.clock)();
        let mut records = self.records();
        if let Some(record) = records.get_mut(key)
            && record.holder == Some(holder)
        {
            record.holder = None;
            record.held_until = now;
            record.last_claimed = Some(now);
        }
        Ok(())
    }
}

/// Claimed leases kept in memory. Shared by cloning.
#[derive(Clone)]
pub struct InMemoryLease {
    backend: Arc<Backend>,
}

impl Default for InMemoryLease {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLease {
    /// Leases on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    /// Leases on a custom clock.
    pub fn with_clock(clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        Self {
            backend: Arc::new(Backend {
                records: Mutex::new(HashMap::new()),
                clock,
            }),
        }
    }

    /// Whether `name` in `container` is currently held.
    pub fn is_held(&self, container: &str, name: &str) -> bool {
        let now = (self.backend.clock)();
        self.backend
            .records()
            .get(&LeaseKey::new(container, name))
            .is_some_and(|r| r.holder.is_some() && r.held_until > now)
    }
}

#[async_trait]
impl ClaimedLease for InMemoryLease {
    async fn obtain(
        &self,
        container: &str,
        name: &str,
        claim_period: Option<Duration>,
    ) -> Result<Option<LeaseGuard>> {
        let key = LeaseKey::new(container, name);
        let now = (self.backend.clock)();
        let holder = Uuid::new_v4();
        {
            let mut records = self.backend.records();
            let record = records.entry(key.clone()).or_insert(Record {
                holder: None,
                held_until: now,
                last_claimed: None,
            });

            if record.holder.is_some() && record.held_until > now {
                return Ok(None);
            }
            if let (Some(period), Some(last)) = (claim_period, record.last_claimed)
                && last >= claim_window_start(now, period)
            {
                return Ok(None);
            }

            record.holder = Some(holder);
            record.held_until = now + lease_time_delta(LEASE_TIME);
            record.last_claimed = Some(now);
        }

        let backend: Arc<dyn LeaseBackend> = self.backend.clone();
        Ok(Some(LeaseGuard::new(key, holder, backend)))
    }
}
