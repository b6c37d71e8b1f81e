// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Claimed leases in PostgreSQL.
//!
//! Obtaining is a single upsert on `claimed_leases` that only takes the row when it is
//! free (or expired) and, with a claim period, not yet claimed in the current window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{ClaimedLease, LEASE_TIME, LeaseBackend, LeaseGuard, LeaseKey, claim_window_start};
use crate::error::Result;

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

struct Backend {
    pool: PgPool,
}

#[async_trait]
impl LeaseBackend for Backend {
    async fn renew(&self, key: &LeaseKey, holder: Uuid, lease_time: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE claimed_leases
            SET held_until = NOW() + ($4 * INTERVAL '1 millisecond')
            WHERE container = $1 AND name = $2 AND holder = $3
            "#,
        )
        .bind(&key.container)
        .bind(&key.name)
        .bind(holder)
        .bind(millis(lease_time))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &LeaseKey, holder: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE claimed_leases
            SET holder = NULL, held_until = NOW(), last_claimed = NOW()
            WHERE container = $1 AND name = $2 AND holder = $3
            "#,
        )
        .bind(&key.container)
        .bind(&key.name)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Claimed leases stored in PostgreSQL.
#[derive(Clone)]
pub struct PostgresLease {
    backend: Arc<Backend>,
}

impl PostgresLease {
    /// Create a lease store on `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            backend: Arc::new(Backend { pool }),
        }
    }
}

#[async_trait]
impl ClaimedLease for PostgresLease {
    async fn obtain(
        &self,
        container: &str,
        name: &str,
        claim_period: Option<Duration>,
    ) -> Result<Option<LeaseGuard>> {
        let key = LeaseKey::new(container, name);
        let holder = Uuid::new_v4();
        let window_start: Option<DateTime<Utc>> =
            claim_period.map(|period| claim_window_start(Utc::now(), period));

        let obtained: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO claimed_leases (container, name, holder, held_until, last_claimed)
            VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 millisecond'), NOW())
            ON CONFLICT (container, name) DO UPDATE
            SET holder = EXCLUDED.holder,
                held_until = EXCLUDED.held_until,
                last_claimed = EXCLUDED.last_claimed
            WHERE (claimed_leases.holder IS NULL OR claimed_leases.held_until <= NOW())
              AND ($5::timestamptz IS NULL
                   OR claimed_leases.last_claimed IS NULL
                   OR claimed_leases.last_claimed < $5)
            RETURNING holder
            "#,
        )
        .bind(&key.container)
        .bind(&key.name)
        .bind(holder)
        .bind(millis(LEASE_TIME))
        .bind(window_start)
        .fetch_optional(&self.backend.pool)
        .await?;

        match obtained {
            Some(h) if h == holder => {
                let backend: Arc<dyn LeaseBackend> = self.backend.clone();
                Ok(Some(LeaseGuard::new(key, holder, backend)))
            }
            _ => Ok(None),
        }
    }
}
