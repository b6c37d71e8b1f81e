// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL continuation queue.
//!
//! Messages live in `continuation_queue`, partitioned by `queue_name` (one name per
//! control-plane region). Pulling leases rows with `FOR UPDATE SKIP LOCKED`, so any
//! number of workers can share a queue.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{ContinuationQueue, CrossRegionQueue, MessageReceipt, QueuedMessage};
use crate::envelope::{ContinuationQueuePayload, ContinuationTarget};
use crate::error::{CoreError, Result};

#[derive(sqlx::FromRow)]
struct PulledRow {
    id: i64,
    payload: serde_json::Value,
    pop_receipt: Uuid,
    dequeue_count: i32,
}

/// Queue stored in PostgreSQL.
pub struct PostgresQueue<T> {
    pool: PgPool,
    queue_name: String,
    _target: PhantomData<fn() -> T>,
}

impl<T: ContinuationTarget> PostgresQueue<T> {
    /// Create a queue handle for `queue_name`.
    pub fn new(pool: PgPool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            _target: PhantomData,
        }
    }

    /// Name of the underlying queue partition.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

async fn insert<T: ContinuationTarget>(
    pool: &PgPool,
    queue_name: &str,
    payload: &ContinuationQueuePayload<T>,
    delay: Duration,
) -> Result<()> {
    let body = serde_json::to_value(payload)?;
    sqlx::query(
        r#"
        INSERT INTO continuation_queue (queue_name, target, tracking_id, payload, visible_at)
        VALUES ($1, $2, $3, $4, NOW() + ($5 * INTERVAL '1 millisecond'))
        "#,
    )
    .bind(queue_name)
    .bind(payload.target.as_str())
    .bind(payload.tracking_id)
    .bind(body)
    .bind(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl<T: ContinuationTarget> ContinuationQueue<T> for PostgresQueue<T> {
    async fn push(&self, payload: ContinuationQueuePayload<T>, delay: Duration) -> Result<()> {
        insert(&self.pool, &self.queue_name, &payload, delay).await
    }

    async fn pull(&self, max: usize, visibility_timeout: Duration) -> Result<Vec<QueuedMessage<T>>> {
        let rows = sqlx::query_as::<_, PulledRow>(
            r#"
            UPDATE continuation_queue
            SET visible_at = NOW() + ($3 * INTERVAL '1 millisecond'),
                pop_receipt = gen_random_uuid(),
                dequeue_count = dequeue_count + 1
            WHERE id IN (
                SELECT id FROM continuation_queue
                WHERE queue_name = $1 AND visible_at <= NOW()
                ORDER BY visible_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, pop_receipt, dequeue_count
            "#,
        )
        .bind(&self.queue_name)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .bind(i64::try_from(visibility_timeout.as_millis()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let payload = serde_json::from_value(row.payload).map_err(|e| {
                    CoreError::Queue(format!("message {} has an unreadable payload: {}", row.id, e))
                })?;
                Ok(QueuedMessage {
                    receipt: MessageReceipt {
                        message_id: row.id,
                        pop_receipt: row.pop_receipt,
                    },
                    payload,
                    dequeue_count: u32::try_from(row.dequeue_count).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn complete(&self, receipt: &MessageReceipt) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM continuation_queue WHERE id = $1 AND pop_receipt = $2",
        )
        .bind(receipt.message_id)
        .bind(receipt.pop_receipt)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Pushes to the queues of other regions, one pool per region.
pub struct PostgresCrossRegionQueue<T> {
    regions: HashMap<String, PgPool>,
    _target: PhantomData<fn() -> T>,
}

impl<T: ContinuationTarget> Default for PostgresCrossRegionQueue<T> {
    fn default() -> Self {
        Self {
            regions: HashMap::new(),
            _target: PhantomData,
        }
    }
}

impl<T: ContinuationTarget> PostgresCrossRegionQueue<T> {
    /// Register the database holding `region`'s queue.
    pub fn with_region(mut self, region: impl Into<String>, pool: PgPool) -> Self {
        self.regions.insert(region.into(), pool);
        self
    }
}

#[async_trait]
impl<T: ContinuationTarget> CrossRegionQueue<T> for PostgresCrossRegionQueue<T> {
    async fn push_to_region(
        &self,
        region: &str,
        payload: ContinuationQueuePayload<T>,
        delay: Duration,
    ) -> Result<()> {
        let pool = self
            .regions
            .get(region)
            .ok_or_else(|| CoreError::CrossRegionUnavailable {
                region: region.to_string(),
            })?;
        insert(pool, region, &payload, delay).await
    }
}
