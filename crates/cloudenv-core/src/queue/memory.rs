// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process queue backed by the tokio clock.
//!
//! Visibility follows `tokio::time::Instant`, so tests running with a paused clock can
//! step through retry delays with `tokio::time::advance`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{ContinuationQueue, CrossRegionQueue, MessageReceipt, QueuedMessage};
use crate::envelope::{ContinuationQueuePayload, ContinuationTarget};
use crate::error::Result;

struct Entry<T> {
    id: i64,
    payload: ContinuationQueuePayload<T>,
    visible_at: Instant,
    pop_receipt: Option<Uuid>,
    dequeue_count: u32,
}

struct State<T> {
    next_id: i64,
    entries: Vec<Entry<T>>,
}

/// Queue kept in memory.
pub struct InMemoryQueue<T> {
    state: Mutex<State<T>>,
}

impl<T: ContinuationTarget> Default for InMemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ContinuationTarget> InMemoryQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                entries: Vec::new(),
            }),
        }
    }

    /// Number of messages, visible or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Whether the queue holds no messages.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Copies of every queued payload with the time left until each becomes visible.
    pub async fn snapshot(&self) -> Vec<(ContinuationQueuePayload<T>, Duration)> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .map(|e| (e.payload.clone(), e.visible_at.saturating_duration_since(now)))
            .collect()
    }
}

#[async_trait]
impl<T: ContinuationTarget> ContinuationQueue<T> for InMemoryQueue<T> {
    async fn push(&self, payload: ContinuationQueuePayload<T>, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(Entry {
            id,
            payload,
            visible_at: Instant::now() + delay,
            pop_receipt: None,
            dequeue_count: 0,
        });
        Ok(())
    }

    async fn pull(&self, max: usize, visibility_timeout: Duration) -> Result<Vec<QueuedMessage<T>>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let mut visible: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.visible_at <= now)
            .map(|(i, _)| i)
            .collect();
        visible.sort_by_key(|&i| (state.entries[i].visible_at, state.entries[i].id));
        visible.truncate(max);

        let mut pulled = Vec::with_capacity(visible.len());
        for i in visible {
            let entry = &mut state.entries[i];
            let pop_receipt = Uuid::new_v4();
            entry.visible_at = now + visibility_timeout;
            entry.pop_receipt = Some(pop_receipt);
            entry.dequeue_count += 1;
            pulled.push(QueuedMessage {
                receipt: MessageReceipt {
                    message_id: entry.id,
                    pop_receipt,
                },
                payload: entry.payload.clone(),
                dequeue_count: entry.dequeue_count,
            });
        }
        Ok(pulled)
    }

    async fn complete(&self, receipt: &MessageReceipt) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|e| {
            !(e.id == receipt.message_id && e.pop_receipt == Some(receipt.pop_receipt))
        });
        Ok(state.entries.len() != before)
    }
}

/// One in-memory queue per region.
pub struct InMemoryCrossRegionQueue<T> {
    regions: std::sync::Mutex<HashMap<String, Arc<InMemoryQueue<T>>>>,
}

impl<T: ContinuationTarget> Default for InMemoryCrossRegionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ContinuationTarget> InMemoryCrossRegionQueue<T> {
    /// Create a transport with no regions yet.
    pub fn new() -> Self {
        Self {
            regions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The queue of `region`, created on first use.
    pub fn region(&self, region: &str) -> Arc<InMemoryQueue<T>> {
        let mut regions = self
            .regions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            regions
                .entry(region.to_string())
                .or_insert_with(|| Arc::new(InMemoryQueue::new())),
        )
    }
}

#[async_trait]
impl<T: ContinuationTarget> CrossRegionQueue<T> for InMemoryCrossRegionQueue<T> {
    async fn push_to_region(
        &self,
        region: &str,
        payload: ContinuationQueuePayload<T>,
        delay: Duration,
    ) -> Result<()> {
        self.region(region).push(payload, delay).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::tests::TestTarget;
    use crate::identity::Identity;

    fn payload(n: u32) -> ContinuationQueuePayload<TestTarget> {
        ContinuationQueuePayload::new(TestTarget::Alpha, serde_json::json!(n), Identity::Superuser)
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_message_is_invisible_until_due() {
        let queue = InMemoryQueue::new();
        queue.push(payload(1), Duration::from_secs(10)).await.unwrap();

        assert!(queue.pull(10, Duration::from_secs(30)).await.unwrap().is_empty());
        tokio::time::advance(Duration::from_secs(10)).await;
        let pulled = queue.pull(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].dequeue_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncompleted_message_is_redelivered() {
        let queue = InMemoryQueue::new();
        queue.push(payload(1), Duration::ZERO).await.unwrap();

        let first = queue.pull(1, Duration::from_secs(5)).await.unwrap();
        assert!(queue.pull(1, Duration::from_secs(5)).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        let second = queue.pull(1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].dequeue_count, 2);

        // The first delivery's receipt no longer completes the message.
        assert!(!queue.complete(&first[0].receipt).await.unwrap());
        assert!(queue.complete(&second[0].receipt).await.unwrap());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_pull_respects_max_and_order() {
        let queue = InMemoryQueue::new();
        for n in 0..5 {
            queue.push(payload(n), Duration::ZERO).await.unwrap();
        }
        let pulled = queue.pull(3, Duration::from_secs(30)).await.unwrap();
        let inputs: Vec<_> = pulled.iter().map(|m| m.payload.input.clone()).collect();
        assert_eq!(inputs, vec![serde_json::json!(0), serde_json::json!(1), serde_json::json!(2)]);
    }

    #[tokio::test]
    async fn test_cross_region_routes_by_name() {
        let transport = InMemoryCrossRegionQueue::new();
        transport
            .push_to_region("eu", payload(1), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(transport.region("eu").len().await, 1);
        assert!(transport.region("us").is_empty().await);
    }
}
