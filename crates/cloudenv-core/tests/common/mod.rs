// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for cloudenv-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cloudenv_core::{
    ContinuationActivator, ContinuationResult, ContinuationSubmitter, ContinuationTarget,
    DispatchContext, Dispatcher, HandlerError, HandlerRegistry, InMemoryCrossRegionQueue,
    InMemoryQueue, PhaseHandler, StaticRegionMap,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Job {
    Countdown,
    Flaky,
    Broken,
}

impl ContinuationTarget for Job {
    fn all() -> &'static [Self] {
        &[Self::Countdown, Self::Flaky, Self::Broken]
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Countdown => "countdown",
            Self::Flaky => "flaky",
            Self::Broken => "broken",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Countdown {
    pub remaining: u32,
}

/// Counts down, waiting one second between steps.
pub struct CountdownHandler {
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl PhaseHandler<Job> for CountdownHandler {
    type Input = Countdown;

    fn target(&self) -> Job {
        Job::Countdown
    }

    async fn continue_phase(
        &self,
        input: Countdown,
        _ctx: &DispatchContext,
    ) -> Result<ContinuationResult<Countdown>, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if input.remaining == 0 {
            return Ok(ContinuationResult::succeeded());
        }
        Ok(ContinuationResult::in_progress_after(
            Countdown {
                remaining: input.remaining - 1,
            },
            Duration::from_secs(1),
        ))
    }
}

/// Fails with an error until `failures` calls have been made, then succeeds.
pub struct FlakyHandler {
    pub failures: u32,
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl PhaseHandler<Job> for FlakyHandler {
    type Input = Countdown;

    fn target(&self) -> Job {
        Job::Flaky
    }

    async fn continue_phase(
        &self,
        _input: Countdown,
        _ctx: &DispatchContext,
    ) -> Result<ContinuationResult<Countdown>, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(HandlerError::other(format!("transient failure {call}")));
        }
        Ok(ContinuationResult::succeeded())
    }
}

/// Always panics.
pub struct BrokenHandler;

#[async_trait]
impl PhaseHandler<Job> for BrokenHandler {
    type Input = Countdown;

    fn target(&self) -> Job {
        Job::Broken
    }

    async fn continue_phase(
        &self,
        _input: Countdown,
        _ctx: &DispatchContext,
    ) -> Result<ContinuationResult<Countdown>, HandlerError> {
        panic!("broken handler");
    }
}

pub struct Harness {
    pub queue: Arc<InMemoryQueue<Job>>,
    pub remote: Arc<InMemoryCrossRegionQueue<Job>>,
    pub activator: Arc<ContinuationActivator<Job>>,
    pub countdown_calls: Arc<AtomicU32>,
    pub flaky_calls: Arc<AtomicU32>,
}

pub fn harness(flaky_failures: u32) -> Harness {
    let queue = Arc::new(InMemoryQueue::new());
    let remote = Arc::new(InMemoryCrossRegionQueue::new());
    let regions = Arc::new(
        StaticRegionMap::new("us")
            .with_location("westus2", "us")
            .with_location("westeurope", "eu"),
    );
    let submitter = ContinuationSubmitter::new(queue.clone(), regions).with_cross_region(remote.clone());

    let countdown_calls = Arc::new(AtomicU32::new(0));
    let flaky_calls = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::builder()
        .register(CountdownHandler {
            calls: countdown_calls.clone(),
        })
        .register(FlakyHandler {
            failures: flaky_failures,
            calls: flaky_calls.clone(),
        })
        .register(BrokenHandler)
        .build()
        .expect("every job has a handler");

    let activator = Arc::new(ContinuationActivator::new(
        Dispatcher::new(Arc::new(registry)),
        submitter,
    ));

    Harness {
        queue,
        remote,
        activator,
        countdown_calls,
        flaky_calls,
    }
}
