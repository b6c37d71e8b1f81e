// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle Demo - Runs one environment through create, shutdown, archive and resume.
//!
//! Everything runs in-process: the queue, the lease and every provider are the
//! in-memory mocks from `cloudenv_environment::mock`.
//!
//! Run with: cargo run -p cloudenv-demo --bin lifecycle_demo

use std::time::Duration;

use anyhow::{Context, bail};
use cloudenv_core::Identity;
use cloudenv_environment::config::Config;
use cloudenv_environment::handlers::{
    ArchivePhase, CreatePhase, ShutdownPhase, StartPhase, WorkflowInput,
};
use cloudenv_environment::mock::MockCollaborators;
use cloudenv_environment::runtime::EnvironmentRuntime;
use cloudenv_environment::{CloudEnvironment, EnvironmentState, EnvironmentTarget};
use tracing::{info, warn};

const OWNER: &str = "demo-user";
const LOCATION: &str = "westus2";

fn demo_config() -> Config {
    let mut core = cloudenv_core::Config {
        region: LOCATION.to_string(),
        database_url: None,
        worker: Default::default(),
        max_workflow_age: Duration::from_secs(3600),
        fault_retry: Default::default(),
    };
    core.worker.poll_interval = Duration::from_millis(20);
    Config {
        core,
        location_regions: vec![(LOCATION.to_string(), LOCATION.to_string())],
        archive_after: Duration::ZERO,
        tasks: Default::default(),
    }
}

async fn wait_for(
    mocks: &MockCollaborators,
    env: &CloudEnvironment,
    state: EnvironmentState,
) -> anyhow::Result<CloudEnvironment> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let current = mocks
            .repository
            .snapshot(env.id)
            .await
            .context("environment disappeared")?;
        if current.state == state {
            info!(environment_id = %env.id, state = %state, "Reached state");
            return Ok(current);
        }
        if current.state == EnvironmentState::Failed {
            bail!("environment failed while waiting for {state}");
        }
        if tokio::time::Instant::now() > deadline {
            bail!("timed out waiting for {state}, still {}", current.state);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("=== Lifecycle Demo: create, shutdown, archive, resume ===");

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            warn!("No usable configuration in the environment ({}). Using demo defaults.", e);
            demo_config()
        }
    };

    let mocks = MockCollaborators::default();
    let runtime = EnvironmentRuntime::builder()
        .config(config)
        .collaborators(mocks.collaborators())
        .build()?
        .start()
        .await?;
    let submitter = runtime.submitter().clone();
    let owner = Identity::user(OWNER);

    let env = mocks
        .repository
        .insert(CloudEnvironment::new(OWNER, "demo", LOCATION, "standard"))
        .await;
    info!(environment_id = %env.id, "Created environment record");

    submitter
        .submit_as(
            EnvironmentTarget::CreateEnvironment,
            &WorkflowInput::<CreatePhase>::new(env.id, "DemoCreate", env.last_state_updated),
            owner.clone(),
        )
        .await?;
    let env = wait_for(&mocks, &env, EnvironmentState::Available).await?;

    submitter
        .submit_as(
            EnvironmentTarget::ShutdownEnvironment,
            &WorkflowInput::<ShutdownPhase>::new(env.id, "DemoShutdown", env.last_state_updated),
            owner.clone(),
        )
        .await?;
    let env = wait_for(&mocks, &env, EnvironmentState::Shutdown).await?;

    submitter
        .submit_as(
            EnvironmentTarget::ArchiveEnvironment,
            &WorkflowInput::<ArchivePhase>::new(env.id, "DemoArchive", env.last_state_updated),
            Identity::Superuser,
        )
        .await?;
    let env = wait_for(&mocks, &env, EnvironmentState::Archived).await?;

    submitter
        .submit_as(
            EnvironmentTarget::StartEnvironment,
            &WorkflowInput::<StartPhase>::new(env.id, "DemoResume", env.last_state_updated),
            owner,
        )
        .await?;
    let env = wait_for(&mocks, &env, EnvironmentState::Available).await?;

    info!(
        environment_id = %env.id,
        version = env.version,
        transitions = env.transitions.len(),
        broker_deletes = mocks.broker.delete_calls().await,
        "Lifecycle complete"
    );
    for (operation, transition) in &env.transitions {
        info!(operation = operation.as_str(), status = %transition.status, "Operation");
    }

    runtime.shutdown().await?;
    info!("=== Lifecycle Demo complete ===");
    Ok(())
}
