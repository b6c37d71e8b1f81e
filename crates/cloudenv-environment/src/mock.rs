// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory collaborators for tests and demos.
//!
//! Each mock keeps its state behind a tokio mutex and exposes helpers to script
//! provider behaviour (statuses, failures) and to inspect the calls it received.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cloudenv_core::{Identity, OperationState, ResourceRef, ResourceType};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::CloudEnvironment;
use crate::providers::{
    AllocateRequest, BrokerError, BrokerOperationStatus, EnvironmentManager, EnvironmentMonitor,
    EnvironmentQuery, EnvironmentRepository, HeartbeatRepository, ProviderError, RepositoryError,
    ResourceBroker, ResourceState, StartAction,
};

// ============================================================================
// Environment repository
// ============================================================================

/// Environment repository backed by a map, with ownership checks and version tokens.
#[derive(Default)]
pub struct InMemoryEnvironmentRepository {
    environments: Mutex<HashMap<Uuid, CloudEnvironment>>,
    update_counts: Mutex<HashMap<Uuid, usize>>,
    failing_updates: AtomicUsize,
}

impl InMemoryEnvironmentRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an environment without ownership checks. Returns the stored copy.
    pub async fn insert(&self, mut environment: CloudEnvironment) -> CloudEnvironment {
        environment.version = environment.version.max(1);
        self.environments
            .lock()
            .await
            .insert(environment.id, environment.clone());
        environment
    }

    /// Current stored copy, bypassing ownership checks.
    pub async fn snapshot(&self, id: Uuid) -> Option<CloudEnvironment> {
        self.environments.lock().await.get(&id).cloned()
    }

    /// Successful updates of an environment so far.
    pub async fn update_count(&self, id: Uuid) -> usize {
        self.update_counts.lock().await.get(&id).copied().unwrap_or(0)
    }

    /// Make the next `n` updates fail with a backend error.
    pub fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn authorize(env: &CloudEnvironment, identity: &Identity) -> Result<(), RepositoryError> {
    if identity.can_act_for(&env.owner_id) {
        Ok(())
    } else {
        Err(RepositoryError::Forbidden(env.id))
    }
}

#[async_trait]
impl EnvironmentRepository for InMemoryEnvironmentRepository {
    async fn get(&self, id: Uuid, identity: &Identity) -> Result<Option<CloudEnvironment>, RepositoryError> {
        let environments = self.environments.lock().await;
        match environments.get(&id) {
            Some(env) => {
                authorize(env, identity)?;
                Ok(Some(env.clone()))
            }
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        mut environment: CloudEnvironment,
        identity: &Identity,
    ) -> Result<CloudEnvironment, RepositoryError> {
        authorize(&environment, identity)?;
        let mut environments = self.environments.lock().await;
        if environments.contains_key(&environment.id) {
            return Err(RepositoryError::Conflict {
                id: environment.id,
                expected_version: environment.version,
            });
        }
        environment.version = 1;
        environments.insert(environment.id, environment.clone());
        Ok(environment)
    }

    async fn update(
        &self,
        mut environment: CloudEnvironment,
        identity: &Identity,
    ) -> Result<CloudEnvironment, RepositoryError> {
        if self.take_failure() {
            return Err(RepositoryError::Backend("injected update failure".into()));
        }
        let mut environments = self.environments.lock().await;
        let stored = environments
            .get(&environment.id)
            .ok_or(RepositoryError::NotFound(environment.id))?;
        authorize(stored, identity)?;
        if stored.version != environment.version {
            return Err(RepositoryError::Conflict {
                id: environment.id,
                expected_version: environment.version,
            });
        }
        environment.version += 1;
        environments.insert(environment.id, environment.clone());
        drop(environments);

        *self
            .update_counts
            .lock()
            .await
            .entry(environment.id)
            .or_default() += 1;
        Ok(environment)
    }

    async fn list(
        &self,
        query: &EnvironmentQuery,
        identity: &Identity,
    ) -> Result<Vec<CloudEnvironment>, RepositoryError> {
        let environments = self.environments.lock().await;
        let mut matching: Vec<_> = environments
            .values()
            .filter(|env| identity.can_act_for(&env.owner_id) && query.matches(env))
            .cloned()
            .collect();
        matching.sort_by_key(|env| env.last_state_updated);
        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

// ============================================================================
// Resource broker
// ============================================================================

/// Scriptable resource broker.
///
/// New allocations report `provision_outcome`; `start` sets `start_outcome` on every
/// resource it touches. Tests move resources along with [`Self::set_provisioning`],
/// [`Self::set_starting`] and [`Self::set_cleanup`].
pub struct MockResourceBroker {
    resources: Mutex<HashMap<Uuid, ResourceState>>,
    deleted: Mutex<Vec<Uuid>>,
    rejected_deletes: Mutex<HashSet<Uuid>>,
    unavailable: AtomicUsize,
    allocate_calls: AtomicUsize,
    start_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    /// Provisioning status of new allocations
    pub provision_outcome: BrokerOperationStatus,
    /// Start status set by `start`
    pub start_outcome: BrokerOperationStatus,
    /// Reject every allocation
    pub reject_allocations: bool,
}

impl Default for MockResourceBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockResourceBroker {
    /// Broker where allocations and starts succeed at once.
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            rejected_deletes: Mutex::new(HashSet::new()),
            unavailable: AtomicUsize::new(0),
            allocate_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            provision_outcome: BrokerOperationStatus::Succeeded,
            start_outcome: BrokerOperationStatus::Succeeded,
            reject_allocations: false,
        }
    }

    /// Broker where allocations and starts stay in progress until moved on.
    pub fn slow() -> Self {
        Self {
            provision_outcome: BrokerOperationStatus::InProgress,
            start_outcome: BrokerOperationStatus::InProgress,
            ..Self::new()
        }
    }

    /// Allocate directly, bypassing call counting.
    pub async fn allocate_now(&self, _environment_id: Uuid, types: &[ResourceType]) -> Vec<ResourceRef> {
        let mut resources = self.resources.lock().await;
        types
            .iter()
            .map(|&t| {
                let r = ResourceRef::new(t, "westus2", "standard");
                resources.insert(r.resource_id, self.fresh_state(&r));
                r
            })
            .collect()
    }

    fn fresh_state(&self, r: &ResourceRef) -> ResourceState {
        ResourceState {
            resource_id: r.resource_id,
            resource_type: r.resource_type,
            provisioning: self.provision_outcome,
            starting: None,
            cleanup: None,
        }
    }

    /// Set a resource's provisioning status.
    pub async fn set_provisioning(&self, id: Uuid, status: BrokerOperationStatus) {
        if let Some(state) = self.resources.lock().await.get_mut(&id) {
            state.provisioning = status;
        }
    }

    /// Set a resource's start status.
    pub async fn set_starting(&self, id: Uuid, status: Option<BrokerOperationStatus>) {
        if let Some(state) = self.resources.lock().await.get_mut(&id) {
            state.starting = status;
        }
    }

    /// Set a resource's cleanup status.
    pub async fn set_cleanup(&self, id: Uuid, status: Option<BrokerOperationStatus>) {
        if let Some(state) = self.resources.lock().await.get_mut(&id) {
            state.cleanup = status;
        }
    }

    /// Make deletes of `id` fail.
    pub async fn reject_delete(&self, id: Uuid) {
        self.rejected_deletes.lock().await.insert(id);
    }

    /// Make the next `n` calls fail with [`BrokerError::Unavailable`].
    pub fn fail_next_with_unavailable(&self, n: usize) {
        self.unavailable.store(n, Ordering::SeqCst);
    }

    /// Whether the broker still has `id`.
    pub async fn exists(&self, id: Uuid) -> bool {
        self.resources.lock().await.contains_key(&id)
    }

    /// Successfully deleted resource ids, in order.
    pub async fn deleted(&self) -> Vec<Uuid> {
        self.deleted.lock().await.clone()
    }

    /// `allocate` calls so far.
    pub async fn allocate_calls(&self) -> usize {
        self.allocate_calls.load(Ordering::SeqCst)
    }

    /// `start` calls so far.
    pub async fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// `delete` calls so far.
    pub async fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self
            .unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::Unavailable {
                retry_after: Duration::from_secs(5),
                message: "injected outage".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceBroker for MockResourceBroker {
    async fn allocate(
        &self,
        _environment_id: Uuid,
        requests: &[AllocateRequest],
    ) -> Result<Vec<ResourceRef>, BrokerError> {
        self.check_available()?;
        self.allocate_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_allocations {
            return Err(BrokerError::Rejected("capacity exhausted".into()));
        }
        let mut resources = self.resources.lock().await;
        Ok(requests
            .iter()
            .map(|req| {
                let r = ResourceRef::new(req.resource_type, &req.location, &req.sku_name);
                resources.insert(r.resource_id, self.fresh_state(&r));
                r
            })
            .collect())
    }

    async fn status(&self, _environment_id: Uuid, resource_id: Uuid) -> Result<ResourceState, BrokerError> {
        self.check_available()?;
        self.resources
            .lock()
            .await
            .get(&resource_id)
            .cloned()
            .ok_or(BrokerError::NotFound { resource_id })
    }

    async fn start(
        &self,
        _environment_id: Uuid,
        _action: StartAction,
        resources: &[Uuid],
    ) -> Result<(), BrokerError> {
        self.check_available()?;
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut known = self.resources.lock().await;
        if let Some(&resource_id) = resources.iter().find(|id| !known.contains_key(id)) {
            return Err(BrokerError::NotFound { resource_id });
        }
        for id in resources {
            if let Some(state) = known.get_mut(id) {
                state.starting = Some(self.start_outcome);
            }
        }
        Ok(())
    }

    async fn delete(&self, _environment_id: Uuid, resource_id: Uuid) -> Result<(), BrokerError> {
        self.check_available()?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.rejected_deletes.lock().await.contains(&resource_id) {
            return Err(BrokerError::Rejected("resource locked".into()));
        }
        match self.resources.lock().await.remove(&resource_id) {
            Some(_) => {
                self.deleted.lock().await.push(resource_id);
                Ok(())
            }
            None => Err(BrokerError::NotFound { resource_id }),
        }
    }
}

// ============================================================================
// Heartbeats, monitor, manager
// ============================================================================

/// Heartbeat records in a map.
#[derive(Default)]
pub struct InMemoryHeartbeatRepository {
    records: Mutex<HashMap<Uuid, Uuid>>,
}

impl InMemoryHeartbeatRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of heartbeat records.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Whether there are no heartbeat records.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl HeartbeatRepository for InMemoryHeartbeatRepository {
    async fn find(&self, environment_id: Uuid) -> Result<Option<Uuid>, ProviderError> {
        Ok(self.records.lock().await.get(&environment_id).copied())
    }

    async fn create(&self, environment_id: Uuid) -> Result<Uuid, ProviderError> {
        Ok(*self
            .records
            .lock()
            .await
            .entry(environment_id)
            .or_insert_with(Uuid::new_v4))
    }
}

/// Records which compute instances are monitored.
#[derive(Default)]
pub struct MockEnvironmentMonitor {
    monitored: Mutex<Vec<(Uuid, Uuid)>>,
}

impl MockEnvironmentMonitor {
    /// Create a monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(environment_id, compute_id)` pairs registered so far.
    pub async fn monitored(&self) -> Vec<(Uuid, Uuid)> {
        self.monitored.lock().await.clone()
    }
}

#[async_trait]
impl EnvironmentMonitor for MockEnvironmentMonitor {
    async fn monitor_heartbeat(&self, environment_id: Uuid, compute_id: Uuid) -> Result<(), ProviderError> {
        self.monitored.lock().await.push((environment_id, compute_id));
        Ok(())
    }
}

/// Environment manager replaying scripted outcomes.
///
/// Each call pops the next scripted outcome; when the script is empty it reports
/// `default_outcome`.
pub struct MockEnvironmentManager {
    script: Mutex<VecDeque<Result<OperationState, ProviderError>>>,
    calls: Mutex<Vec<(&'static str, Uuid, Identity)>>,
    /// Outcome once the script is exhausted
    pub default_outcome: OperationState,
}

impl Default for MockEnvironmentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEnvironmentManager {
    /// Manager whose calls succeed.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            default_outcome: OperationState::Succeeded,
        }
    }

    /// Queue an outcome for the next call.
    pub async fn push_outcome(&self, outcome: Result<OperationState, ProviderError>) {
        self.script.lock().await.push_back(outcome);
    }

    /// `(operation, environment_id, identity)` of every call.
    pub async fn calls(&self) -> Vec<(&'static str, Uuid, Identity)> {
        self.calls.lock().await.clone()
    }

    async fn next(
        &self,
        operation: &'static str,
        environment_id: Uuid,
        identity: &Identity,
    ) -> Result<OperationState, ProviderError> {
        self.calls
            .lock()
            .await
            .push((operation, environment_id, identity.clone()));
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(self.default_outcome))
    }
}

#[async_trait]
impl EnvironmentManager for MockEnvironmentManager {
    async fn suspend(&self, environment_id: Uuid, identity: &Identity) -> Result<OperationState, ProviderError> {
        self.next("suspend", environment_id, identity).await
    }

    async fn force_suspend(
        &self,
        environment_id: Uuid,
        identity: &Identity,
    ) -> Result<OperationState, ProviderError> {
        self.next("force_suspend", environment_id, identity).await
    }
}

/// A full set of mocks, shared as trait objects and as concrete handles.
#[derive(Clone)]
pub struct MockCollaborators {
    /// Repository.
    pub repository: Arc<InMemoryEnvironmentRepository>,
    /// Broker.
    pub broker: Arc<MockResourceBroker>,
    /// Heartbeats.
    pub heartbeats: Arc<InMemoryHeartbeatRepository>,
    /// Monitor.
    pub monitor: Arc<MockEnvironmentMonitor>,
    /// Manager.
    pub manager: Arc<MockEnvironmentManager>,
}

impl MockCollaborators {
    /// Mocks around `broker`.
    pub fn with_broker(broker: MockResourceBroker) -> Self {
        Self {
            repository: Arc::new(InMemoryEnvironmentRepository::new()),
            broker: Arc::new(broker),
            heartbeats: Arc::new(InMemoryHeartbeatRepository::new()),
            monitor: Arc::new(MockEnvironmentMonitor::new()),
            manager: Arc::new(MockEnvironmentManager::new()),
        }
    }

    /// As handler collaborators.
    pub fn collaborators(&self) -> crate::handlers::Collaborators {
        crate::handlers::Collaborators {
            repository: self.repository.clone(),
            broker: self.broker.clone(),
            heartbeats: self.heartbeats.clone(),
            monitor: self.monitor.clone(),
            manager: self.manager.clone(),
        }
    }
}

impl Default for MockCollaborators {
    fn default() -> Self {
        Self::with_broker(MockResourceBroker::new())
    }
}
