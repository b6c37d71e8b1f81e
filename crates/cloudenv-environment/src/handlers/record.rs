// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Loaded environment aggregate with conflict-retrying updates.

use std::ops::Deref;

use cloudenv_core::Identity;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::model::CloudEnvironment;
use crate::providers::{EnvironmentRepository, RepositoryError};

/// Attempts before a version conflict is surfaced.
pub const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// An environment as last read from the repository, plus the identity to write it with.
pub struct EnvironmentRecord<'a> {
    repository: &'a dyn EnvironmentRepository,
    identity: &'a Identity,
    current: CloudEnvironment,
}

impl<'a> EnvironmentRecord<'a> {
    /// Read an environment. `Ok(None)` when it does not exist.
    pub async fn load(
        repository: &'a dyn EnvironmentRepository,
        id: Uuid,
        identity: &'a Identity,
    ) -> std::result::Result<Option<Self>, RepositoryError> {
        Ok(repository.get(id, identity).await?.map(|current| Self {
            repository,
            identity,
            current,
        }))
    }

    /// Identity writes are made under.
    pub fn identity(&self) -> &Identity {
        self.identity
    }

    /// Apply `mutate` and store the result.
    ///
    /// `mutate` returns whether it changed anything; nothing is written when it
    /// returns `false`. On a version conflict the record is re-read and `mutate`
    /// runs again against the fresh copy, so it must decide from the record it is
    /// given. Returns whether a write happened.
    pub async fn update<F>(&mut self, mut mutate: F) -> Result<bool>
    where
        F: FnMut(&mut CloudEnvironment) -> bool + Send,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut candidate = self.current.clone();
            if !mutate(&mut candidate) {
                return Ok(false);
            }
            let expected_version = candidate.version;
            match self.repository.update(candidate, self.identity).await {
                Ok(stored) => {
                    self.current = stored;
                    return Ok(true);
                }
                Err(RepositoryError::Conflict { .. }) if attempt < MAX_UPDATE_ATTEMPTS => {
                    debug!(
                        environment_id = %self.current.id,
                        expected_version,
                        attempt,
                        "Environment changed concurrently, re-reading"
                    );
                    self.refresh().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(RepositoryError::Conflict {
            id: self.current.id,
            expected_version: self.current.version,
        }
        .into())
    }

    /// Re-read the record.
    pub async fn refresh(&mut self) -> Result<()> {
        self.current = self
            .repository
            .get(self.current.id, self.identity)
            .await?
            .ok_or(RepositoryError::NotFound(self.current.id))?;
        Ok(())
    }
}

impl Deref for EnvironmentRecord<'_> {
    type Target = CloudEnvironment;

    fn deref(&self) -> &CloudEnvironment {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::InMemoryEnvironmentRepository;
    use crate::model::EnvironmentState;

    #[tokio::test]
    async fn test_update_skips_write_when_unchanged() {
        let repo = InMemoryEnvironmentRepository::new();
        let env = repo.insert(CloudEnvironment::new("u1", "dev", "westus2", "basicLinux")).await;
        let identity = Identity::Superuser;

        let mut record = EnvironmentRecord::load(&repo, env.id, &identity).await.unwrap().unwrap();
        assert!(!record.update(|_| false).await.unwrap());
        assert_eq!(repo.update_count(env.id).await, 0);
    }

    #[tokio::test]
    async fn test_update_reapplies_after_conflict() {
        let repo = InMemoryEnvironmentRepository::new();
        let env = repo.insert(CloudEnvironment::new("u1", "dev", "westus2", "basicLinux")).await;
        let identity = Identity::Superuser;

        let mut record = EnvironmentRecord::load(&repo, env.id, &identity).await.unwrap().unwrap();

        // A concurrent writer moves the version on.
        let mut other = repo.get(env.id, &identity).await.unwrap().unwrap();
        other.heartbeat_id = Some(Uuid::new_v4());
        repo.update(other, &identity).await.unwrap();

        let wrote = record
            .update(|e| e.set_state(EnvironmentState::Provisioning))
            .await
            .unwrap();
        assert!(wrote);

        let stored = repo.get(env.id, &identity).await.unwrap().unwrap();
        assert_eq!(stored.state, EnvironmentState::Provisioning);
        assert!(stored.heartbeat_id.is_some(), "concurrent write must survive");
        assert_eq!(record.version, stored.version);
    }
}
