// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL storage for environments and heartbeat records.
//!
//! Each environment is one row in `environments`: the aggregate as a JSONB
//! document plus the columns the scans filter on. Updates are compare-and-swap
//! on the `version` column.

use async_trait::async_trait;
use cloudenv_core::Identity;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::model::CloudEnvironment;
use crate::providers::{
    EnvironmentQuery, EnvironmentRepository, HeartbeatRepository, ProviderError, RepositoryError,
};

#[derive(Debug, sqlx::FromRow)]
struct EnvironmentRow {
    version: i64,
    document: Json<CloudEnvironment>,
}

impl EnvironmentRow {
    fn into_environment(self) -> CloudEnvironment {
        let mut env = self.document.0;
        env.version = self.version;
        env
    }
}

fn backend(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Backend(e.to_string())
}

fn authorize(id: Uuid, owner_id: &str, identity: &Identity) -> Result<(), RepositoryError> {
    if identity.can_act_for(owner_id) {
        Ok(())
    } else {
        Err(RepositoryError::Forbidden(id))
    }
}

/// Environment repository on PostgreSQL.
#[derive(Clone)]
pub struct PostgresEnvironmentRepository {
    pool: PgPool,
}

impl PostgresEnvironmentRepository {
    /// Create a repository on `pool`. Run [`crate::migrations::run`] first.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnvironmentRepository for PostgresEnvironmentRepository {
    async fn get(&self, id: Uuid, identity: &Identity) -> Result<Option<CloudEnvironment>, RepositoryError> {
        let row = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT version, document FROM environments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => {
                let env = row.into_environment();
                authorize(env.id, &env.owner_id, identity)?;
                Ok(Some(env))
            }
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        mut environment: CloudEnvironment,
        identity: &Identity,
    ) -> Result<CloudEnvironment, RepositoryError> {
        authorize(environment.id, &environment.owner_id, identity)?;
        environment.version = 1;

        let inserted = sqlx::query(
            r#"
            INSERT INTO environments
                (id, owner_id, state, location, last_state_updated, scheduled_archival, version, document)
            VALUES ($1, $2, $3, $4, $5, $6, 1, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(environment.id)
        .bind(&environment.owner_id)
        .bind(environment.state.as_str())
        .bind(&environment.location)
        .bind(environment.last_state_updated)
        .bind(environment.scheduled_archival)
        .bind(Json(&environment))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if inserted.rows_affected() == 0 {
            return Err(RepositoryError::Conflict {
                id: environment.id,
                expected_version: 0,
            });
        }
        Ok(environment)
    }

    async fn update(
        &self,
        mut environment: CloudEnvironment,
        identity: &Identity,
    ) -> Result<CloudEnvironment, RepositoryError> {
        let id = environment.id;
        let stored_owner: Option<(String,)> =
            sqlx::query_as("SELECT owner_id FROM environments WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        let (owner_id,) = stored_owner.ok_or(RepositoryError::NotFound(id))?;
        authorize(id, &owner_id, identity)?;

        let expected_version = environment.version;
        environment.version = expected_version + 1;

        let updated = sqlx::query(
            r#"
            UPDATE environments
            SET owner_id = $2,
                state = $3,
                location = $4,
                last_state_updated = $5,
                scheduled_archival = $6,
                version = version + 1,
                document = $7,
                updated_at = NOW()
            WHERE id = $1
              AND version = $8
            "#,
        )
        .bind(id)
        .bind(&environment.owner_id)
        .bind(environment.state.as_str())
        .bind(&environment.location)
        .bind(environment.last_state_updated)
        .bind(environment.scheduled_archival)
        .bind(Json(&environment))
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::Conflict {
                id,
                expected_version,
            });
        }
        Ok(environment)
    }

    async fn list(
        &self,
        query: &EnvironmentQuery,
        identity: &Identity,
    ) -> Result<Vec<CloudEnvironment>, RepositoryError> {
        let rows = sqlx::query_as::<_, EnvironmentRow>(
            r#"
            SELECT version, document
            FROM environments
            WHERE ($1::TEXT IS NULL OR state = $1)
              AND ($2::TEXT IS NULL OR location = $2)
              AND ($3::TIMESTAMPTZ IS NULL OR scheduled_archival <= $3)
              AND ($4::TIMESTAMPTZ IS NULL OR last_state_updated < $4)
            ORDER BY last_state_updated ASC
            LIMIT $5
            "#,
        )
        .bind(query.state.map(|s| s.as_str()))
        .bind(query.location.as_deref())
        .bind(query.archival_due_before)
        .bind(query.state_updated_before)
        .bind(query.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows
            .into_iter()
            .map(EnvironmentRow::into_environment)
            .filter(|env| identity.can_act_for(&env.owner_id))
            .collect())
    }
}

/// Heartbeat records on PostgreSQL.
#[derive(Clone)]
pub struct PostgresHeartbeatRepository {
    pool: PgPool,
}

impl PostgresHeartbeatRepository {
    /// Create a repository on `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn provider(e: sqlx::Error) -> ProviderError {
    ProviderError::Failed(e.to_string())
}

#[async_trait]
impl HeartbeatRepository for PostgresHeartbeatRepository {
    async fn find(&self, environment_id: Uuid) -> Result<Option<Uuid>, ProviderError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT heartbeat_id FROM environment_heartbeats WHERE environment_id = $1",
        )
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(provider)?;
        Ok(row.map(|(id,)| id))
    }

    async fn create(&self, environment_id: Uuid) -> Result<Uuid, ProviderError> {
        // A concurrent create keeps the first record.
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO environment_heartbeats (environment_id, heartbeat_id)
            VALUES ($1, $2)
            ON CONFLICT (environment_id) DO UPDATE SET environment_id = EXCLUDED.environment_id
            RETURNING heartbeat_id
            "#,
        )
        .bind(environment_id)
        .bind(Uuid::new_v4())
        .fetch_one(&self.pool)
        .await
        .map_err(provider)?;
        Ok(id)
    }
}
