// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for cloudenv-environment.
//!
//! The environment tables build on the continuation queue and lease tables of
//! cloudenv-core. [`run`] applies both sets as one migrator, ordered by version.
//!
//! ```ignore
//! let pool = PgPool::connect(&database_url).await?;
//! cloudenv_environment::migrations::run(&pool).await?;
//! ```

use sqlx::migrate::{MigrateError, Migration, Migrator};

static ENV_MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug)]
struct CombinedMigrations;

impl<'s> sqlx::migrate::MigrationSource<'s> for CombinedMigrations {
    fn resolve(
        self,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<
                    Output = Result<Vec<Migration>, Box<dyn std::error::Error + Send + Sync>>,
                > + Send
                + 's,
        >,
    > {
        Box::pin(async move { Ok(all()) })
    }
}

/// Core and environment migrations, sorted by version.
pub fn all() -> Vec<Migration> {
    let mut migrations: Vec<Migration> = cloudenv_core::migrations::POSTGRES
        .iter()
        .chain(ENV_MIGRATOR.iter())
        .cloned()
        .collect();
    migrations.sort_by_key(|m| m.version);
    migrations
}

/// A migrator over [`all`].
pub async fn migrator() -> Result<Migrator, MigrateError> {
    Migrator::new(CombinedMigrations).await
}

/// Apply every migration. Already-applied migrations are skipped.
pub async fn run(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    migrator().await?.run(pool).await
}
