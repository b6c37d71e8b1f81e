// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use cloudenv_core::StaticRegionMap;
use cloudenv_core::config::parse_var;

pub use cloudenv_core::ConfigError;

/// Environment service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Continuation engine settings
    pub core: cloudenv_core::Config,
    /// Data-plane location to owning control-plane region
    pub location_regions: Vec<(String, String)>,
    /// Delay between shutdown and archival eligibility
    pub archive_after: Duration,
    /// Periodic task settings
    pub tasks: TaskConfig,
}

/// Configuration for the lease-guarded periodic tasks.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Whether the tasks run at all
    pub enabled: bool,
    /// Interval between ticks
    pub poll_interval: Duration,
    /// Each location is scanned at most once per claim period, fleet-wide
    pub claim_period: Duration,
    /// Data-plane locations this region scans
    pub data_plane_locations: Vec<String>,
    /// How long a failed environment is kept before deletion
    pub failed_grace: Duration,
    /// Maximum environments handled per location per tick
    pub batch_size: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(300),
            claim_period: Duration::from_secs(3600),
            data_plane_locations: Vec::new(),
            failed_grace: Duration::from_secs(24 * 3600),
            batch_size: 100,
        }
    }
}

impl Config {
    /// Load `.env` if present, then [`Self::from_env`].
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from environment variables.
    ///
    /// Everything [`cloudenv_core::Config::from_env`] reads, plus (all optional):
    /// - `CLOUDENV_DATA_PLANE_LOCATIONS`: comma-separated locations scanned by tasks
    ///   (default: the region name)
    /// - `CLOUDENV_LOCATION_REGIONS`: `location=region` pairs, comma-separated
    ///   (default: every scanned location belongs to this region)
    /// - `CLOUDENV_ARCHIVE_AFTER_HOURS`: shutdown-to-archival delay (default: 168)
    /// - `CLOUDENV_TASKS_ENABLED`: run periodic tasks (default: false)
    /// - `CLOUDENV_TASK_POLL_INTERVAL_SECS`: task tick (default: 300)
    /// - `CLOUDENV_TASK_CLAIM_PERIOD_SECS`: claim period per location (default: 3600)
    /// - `CLOUDENV_FAILED_GRACE_HOURS`: failed environment retention (default: 24)
    /// - `CLOUDENV_TASK_BATCH_SIZE`: environments per location per tick (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        let core = cloudenv_core::Config::from_env()?;

        let data_plane_locations = match std::env::var("CLOUDENV_DATA_PLANE_LOCATIONS") {
            Ok(raw) => split_list(&raw),
            Err(_) => vec![core.region.clone()],
        };

        let location_regions = match std::env::var("CLOUDENV_LOCATION_REGIONS") {
            Ok(raw) => split_list(&raw)
                .into_iter()
                .map(|pair| {
                    pair.split_once('=')
                        .map(|(l, r)| (l.trim().to_string(), r.trim().to_string()))
                        .ok_or(ConfigError::Invalid(
                            "CLOUDENV_LOCATION_REGIONS",
                            "entries must look like location=region",
                        ))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => data_plane_locations
                .iter()
                .map(|l| (l.clone(), core.region.clone()))
                .collect(),
        };

        let defaults = TaskConfig::default();
        let tasks = TaskConfig {
            enabled: parse_var("CLOUDENV_TASKS_ENABLED", defaults.enabled, "must be true or false")?,
            poll_interval: Duration::from_secs(parse_var(
                "CLOUDENV_TASK_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
                "must be a number of seconds",
            )?),
            claim_period: Duration::from_secs(parse_var(
                "CLOUDENV_TASK_CLAIM_PERIOD_SECS",
                defaults.claim_period.as_secs(),
                "must be a number of seconds",
            )?),
            data_plane_locations,
            failed_grace: hours(parse_var(
                "CLOUDENV_FAILED_GRACE_HOURS",
                defaults.failed_grace.as_secs() / 3600,
                "must be a number of hours",
            )?),
            batch_size: parse_var(
                "CLOUDENV_TASK_BATCH_SIZE",
                defaults.batch_size,
                "must be a positive integer",
            )?,
        };

        let archive_after = hours(parse_var(
            "CLOUDENV_ARCHIVE_AFTER_HOURS",
            168u64,
            "must be a number of hours",
        )?);

        Ok(Self {
            core,
            location_regions,
            archive_after,
            tasks,
        })
    }

    /// Region map for cross-region submission.
    pub fn region_map(&self) -> StaticRegionMap {
        self.location_regions
            .iter()
            .fold(StaticRegionMap::new(&self.core.region), |map, (location, region)| {
                map.with_location(location, region)
            })
    }
}

fn hours(n: u64) -> Duration {
    Duration::from_secs(n * 3600)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
