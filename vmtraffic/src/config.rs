//! Daemon configuration, read from a JSON file.
//!
//! Every field is optional, missing ones take their default value:
//!
//! ```json
//! {
//!   "database": "/var/lib/vmtraffic/traffic.db",
//!   "polling": { "interval_secs": 30, "per_connection_limit": 5 },
//!   "retention": { "days": 30 },
//!   "dashboard": { "warn_bytes": 1073741824 },
//!   "connections": [
//!     { "id": "pve1", "url": "https://pve1:8006", "token_id": "traffic@pve!collector", "token_secret": "..." }
//!   ]
//! }
//! ```
use std::{path::{Path, PathBuf}, time::Duration};

use anyhow::{bail, Context};
use pve_api::http::ProxmoxConnection;
use serde::{Deserialize, Serialize};

use crate::{collector::CollectorSettings, query::DashboardSettings};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollingConfig {
    pub interval_secs: u64,
    pub per_connection_limit: usize,
    pub source_timeout_secs: u64,
    pub storage_timeout_secs: u64,
    /// Time given to in-flight polls on shutdown.
    pub shutdown_grace_secs: u64,
    /// Interval between two connection status probes.
    pub registry_refresh_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            per_connection_limit: 5,
            source_timeout_secs: 20,
            storage_timeout_secs: 5,
            shutdown_grace_secs: 10,
            registry_refresh_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    pub days: u32,
    pub sweep_interval_secs: u64,
    pub orphan_sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 30,
            sweep_interval_secs: 24 * 3600,
            orphan_sweep_interval_secs: 3600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DashboardConfig {
    /// Defaults to twice the polling interval.
    pub freshness_secs: Option<u64>,
    pub warn_bytes: u64,
    pub critical_bytes: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        let defaults = DashboardSettings::default();

        Self {
            freshness_secs: None,
            warn_bytes: defaults.warn_bytes,
            critical_bytes: defaults.critical_bytes,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: PathBuf,
    pub polling: PollingConfig,
    pub retention: RetentionConfig,
    pub dashboard: DashboardConfig,
    pub connections: Vec<ProxmoxConnection>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("/var/lib/vmtraffic/traffic.db"),
            polling: Default::default(),
            retention: Default::default(),
            dashboard: Default::default(),
            connections: vec![],
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read {}", path.display()))?;

        Self::parse(&raw).with_context(|| format!("Invalid configuration {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let polling = &self.polling;

        if !(5..=30).contains(&polling.interval_secs) {
            bail!(
                "polling.interval_secs must be between 5 and 30 (got {})",
                polling.interval_secs
            );
        }

        if polling.per_connection_limit == 0 {
            bail!("polling.per_connection_limit must be at least 1");
        }

        if polling.source_timeout_secs == 0 || polling.storage_timeout_secs == 0 {
            bail!("timeouts must be at least one second");
        }

        if self.retention.days == 0 {
            bail!("retention.days must be at least 1");
        }

        if self.retention.sweep_interval_secs == 0 || self.retention.orphan_sweep_interval_secs == 0 {
            bail!("retention sweep intervals must be at least one second");
        }

        if self.dashboard.warn_bytes >= self.dashboard.critical_bytes {
            bail!("dashboard.warn_bytes must be lower than dashboard.critical_bytes");
        }

        let mut ids: Vec<&str> = self.connections.iter().map(|c| c.id.as_ref()).collect();
        ids.sort_unstable();

        if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
            bail!("duplicated connection id `{}`", pair[0]);
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_secs)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.polling.source_timeout_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.polling.storage_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.polling.shutdown_grace_secs)
    }

    pub fn registry_refresh(&self) -> Duration {
        Duration::from_secs(self.polling.registry_refresh_secs.max(1))
    }

    pub fn retention_sweep(&self) -> Duration {
        Duration::from_secs(self.retention.sweep_interval_secs)
    }

    pub fn orphan_sweep(&self) -> Duration {
        Duration::from_secs(self.retention.orphan_sweep_interval_secs)
    }

    pub fn collector_settings(&self) -> CollectorSettings {
        CollectorSettings {
            per_connection_limit: self.polling.per_connection_limit,
            read_timeout: self.source_timeout(),
        }
    }

    pub fn dashboard_settings(&self) -> DashboardSettings {
        DashboardSettings {
            poll_interval: self.poll_interval(),
            freshness: self
                .dashboard
                .freshness_secs
                .map_or(2 * self.poll_interval(), Duration::from_secs),
            warn_bytes: self.dashboard.warn_bytes,
            critical_bytes: self.dashboard.critical_bytes,
        }
    }
}
