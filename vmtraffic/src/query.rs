//! Read side: current samples, buckets, histories and the dashboard view.
//!
//! [QueryFacade] never writes. With a [LiveView] the dashboard lists the
//! hypervisor inventories and uses in-memory recent deltas for rates; without
//! it (e.g. reading a database from another process) the inventory is the set
//! of stored current samples.
use std::{
    cmp::Reverse,
    collections::HashMap,
    iter::FusedIterator,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use pve_api::ConnectionRegistry;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use vmtraffic_common::{
    model::{sort_by_usage, CurrentSample, TrafficBucket, VmIdentity},
    timekey::{self, Granularity, HourKeys},
};

use crate::{
    collector::RecentDeltas,
    store::{StoreError, TrafficStore},
};

const GIB: u64 = 1 << 30;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid {0} key `{1}`")]
    InvalidKey(Granularity, Box<str>),

    #[error("a history of {0} hours is out of range")]
    HistoryTooLong(usize),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug)]
pub struct DashboardSettings {
    pub poll_interval: Duration,
    /// A recent delta older than this is not used for rates.
    pub freshness: Duration,
    pub warn_bytes: u64,
    pub critical_bytes: u64,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            freshness: Duration::from_secs(60),
            warn_bytes: GIB,
            critical_bytes: 10 * GIB,
        }
    }
}

/// Live inventory and in-memory deltas of a running collector.
#[derive(Clone)]
pub struct LiveView {
    pub registry: Arc<dyn ConnectionRegistry>,
    pub recent: Arc<RecentDeltas>,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    /// Last polled delta over the poll interval.
    Recent,
    /// Current hour total over the elapsed part of the hour.
    HourAverage,
    /// No data this hour.
    None,
}

#[derive(Clone, Debug, Serialize)]
pub struct DashboardRow {
    pub identity: VmIdentity,
    pub name: Option<Box<str>>,
    pub status: Option<Box<str>>,
    pub netin: u64,
    pub netout: u64,
    pub total: u64,
    /// Estimated bytes per second.
    pub rate: f64,
    pub rate_source: RateSource,
    pub alert: Option<AlertLevel>,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Serialize)]
pub struct DashboardTotals {
    pub vms: usize,
    pub netin: u64,
    pub netout: u64,
    pub total: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub identity: VmIdentity,
    pub level: AlertLevel,
    pub total: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct DashboardSnapshot {
    pub generated_at: DateTime<Utc>,
    pub hour: String,
    /// Heaviest consumers first.
    pub vms: Vec<DashboardRow>,
    pub totals: DashboardTotals,
    /// Critical alerts first, then by total.
    pub alerts: Vec<Alert>,
}

/// Consecutive hour buckets of one VM, oldest first, zero-filled.
///
/// Consuming: once walked, a history cannot be restarted.
#[derive(Debug)]
pub struct HistoryIter {
    identity: VmIdentity,
    keys: HourKeys,
    found: HashMap<Box<str>, TrafficBucket>,
}

impl Iterator for HistoryIter {
    type Item = TrafficBucket;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.keys.next()?;

        Some(
            self.found
                .remove(key.as_str())
                .unwrap_or_else(|| TrafficBucket::empty(self.identity.clone(), Granularity::Hour, &key)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.keys.size_hint()
    }
}

impl ExactSizeIterator for HistoryIter {}
impl FusedIterator for HistoryIter {}

#[derive(Clone)]
pub struct QueryFacade {
    store: Arc<dyn TrafficStore>,
    live: Option<LiveView>,
    settings: DashboardSettings,
    clock: fn() -> DateTime<Utc>,
}

impl QueryFacade {
    pub fn new(store: Arc<dyn TrafficStore>, settings: DashboardSettings) -> Self {
        Self {
            store,
            live: None,
            settings,
            clock: Utc::now,
        }
    }

    pub fn with_live_view(mut self, live: LiveView) -> Self {
        self.live = Some(live);
        self
    }

    /// Replace the wall clock used for default keys and the dashboard.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    fn checked_key(
        &self,
        granularity: Granularity,
        key: Option<&str>,
    ) -> Result<String, QueryError> {
        match key {
            Some(key) if granularity.is_valid_key(key) => Ok(key.to_string()),
            Some(key) => Err(QueryError::InvalidKey(granularity, key.into())),
            None => Ok(granularity.key_of((self.clock)())),
        }
    }

    pub async fn current_of(&self, identity: &VmIdentity) -> Result<Option<CurrentSample>, QueryError> {
        Ok(self.store.get_current(&identity.vm_key()).await?)
    }

    /// Hour bucket of a VM, the current hour by default.
    pub async fn hourly_of(
        &self,
        identity: &VmIdentity,
        hour: Option<&str>,
    ) -> Result<Option<TrafficBucket>, QueryError> {
        let key = self.checked_key(Granularity::Hour, hour)?;

        Ok(self
            .store
            .get_bucket(Granularity::Hour, &identity.vm_key(), &key)
            .await?)
    }

    /// Day bucket of a VM, today by default.
    pub async fn daily_of(
        &self,
        identity: &VmIdentity,
        day: Option<&str>,
    ) -> Result<Option<TrafficBucket>, QueryError> {
        let key = self.checked_key(Granularity::Day, day)?;

        Ok(self
            .store
            .get_bucket(Granularity::Day, &identity.vm_key(), &key)
            .await?)
    }

    /// The `hours` hours ending with the current one, whether the VM has data
    /// or not.
    pub async fn history_of(
        &self,
        identity: &VmIdentity,
        hours: usize,
    ) -> Result<HistoryIter, QueryError> {
        let keys = timekey::hours_ending_at((self.clock)(), hours)
            .ok_or(QueryError::HistoryTooLong(hours))?;

        let found = match (keys.first_key(), keys.last_key()) {
            (Some(from), Some(to)) => self
                .store
                .buckets_in_range(Granularity::Hour, &identity.vm_key(), &from, &to)
                .await?
                .into_iter()
                .map(|bucket| (bucket.key.clone(), bucket))
                .collect(),
            _ => HashMap::new(),
        };

        Ok(HistoryIter {
            identity: identity.clone(),
            keys,
            found,
        })
    }

    /// Every VM's bucket for one hour (current by default), heaviest first.
    pub async fn all_hourly(&self, hour: Option<&str>) -> Result<Vec<TrafficBucket>, QueryError> {
        self.all_for_key(Granularity::Hour, hour).await
    }

    /// Every VM's bucket for one day (today by default), heaviest first.
    pub async fn all_daily(&self, day: Option<&str>) -> Result<Vec<TrafficBucket>, QueryError> {
        self.all_for_key(Granularity::Day, day).await
    }

    async fn all_for_key(
        &self,
        granularity: Granularity,
        key: Option<&str>,
    ) -> Result<Vec<TrafficBucket>, QueryError> {
        let key = self.checked_key(granularity, key)?;
        let mut buckets = self.store.buckets_for_key(granularity, &key).await?;

        sort_by_usage(&mut buckets);

        Ok(buckets)
    }

    fn alert_level(&self, total: u64) -> Option<AlertLevel> {
        if total > self.settings.critical_bytes {
            Some(AlertLevel::Critical)
        } else if total > self.settings.warn_bytes {
            Some(AlertLevel::Warning)
        } else {
            None
        }
    }

    /// Inventory rows: identity, name and status.
    async fn inventory(&self) -> Result<Vec<(VmIdentity, Option<Box<str>>, Option<Box<str>>)>, QueryError> {
        if let Some(live) = &self.live {
            match live.registry.list_connections().await {
                Ok(connections) => {
                    let mut rows = vec![];

                    for connection in connections.iter().filter(|c| c.is_connected()) {
                        match live.registry.list_vms(&connection.id).await {
                            Ok(vms) => rows.extend(vms.into_iter().map(|vm| {
                                (
                                    VmIdentity::new(&connection.id, &vm.node, vm.vmid),
                                    Some(vm.name),
                                    Some(vm.status),
                                )
                            })),
                            Err(e) => warn!("Dashboard: unable to list guests of {}: {e}", connection.id),
                        }
                    }

                    return Ok(rows);
                }
                Err(e) => warn!("Dashboard: unable to list connections, using stored samples: {e}"),
            }
        }

        Ok(self
            .store
            .list_current()
            .await?
            .into_iter()
            .map(|sample| (sample.identity, None, None))
            .collect())
    }

    /// Inventory joined with current hour buckets, with rate estimates and
    /// threshold alerts.
    pub async fn dashboard_snapshot(&self) -> Result<DashboardSnapshot, QueryError> {
        let now = (self.clock)();
        let hour = timekey::hour_key(now);
        let elapsed = timekey::seconds_into_hour(now) as f64;
        let poll_secs = self.settings.poll_interval.as_secs_f64().max(1.0);

        let mut buckets: HashMap<_, _> = self
            .store
            .buckets_for_key(Granularity::Hour, &hour)
            .await?
            .into_iter()
            .map(|bucket| (bucket.vm_key(), bucket))
            .collect();

        let mut rows: Vec<DashboardRow> = self
            .inventory()
            .await?
            .into_iter()
            .map(|(identity, name, status)| {
                let vm_key = identity.vm_key();
                let bucket = buckets.remove(&vm_key);
                let (netin, netout, total) = bucket
                    .as_ref()
                    .map_or((0, 0, 0), |b| (b.netin, b.netout, b.total));

                let recent = self.live.as_ref().and_then(|live| live.recent.get(&vm_key)).filter(|recent| {
                    (now - recent.at)
                        .to_std()
                        .map_or(true, |age| age <= self.settings.freshness)
                });

                let (rate, rate_source) = match (recent, &bucket) {
                    (Some(recent), _) => (recent.delta.total as f64 / poll_secs, RateSource::Recent),
                    (None, Some(bucket)) => (bucket.total as f64 / elapsed, RateSource::HourAverage),
                    (None, None) => (0.0, RateSource::None),
                };

                DashboardRow {
                    identity,
                    name,
                    status,
                    netin,
                    netout,
                    total,
                    rate,
                    rate_source,
                    alert: self.alert_level(total),
                }
            })
            .collect();

        rows.sort_by(|a, b| {
            b.total
                .cmp(&a.total)
                .then_with(|| a.identity.vm_key().cmp(&b.identity.vm_key()))
        });

        let totals = rows.iter().fold(
            DashboardTotals {
                vms: rows.len(),
                ..Default::default()
            },
            |mut totals, row| {
                totals.netin = totals.netin.saturating_add(row.netin);
                totals.netout = totals.netout.saturating_add(row.netout);
                totals.total = totals.total.saturating_add(row.total);
                totals
            },
        );

        let mut alerts: Vec<Alert> = rows
            .iter()
            .filter_map(|row| {
                row.alert.map(|level| Alert {
                    identity: row.identity.clone(),
                    level,
                    total: row.total,
                })
            })
            .collect();

        alerts.sort_by_key(|alert| (Reverse(alert.level), Reverse(alert.total), alert.identity.vm_key()));

        Ok(DashboardSnapshot {
            generated_at: now,
            hour,
            vms: rows,
            totals,
            alerts,
        })
    }
}
