//! Age-based and orphan purges of stored traffic.
//!
//! Each purge kind is single-flight: an age purge requested while another age
//! purge is running (or an orphan purge while another orphan purge is running)
//! returns [PurgeOutcome::AlreadyRunning]. The two kinds never block each other.
use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use pve_api::ConnectionRegistry;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use vmtraffic_common::{
    model::{VmIdentity, VmKey},
    timekey::{self, Granularity},
};

use crate::store::{retry_once, timed, PurgeCounts, StoreError, TrafficStore};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "removed")]
pub enum PurgeOutcome {
    Done(PurgeCounts),
    AlreadyRunning,
}

pub struct RetentionManager {
    store: Arc<dyn TrafficStore>,
    timeout: Duration,
    age_purge: Mutex<()>,
    orphan_purge: Mutex<()>,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn TrafficStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            age_purge: Mutex::new(()),
            orphan_purge: Mutex::new(()),
        }
    }

    /// Delete every hour and day bucket older than `days` days.
    #[instrument(skip(self))]
    pub async fn purge_older_than(
        &self,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<PurgeOutcome, StoreError> {
        let Ok(_guard) = self.age_purge.try_lock() else {
            return Ok(PurgeOutcome::AlreadyRunning);
        };

        let (hour_cutoff, day_cutoff) = timekey::retention_cutoff(now, days);

        let hourly = retry_once("hourly retention", true, || {
            timed(
                self.timeout,
                self.store.delete_buckets_before(Granularity::Hour, &hour_cutoff),
            )
        })
        .await?;

        let daily = retry_once("daily retention", true, || {
            timed(
                self.timeout,
                self.store.delete_buckets_before(Granularity::Day, &day_cutoff),
            )
        })
        .await?;

        let counts = PurgeCounts {
            current: 0,
            hourly,
            daily,
        };

        info!(
            "Purged buckets older than {days} days: {hourly} hourly, {daily} daily (before {hour_cutoff})"
        );

        Ok(PurgeOutcome::Done(counts))
    }

    /// Delete every row of a VM outside `live`. An empty `live` set deletes
    /// everything.
    #[instrument(skip(self, live), fields(live = live.len()))]
    pub async fn purge_orphans(&self, live: &HashSet<VmKey>) -> Result<PurgeOutcome, StoreError> {
        let Ok(_guard) = self.orphan_purge.try_lock() else {
            return Ok(PurgeOutcome::AlreadyRunning);
        };

        let counts = retry_once("orphan purge", true, || {
            timed(self.timeout, self.store.delete_orphans(live))
        })
        .await?;

        if counts.total() > 0 {
            info!(
                "Purged orphans: {} current, {} hourly, {} daily",
                counts.current, counts.hourly, counts.daily
            );
        }

        Ok(PurgeOutcome::Done(counts))
    }

    /// Build the set of VMs whose data must be kept.
    ///
    /// It is the union of every listed inventory. A connection that is not
    /// connected, or whose inventory cannot be listed, keeps every VM already
    /// stored for it. Returns `None` if the connection list itself is
    /// unavailable, in which case nothing must be purged.
    pub async fn live_set(&self, registry: &dyn ConnectionRegistry) -> Option<HashSet<VmKey>> {
        let connections = match registry.list_connections().await {
            Ok(connections) => connections,
            Err(e) => {
                warn!("Unable to list connections, skipping orphan purge: {e}");
                return None;
            }
        };

        let mut live = HashSet::new();
        let mut preserved: HashSet<&str> = HashSet::new();

        for connection in &connections {
            if !connection.is_connected() {
                preserved.insert(&connection.id);
                continue;
            }

            match registry.list_vms(&connection.id).await {
                Ok(vms) => live.extend(
                    vms.iter()
                        .map(|vm| VmIdentity::new(&connection.id, &vm.node, vm.vmid).vm_key()),
                ),
                Err(e) => {
                    warn!("Unable to list guests of {}, keeping its data: {e}", connection.id);
                    preserved.insert(&connection.id);
                }
            }
        }

        if !preserved.is_empty() {
            let known = match retry_once("identity listing", true, || {
                timed(self.timeout, self.store.known_identities())
            })
            .await
            {
                Ok(known) => known,
                Err(e) => {
                    warn!("Unable to list stored VMs, skipping orphan purge: {e}");
                    return None;
                }
            };

            live.extend(
                known
                    .iter()
                    .filter(|identity| preserved.contains(identity.connection_id.as_ref()))
                    .map(|identity| identity.vm_key()),
            );
        }

        Some(live)
    }
}
