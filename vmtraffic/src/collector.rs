//! Polling rounds: counters in, deltas and buckets out.
//!
//! A round walks every connected hypervisor, polls each running guest with at
//! most `per_connection_limit` reads in flight per connection, and turns each
//! reading into a delta against the stored baseline. A guest that cannot be
//! read, or whose result cannot be stored, is only dropped for this round.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{future::join_all, stream, StreamExt};
use pve_api::{ConnectionInfo, ConnectionRegistry, CounterSource, SourceError, VmInfo};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use vmtraffic_common::{
    delta::{compute_delta, sum_counters, DeltaKind},
    model::{CurrentSample, TrafficDelta, VmIdentity, VmKey},
};

use crate::{
    aggregator::{AppliedBuckets, BucketAggregator},
    snapshot::CurrentSnapshotStore,
    store::StoreError,
};

#[derive(Debug, Error)]
pub enum CollectError {
    /// Connection down, guest gone, request timed out...
    #[error(transparent)]
    Source(SourceError),

    /// The hypervisor answered without usable counters.
    #[error("counters missing: {0}")]
    DataMissing(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl From<SourceError> for CollectError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::DataMissing(reason) => Self::DataMissing(reason),
            e => Self::Source(e),
        }
    }
}

/// Result of one successful collection.
#[derive(Clone, Debug)]
pub struct DeltaResult {
    pub identity: VmIdentity,
    pub delta: TrafficDelta,
    pub kind: DeltaKind,
    pub timestamp: DateTime<Utc>,
    pub buckets: AppliedBuckets,
}

/// Last delta of a VM, kept in memory for rate estimates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RecentDelta {
    pub delta: TrafficDelta,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RecentDeltas(DashMap<VmKey, RecentDelta>);

impl RecentDeltas {
    pub fn get(&self, vm_key: &VmKey) -> Option<RecentDelta> {
        self.0.get(vm_key).map(|entry| *entry)
    }

    pub fn record(&self, vm_key: VmKey, delta: TrafficDelta, at: DateTime<Utc>) {
        self.0.insert(vm_key, RecentDelta { delta, at });
    }

    pub fn forget_connection(&self, connection_id: &str) {
        let prefix = format!("{connection_id}-");

        self.0.retain(|vm_key, _| !vm_key.as_str().starts_with(&prefix));
    }

    pub fn clear(&self) {
        self.0.clear();
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CollectorSettings {
    /// Maximum counter reads in flight per connection.
    pub per_connection_limit: usize,
    /// Timeout of every hypervisor request.
    pub read_timeout: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            per_connection_limit: 5,
            read_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionOutcome {
    /// Delta computed and aggregated.
    Collected,
    /// First observation, baseline stored.
    Seeded,
    /// Counters went backwards, baseline lowered.
    Reset,
    /// Counters missing or malformed, aggregated as a zero delta.
    DataMissing,
    /// Source unavailable or counters missing.
    Skipped,
    /// Storage failed after retry.
    Errored,
}

#[derive(Clone, Debug, Serialize)]
pub struct VmCollection {
    pub identity: VmIdentity,
    pub name: Box<str>,
    pub outcome: CollectionOutcome,
    pub delta: Option<TrafficDelta>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoundSummary {
    pub started_at: DateTime<Utc>,
    pub collected: usize,
    pub skipped: usize,
    pub errored: usize,
    /// Connected hypervisors whose inventory could not be listed.
    pub failed_connections: Vec<Box<str>>,
    pub vms: Vec<VmCollection>,
}

impl RoundSummary {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            collected: 0,
            skipped: 0,
            errored: 0,
            failed_connections: vec![],
            vms: vec![],
        }
    }

    fn push(&mut self, vm: VmCollection) {
        match vm.outcome {
            CollectionOutcome::Collected
            | CollectionOutcome::Seeded
            | CollectionOutcome::Reset
            | CollectionOutcome::DataMissing => self.collected += 1,
            CollectionOutcome::Skipped => self.skipped += 1,
            CollectionOutcome::Errored => self.errored += 1,
        }

        self.vms.push(vm);
    }
}

#[derive(Clone)]
pub struct SampleCollector {
    source: Arc<dyn CounterSource>,
    snapshots: CurrentSnapshotStore,
    aggregator: BucketAggregator,
    recent: Arc<RecentDeltas>,
    settings: CollectorSettings,
}

impl SampleCollector {
    pub fn new(
        source: Arc<dyn CounterSource>,
        snapshots: CurrentSnapshotStore,
        aggregator: BucketAggregator,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            source,
            snapshots,
            aggregator,
            recent: Default::default(),
            settings,
        }
    }

    pub fn recent(&self) -> Arc<RecentDeltas> {
        Arc::clone(&self.recent)
    }

    /// Poll one guest: read, compute the delta, store the new baseline, then
    /// aggregate.
    ///
    /// The baseline is written before the buckets. If aggregation then fails,
    /// the delta is lost (under-count) rather than counted twice.
    pub async fn collect(
        &self,
        connection_id: &str,
        vm: &VmInfo,
        now: DateTime<Utc>,
    ) -> Result<DeltaResult, CollectError> {
        let identity = VmIdentity::new(connection_id, &vm.node, vm.vmid);
        let vm_key = identity.vm_key();

        let counters = tokio::time::timeout(
            self.settings.read_timeout,
            self.source
                .read_counters(connection_id, &vm.node, vm.vmid, vm.kind),
        )
        .await
        .map_err(|_| SourceError::Timeout(self.settings.read_timeout))??;

        let reading = sum_counters(counters.iter().map(|(name, value)| (name.as_str(), *value)))
            .map_err(|e| CollectError::DataMissing(e.to_string()))?;

        let previous = self.snapshots.get(&vm_key).await?;
        let computed = compute_delta(previous.as_ref(), reading, now);

        if computed.kind == DeltaKind::Reset {
            debug!(
                "{identity}: counter reset ({} -> {} in, {} -> {} out)",
                previous.as_ref().map_or(0, |p| p.netin),
                reading.netin,
                previous.as_ref().map_or(0, |p| p.netout),
                reading.netout
            );
        }

        self.snapshots
            .put(&CurrentSample::new(identity.clone(), reading, computed.timestamp))
            .await?;

        let buckets = self
            .aggregator
            .apply_delta(&identity, &computed.delta, computed.timestamp)
            .await?;

        self.recent
            .record(vm_key, computed.delta, computed.timestamp);

        Ok(DeltaResult {
            identity,
            delta: computed.delta,
            kind: computed.kind,
            timestamp: computed.timestamp,
            buckets,
        })
    }

    /// Aggregate a zero delta for a guest whose counters are unusable. The
    /// baseline is left untouched, so the next good reading covers the gap.
    async fn collect_missing(
        &self,
        identity: &VmIdentity,
        now: DateTime<Utc>,
    ) -> Result<TrafficDelta, StoreError> {
        let delta = TrafficDelta::zero(Duration::ZERO);

        self.aggregator.apply_delta(identity, &delta, now).await?;

        Ok(delta)
    }

    /// Run one polling round over every connected hypervisor.
    ///
    /// Fails only if the connection list itself cannot be read.
    pub async fn collect_round(
        &self,
        registry: &dyn ConnectionRegistry,
        now: DateTime<Utc>,
    ) -> Result<RoundSummary, SourceError> {
        let connections = tokio::time::timeout(self.settings.read_timeout, registry.list_connections())
            .await
            .map_err(|_| SourceError::Timeout(self.settings.read_timeout))??;

        let results = join_all(
            connections
                .iter()
                .filter(|connection| connection.is_connected())
                .map(|connection| self.collect_connection(registry, connection, now)),
        )
        .await;

        let mut summary = RoundSummary::new(now);

        for (connection, result) in results {
            match result {
                Ok(vms) => vms.into_iter().for_each(|vm| summary.push(vm)),
                Err(e) => {
                    warn!("Unable to list guests of {connection}: {e}");
                    summary.failed_connections.push(connection);
                }
            }
        }

        summary
            .vms
            .sort_by(|a, b| a.identity.cmp(&b.identity));

        info!(
            "Round done: {} collected, {} skipped, {} errored, {} connection(s) failed",
            summary.collected,
            summary.skipped,
            summary.errored,
            summary.failed_connections.len()
        );

        Ok(summary)
    }

    async fn collect_connection(
        &self,
        registry: &dyn ConnectionRegistry,
        connection: &ConnectionInfo,
        now: DateTime<Utc>,
    ) -> (Box<str>, Result<Vec<VmCollection>, SourceError>) {
        let connection_id: &str = &connection.id;

        let vms = match tokio::time::timeout(
            self.settings.read_timeout,
            registry.list_vms(connection_id),
        )
        .await
        {
            Ok(Ok(vms)) => vms,
            Ok(Err(e)) => return (connection.id.clone(), Err(e)),
            Err(_) => {
                return (
                    connection.id.clone(),
                    Err(SourceError::Timeout(self.settings.read_timeout)),
                )
            }
        };

        let collections: Vec<VmCollection> = stream::iter(vms.into_iter().filter(VmInfo::is_running))
            .map(move |vm| self.collect_one(connection_id, vm, now))
            .buffer_unordered(self.settings.per_connection_limit.max(1))
            .collect()
            .await;

        (connection.id.clone(), Ok(collections))
    }

    async fn collect_one(&self, connection_id: &str, vm: VmInfo, now: DateTime<Utc>) -> VmCollection {
        let result = self.collect(connection_id, &vm, now).await;
        let identity = VmIdentity::new(connection_id, &vm.node, vm.vmid);

        let (outcome, delta, error) = match result {
            Ok(result) => {
                let outcome = match result.kind {
                    DeltaKind::Seeded => CollectionOutcome::Seeded,
                    DeltaKind::Increment => CollectionOutcome::Collected,
                    DeltaKind::Reset => CollectionOutcome::Reset,
                };

                (outcome, Some(result.delta), None)
            }
            Err(CollectError::DataMissing(reason)) => {
                warn!("{identity} ({}): {reason}, counted as no traffic", vm.name);

                match self.collect_missing(&identity, now).await {
                    Ok(delta) => (CollectionOutcome::DataMissing, Some(delta), Some(reason)),
                    Err(e) => {
                        error!("{identity} ({}): {e}, sample dropped", vm.name);
                        (CollectionOutcome::Errored, None, Some(e.to_string()))
                    }
                }
            }
            Err(CollectError::Source(e)) => {
                warn!("{identity} ({}): {e}, skipped", vm.name);
                (CollectionOutcome::Skipped, None, Some(e.to_string()))
            }
            Err(CollectError::Storage(e)) => {
                error!("{identity} ({}): {e}, sample dropped", vm.name);
                (CollectionOutcome::Errored, None, Some(e.to_string()))
            }
        };

        VmCollection {
            identity,
            name: vm.name,
            outcome,
            delta,
            error,
        }
    }
}
