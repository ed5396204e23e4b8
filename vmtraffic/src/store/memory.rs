//! In-memory [TrafficStore], for tests and runs without a database.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use vmtraffic_common::{
    model::{CurrentSample, TrafficBucket, TrafficDelta, VmIdentity, VmKey},
    timekey::Granularity,
};

use super::{PurgeCounts, StoreError, TrafficStore};

/// Buckets of one granularity, ordered by VM then time key.
type BucketTable = BTreeMap<(VmKey, Box<str>), TrafficBucket>;

#[derive(Debug, Default)]
struct Tables {
    current: HashMap<VmKey, CurrentSample>,
    hourly: BucketTable,
    daily: BucketTable,
}

impl Tables {
    fn buckets(&self, granularity: Granularity) -> &BucketTable {
        match granularity {
            Granularity::Hour => &self.hourly,
            Granularity::Day => &self.daily,
        }
    }

    fn buckets_mut(&mut self, granularity: Granularity) -> &mut BucketTable {
        match granularity {
            Granularity::Hour => &mut self.hourly,
            Granularity::Day => &mut self.daily,
        }
    }

    /// Remove every row matching `doomed`, returning per table counts.
    fn purge(&mut self, doomed: impl Fn(&VmIdentity) -> bool) -> PurgeCounts {
        let mut counts = PurgeCounts::default();

        self.current.retain(|_, sample| {
            let purge = doomed(&sample.identity);
            counts.current += purge as u64;
            !purge
        });

        self.hourly.retain(|_, bucket| {
            let purge = doomed(&bucket.identity);
            counts.hourly += purge as u64;
            !purge
        });

        self.daily.retain(|_, bucket| {
            let purge = doomed(&bucket.identity);
            counts.daily += purge as u64;
            !purge
        });

        counts
    }
}

/// Every operation holds the table lock for its whole duration, which makes
/// upserts and multi-table deletes atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrafficStore for MemoryStore {
    async fn get_current(&self, vm_key: &VmKey) -> Result<Option<CurrentSample>, StoreError> {
        Ok(self.tables.read().await.current.get(vm_key).cloned())
    }

    async fn put_current(&self, sample: &CurrentSample) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .current
            .insert(sample.vm_key(), sample.clone());

        Ok(())
    }

    async fn list_current(&self) -> Result<Vec<CurrentSample>, StoreError> {
        let tables = self.tables.read().await;
        let mut samples: Vec<CurrentSample> = tables.current.values().cloned().collect();

        samples.sort_by_key(|sample| sample.vm_key());

        Ok(samples)
    }

    async fn upsert_bucket(
        &self,
        granularity: Granularity,
        key: &str,
        identity: &VmIdentity,
        delta: &TrafficDelta,
        now: DateTime<Utc>,
    ) -> Result<TrafficBucket, StoreError> {
        let mut tables = self.tables.write().await;

        let bucket = tables
            .buckets_mut(granularity)
            .entry((identity.vm_key(), key.into()))
            .and_modify(|bucket| bucket.accumulate(delta, now))
            .or_insert_with(|| {
                TrafficBucket::seeded(identity.clone(), granularity, key, delta, now)
            });

        Ok(bucket.clone())
    }

    async fn get_bucket(
        &self,
        granularity: Granularity,
        vm_key: &VmKey,
        key: &str,
    ) -> Result<Option<TrafficBucket>, StoreError> {
        let tables = self.tables.read().await;

        Ok(tables
            .buckets(granularity)
            .get(&(vm_key.clone(), key.into()))
            .cloned())
    }

    async fn buckets_for_key(
        &self,
        granularity: Granularity,
        key: &str,
    ) -> Result<Vec<TrafficBucket>, StoreError> {
        let tables = self.tables.read().await;

        Ok(tables
            .buckets(granularity)
            .values()
            .filter(|bucket| bucket.key.as_ref() == key)
            .cloned()
            .collect())
    }

    async fn buckets_in_range(
        &self,
        granularity: Granularity,
        vm_key: &VmKey,
        from: &str,
        to: &str,
    ) -> Result<Vec<TrafficBucket>, StoreError> {
        if from > to {
            return Ok(vec![]);
        }

        let tables = self.tables.read().await;
        let range = (vm_key.clone(), Box::<str>::from(from))..=(vm_key.clone(), Box::<str>::from(to));

        Ok(tables
            .buckets(granularity)
            .range(range)
            .map(|(_, bucket)| bucket.clone())
            .collect())
    }

    async fn buckets_with_prefix(
        &self,
        granularity: Granularity,
        vm_key: &VmKey,
        prefix: &str,
    ) -> Result<Vec<TrafficBucket>, StoreError> {
        let tables = self.tables.read().await;

        Ok(tables
            .buckets(granularity)
            .range((vm_key.clone(), Box::<str>::from(prefix))..)
            .take_while(|((key, time_key), _)| key == vm_key && time_key.starts_with(prefix))
            .map(|(_, bucket)| bucket.clone())
            .collect())
    }

    async fn delete_buckets_before(
        &self,
        granularity: Granularity,
        key: &str,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let buckets = tables.buckets_mut(granularity);
        let before = buckets.len();

        buckets.retain(|(_, time_key), _| time_key.as_ref() >= key);

        Ok((before - buckets.len()) as u64)
    }

    async fn delete_orphans(&self, live: &HashSet<VmKey>) -> Result<PurgeCounts, StoreError> {
        let mut tables = self.tables.write().await;

        Ok(tables.purge(|identity| !live.contains(&identity.vm_key())))
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<PurgeCounts, StoreError> {
        let mut tables = self.tables.write().await;

        Ok(tables.purge(|identity| identity.connection_id.as_ref() == connection_id))
    }

    async fn delete_all(&self) -> Result<PurgeCounts, StoreError> {
        let mut tables = self.tables.write().await;

        Ok(tables.purge(|_| true))
    }

    async fn known_identities(&self) -> Result<Vec<VmIdentity>, StoreError> {
        let tables = self.tables.read().await;

        let identities: BTreeSet<VmIdentity> = tables
            .current
            .values()
            .map(|sample| &sample.identity)
            .chain(tables.hourly.values().map(|bucket| &bucket.identity))
            .chain(tables.daily.values().map(|bucket| &bucket.identity))
            .cloned()
            .collect();

        Ok(identities.into_iter().collect())
    }
}
