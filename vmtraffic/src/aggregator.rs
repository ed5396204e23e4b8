//! Rolling deltas into hour and day buckets.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use vmtraffic_common::{
    model::{TrafficBucket, TrafficDelta, VmIdentity},
    timekey::Granularity,
};

use crate::store::{retry_once, timed, StoreError, TrafficStore};

/// Buckets as stored right after a delta was applied.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct AppliedBuckets {
    pub hour: TrafficBucket,
    pub day: TrafficBucket,
}

#[derive(Clone)]
pub struct BucketAggregator {
    store: Arc<dyn TrafficStore>,
    timeout: Duration,
}

impl BucketAggregator {
    pub fn new(store: Arc<dyn TrafficStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Add `delta` to the hour and day buckets containing `now`.
    ///
    /// Each bucket goes through a single storage-side upsert. The hour bucket
    /// is applied first; if the day upsert then fails, the hour keeps the
    /// delta and the error is returned.
    pub async fn apply_delta(
        &self,
        identity: &VmIdentity,
        delta: &TrafficDelta,
        now: DateTime<Utc>,
    ) -> Result<AppliedBuckets, StoreError> {
        let hour = self.upsert(Granularity::Hour, identity, delta, now).await?;
        let day = self.upsert(Granularity::Day, identity, delta, now).await?;

        debug!(
            "{identity}: +{} bytes, hour {} now {} ({} collections)",
            delta.total, hour.key, hour.total, hour.collections
        );

        Ok(AppliedBuckets { hour, day })
    }

    async fn upsert(
        &self,
        granularity: Granularity,
        identity: &VmIdentity,
        delta: &TrafficDelta,
        now: DateTime<Utc>,
    ) -> Result<TrafficBucket, StoreError> {
        let key = granularity.key_of(now);

        retry_once("bucket upsert", false, || {
            timed(
                self.timeout,
                self.store.upsert_bucket(granularity, &key, identity, delta, now),
            )
        })
        .await
    }
}
