//! Traffic storage.
//!
//! Three logical tables: the current sample of every VM (delta baseline), and
//! the hour and day buckets. [TrafficStore] is implemented by
//! [memory::MemoryStore] and by the SQLite backed [sqlite::SqliteStore]; the
//! rest of the crate only talks to the trait.
//!
//! Buckets are only ever mutated through [TrafficStore::upsert_bucket], which
//! must create-or-increment atomically.
pub mod memory;
mod migrations;
pub mod sqlite;


use std::{collections::HashSet, future::Future, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use vmtraffic_common::{
    model::{CurrentSample, TrafficBucket, TrafficDelta, VmIdentity, VmKey},
    timekey::Granularity,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid stored row: {0}")]
    InvalidRow(String),
}

/// Rows removed by a purge, per table.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Serialize)]
pub struct PurgeCounts {
    pub current: u64,
    pub hourly: u64,
    pub daily: u64,
}

impl PurgeCounts {
    pub fn total(&self) -> u64 {
        self.current + self.hourly + self.daily
    }
}

#[async_trait]
pub trait TrafficStore: Send + Sync {
    async fn get_current(&self, vm_key: &VmKey) -> Result<Option<CurrentSample>, StoreError>;

    /// Insert or replace the current sample of a VM.
    async fn put_current(&self, sample: &CurrentSample) -> Result<(), StoreError>;

    async fn list_current(&self) -> Result<Vec<CurrentSample>, StoreError>;

    /// Add `delta` to the bucket `key` of `identity`, creating it if needed.
    /// Returns the bucket as stored after the increment.
    async fn upsert_bucket(
        &self,
        granularity: Granularity,
        key: &str,
        identity: &VmIdentity,
        delta: &TrafficDelta,
        now: DateTime<Utc>,
    ) -> Result<TrafficBucket, StoreError>;

    async fn get_bucket(
        &self,
        granularity: Granularity,
        vm_key: &VmKey,
        key: &str,
    ) -> Result<Option<TrafficBucket>, StoreError>;

    /// Buckets of every VM for one time key, unordered.
    async fn buckets_for_key(
        &self,
        granularity: Granularity,
        key: &str,
    ) -> Result<Vec<TrafficBucket>, StoreError>;

    /// Buckets of a VM with `from <= key <= to`, oldest first.
    async fn buckets_in_range(
        &self,
        granularity: Granularity,
        vm_key: &VmKey,
        from: &str,
        to: &str,
    ) -> Result<Vec<TrafficBucket>, StoreError>;

    /// Buckets of a VM whose key starts with `prefix` (e.g. every hour of a day), oldest first.
    async fn buckets_with_prefix(
        &self,
        granularity: Granularity,
        vm_key: &VmKey,
        prefix: &str,
    ) -> Result<Vec<TrafficBucket>, StoreError>;

    /// Delete every bucket with a key strictly lower than `key`.
    async fn delete_buckets_before(
        &self,
        granularity: Granularity,
        key: &str,
    ) -> Result<u64, StoreError>;

    /// Delete, in one transaction, every row whose VM is not in `live`.
    async fn delete_orphans(&self, live: &HashSet<VmKey>) -> Result<PurgeCounts, StoreError>;

    /// Delete, in one transaction, every row of a connection.
    async fn delete_connection(&self, connection_id: &str) -> Result<PurgeCounts, StoreError>;

    async fn delete_all(&self) -> Result<PurgeCounts, StoreError>;

    /// Every VM with at least one stored row.
    async fn known_identities(&self) -> Result<Vec<VmIdentity>, StoreError>;
}

/// Bound a storage operation in time.
pub async fn timed<T, F>(limit: Duration, operation: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

/// Run a storage operation, retrying it once right away if it fails.
///
/// A timed out operation is not retried when `idempotent` is false, as it may
/// have been applied anyway.
pub async fn retry_once<T, F, Fut>(
    what: &str,
    idempotent: bool,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match operation().await {
        Ok(value) => Ok(value),
        Err(e @ StoreError::Timeout(_)) if !idempotent => Err(e),
        Err(e) => {
            tracing::warn!("{what} failed ({e}), retrying");
            operation().await
        }
    }
}
