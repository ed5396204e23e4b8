//! Delta baselines: the latest absolute counters of every VM.
use std::{sync::Arc, time::Duration};

use vmtraffic_common::model::{CurrentSample, VmKey};

use crate::store::{retry_once, timed, StoreError, TrafficStore};

#[derive(Clone)]
pub struct CurrentSnapshotStore {
    store: Arc<dyn TrafficStore>,
    timeout: Duration,
}

impl CurrentSnapshotStore {
    pub fn new(store: Arc<dyn TrafficStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn get(&self, vm_key: &VmKey) -> Result<Option<CurrentSample>, StoreError> {
        retry_once("snapshot read", true, || {
            timed(self.timeout, self.store.get_current(vm_key))
        })
        .await
    }

    /// Replace the baseline of a VM. Replacing is idempotent, so a timed out
    /// write is retried too.
    pub async fn put(&self, sample: &CurrentSample) -> Result<(), StoreError> {
        retry_once("snapshot write", true, || {
            timed(self.timeout, self.store.put_current(sample))
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<CurrentSample>, StoreError> {
        retry_once("snapshot listing", true, || {
            timed(self.timeout, self.store.list_current())
        })
        .await
    }
}
