//! Full collection rounds against the mock hypervisor.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use maplit::hashmap;
use pve_api::{
    mock::{MockFailure, MockHypervisor},
    ConnectionStatus, CounterSource, VmInfo, VmKind,
};
use vmtraffic::{
    aggregator::BucketAggregator,
    collector::{CollectError, CollectionOutcome, CollectorSettings, SampleCollector},
    config::Config,
    query::{AlertLevel, DashboardSettings, QueryError, QueryFacade, RateSource},
    retention::{PurgeOutcome, RetentionManager},
    service::CollectorService,
    snapshot::CurrentSnapshotStore,
    store::{memory::MemoryStore, sqlite::SqliteStore, PurgeCounts, StoreError, TrafficStore},
};
use vmtraffic_common::{
    delta::DeltaKind,
    model::{CounterReading, CurrentSample, TrafficBucket, TrafficDelta, VmIdentity, VmKey},
    timekey::Granularity,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 7, 10, 0, 0).unwrap()
}

fn quarter_past_ten() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 7, 10, 15, 0).unwrap()
}

fn vm(node: &str, vmid: u32, name: &str) -> VmInfo {
    VmInfo {
        node: node.into(),
        vmid,
        name: name.into(),
        kind: VmKind::Qemu,
        status: "running".into(),
    }
}

fn collector(
    mock: &Arc<MockHypervisor>,
    store: &Arc<dyn TrafficStore>,
    per_connection_limit: usize,
) -> SampleCollector {
    SampleCollector::new(
        Arc::clone(mock) as Arc<dyn CounterSource>,
        CurrentSnapshotStore::new(Arc::clone(store), TIMEOUT),
        BucketAggregator::new(Arc::clone(store), TIMEOUT),
        CollectorSettings {
            per_connection_limit,
            read_timeout: TIMEOUT,
        },
    )
}

async fn backends() -> Vec<Arc<dyn TrafficStore>> {
    let memory: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());
    let sqlite: Arc<dyn TrafficStore> = Arc::new(SqliteStore::open_in_memory().await.unwrap());

    vec![memory, sqlite]
}

/// Store wrapper failing bucket upserts of one VM, with slow orphan deletes.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    failing: Mutex<Option<VmKey>>,
    delete_delay: Duration,
}

#[async_trait]
impl TrafficStore for FaultyStore {
    async fn get_current(&self, vm_key: &VmKey) -> Result<Option<CurrentSample>, StoreError> {
        self.inner.get_current(vm_key).await
    }

    async fn put_current(&self, sample: &CurrentSample) -> Result<(), StoreError> {
        self.inner.put_current(sample).await
    }

    async fn list_current(&self) -> Result<Vec<CurrentSample>, StoreError> {
        self.inner.list_current().await
    }

    async fn upsert_bucket(
        &self,
        granularity: Granularity,
        key: &str,
        identity: &VmIdentity,
        delta: &TrafficDelta,
        now: DateTime<Utc>,
    ) -> Result<TrafficBucket, StoreError> {
        if self.failing.lock().unwrap().as_ref() == Some(&identity.vm_key()) {
            return Err(StoreError::InvalidRow("disk full".into()));
        }

        self.inner
            .upsert_bucket(granularity, key, identity, delta, now)
            .await
    }

    async fn get_bucket(
        &self,
        granularity: Granularity,
        vm_key: &VmKey,
        key: &str,
    ) -> Result<Option<TrafficBucket>, StoreError> {
        self.inner.get_bucket(granularity, vm_key, key).await
    }

    async fn buckets_for_key(
        &self,
        granularity: Granularity,
        key: &str,
    ) -> Result<Vec<TrafficBucket>, StoreError> {
        self.inner.buckets_for_key(granularity, key).await
    }

    async fn buckets_in_range(
        &self,
        granularity: Granularity,
        vm_key: &VmKey,
        from: &str,
        to: &str,
    ) -> Result<Vec<TrafficBucket>, StoreError> {
        self.inner.buckets_in_range(granularity, vm_key, from, to).await
    }

    async fn buckets_with_prefix(
        &self,
        granularity: Granularity,
        vm_key: &VmKey,
        prefix: &str,
    ) -> Result<Vec<TrafficBucket>, StoreError> {
        self.inner
            .buckets_with_prefix(granularity, vm_key, prefix)
            .await
    }

    async fn delete_buckets_before(
        &self,
        granularity: Granularity,
        key: &str,
    ) -> Result<u64, StoreError> {
        self.inner.delete_buckets_before(granularity, key).await
    }

    async fn delete_orphans(&self, live: &HashSet<VmKey>) -> Result<PurgeCounts, StoreError> {
        tokio::time::sleep(self.delete_delay).await;
        self.inner.delete_orphans(live).await
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<PurgeCounts, StoreError> {
        self.inner.delete_connection(connection_id).await
    }

    async fn delete_all(&self) -> Result<PurgeCounts, StoreError> {
        self.inner.delete_all().await
    }

    async fn known_identities(&self) -> Result<Vec<VmIdentity>, StoreError> {
        self.inner.known_identities().await
    }
}

#[tokio::test]
async fn web01_scenario() {
    let web01 = vm("node1", 101, "web01");
    let identity = VmIdentity::new("pve1", "node1", 101);

    for store in backends().await {
        let mock = Arc::new(MockHypervisor::new());
        mock.add_connection("pve1", ConnectionStatus::Connected);
        mock.add_vm_info("pve1", web01.clone());

        let collector = collector(&mock, &store, 5);
        let seconds = |s: i64| t0() + chrono::Duration::seconds(s);

        mock.set_traffic("pve1", "node1", 101, 1000, 500);
        let first = collector.collect("pve1", &web01, seconds(0)).await.unwrap();
        assert_eq!(first.kind, DeltaKind::Seeded);
        assert!(first.delta.is_zero());

        mock.set_traffic("pve1", "node1", 101, 1500, 800);
        let second = collector.collect("pve1", &web01, seconds(30)).await.unwrap();
        assert_eq!((second.delta.netin, second.delta.netout, second.delta.total), (500, 300, 800));

        let hour = &second.buckets.hour;
        assert_eq!(hour.key.as_ref(), "2024-03-07-10");
        assert_eq!((hour.netin, hour.netout, hour.total, hour.collections), (500, 300, 800, 2));

        // Guest restarted: counters start over.
        mock.set_traffic("pve1", "node1", 101, 100, 50);
        let reset = collector.collect("pve1", &web01, seconds(60)).await.unwrap();
        assert_eq!(reset.kind, DeltaKind::Reset);
        assert!(reset.delta.is_zero());

        let baseline = store.get_current(&identity.vm_key()).await.unwrap().unwrap();
        assert_eq!(baseline.reading(), CounterReading::new(100, 50));
        assert_eq!(baseline.timestamp, seconds(60));

        mock.set_traffic("pve1", "node1", 101, 300, 120);
        let after = collector.collect("pve1", &web01, seconds(90)).await.unwrap();
        assert_eq!((after.delta.netin, after.delta.netout, after.delta.total), (200, 70, 270));

        let day = &after.buckets.day;
        assert_eq!((day.total, day.collections), (1070, 4));
        assert_eq!(after.buckets.hour.total, day.total);
    }
}

#[tokio::test]
async fn several_interfaces_are_summed() {
    let store: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());
    let mock = Arc::new(MockHypervisor::new());
    let router = vm("node1", 110, "router");

    mock.add_connection("pve1", ConnectionStatus::Connected);
    mock.add_vm_info("pve1", router.clone());
    mock.set_counters(
        "pve1",
        "node1",
        110,
        hashmap! {
            "netin".to_string() => 100,
            "netin1".to_string() => 50,
            "netout".to_string() => 10,
            "netout1".to_string() => 5,
            "maxmem".to_string() => 1 << 32,
        },
    );

    let collector = collector(&mock, &store, 5);
    collector.collect("pve1", &router, t0()).await.unwrap();

    let sample = store
        .get_current(&VmIdentity::new("pve1", "node1", 110).vm_key())
        .await
        .unwrap()
        .unwrap();

    assert_eq!((sample.netin, sample.netout, sample.total), (150, 15, 165));
}

#[tokio::test]
async fn failures_only_skip_their_vm() {
    let store = Arc::new(FaultyStore::default());
    let mock = Arc::new(MockHypervisor::new());

    mock.add_connection("pve1", ConnectionStatus::Connected);
    mock.add_connection("down", ConnectionStatus::Disconnected);
    mock.add_vm("down", "node9", 900, "unreachable");

    for (vmid, name) in [(101, "ok"), (102, "auth"), (103, "garbled"), (104, "slow"), (105, "gone"), (106, "disk")] {
        mock.add_vm("pve1", "node1", vmid, name);
    }

    mock.set_traffic("pve1", "node1", 101, 10, 10);
    mock.fail_reads("pve1", "node1", 102, MockFailure::Unavailable);
    mock.fail_reads("pve1", "node1", 103, MockFailure::Malformed);
    mock.fail_reads("pve1", "node1", 104, MockFailure::Timeout);
    mock.set_traffic("pve1", "node1", 106, 10, 10);
    mock.add_vm_info(
        "pve1",
        VmInfo {
            status: "stopped".into(),
            ..vm("node1", 107, "stopped")
        },
    );

    *store.failing.lock().unwrap() = Some(VmIdentity::new("pve1", "node1", 106).vm_key());

    let dyn_store: Arc<dyn TrafficStore> = store.clone();
    let summary = collector(&mock, &dyn_store, 2)
        .collect_round(mock.as_ref(), t0())
        .await
        .unwrap();

    assert_eq!((summary.collected, summary.skipped, summary.errored), (2, 3, 1));
    assert!(summary.failed_connections.is_empty());
    assert_eq!(summary.vms.len(), 6);

    let outcome = |vmid: u32| {
        summary
            .vms
            .iter()
            .find(|collection| collection.identity.vmid == vmid)
            .map(|collection| collection.outcome)
    };

    assert_eq!(outcome(101), Some(CollectionOutcome::Seeded));
    assert_eq!(outcome(102), Some(CollectionOutcome::Skipped));
    assert_eq!(outcome(103), Some(CollectionOutcome::DataMissing));
    assert_eq!(outcome(106), Some(CollectionOutcome::Errored));
    assert_eq!(outcome(107), None);
    assert_eq!(outcome(900), None);

    // Missing counters count as no traffic and never touch the baseline.
    let garbled = VmIdentity::new("pve1", "node1", 103);
    assert!(store.get_current(&garbled.vm_key()).await.unwrap().is_none());

    let hour = store
        .get_bucket(Granularity::Hour, &garbled.vm_key(), "2024-03-07-10")
        .await
        .unwrap()
        .unwrap();
    assert_eq!((hour.total, hour.collections), (0, 1));

    // Only the stopped guest and the disconnected connection were not read.
    assert_eq!(mock.reads(), 6);
}

#[tokio::test]
async fn data_missing_is_classified() {
    let store: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());
    let mock = Arc::new(MockHypervisor::new());
    let garbled = vm("node1", 103, "garbled");

    mock.add_connection("pve1", ConnectionStatus::Connected);
    mock.add_vm_info("pve1", garbled.clone());
    mock.fail_reads("pve1", "node1", 103, MockFailure::Malformed);

    let collector = collector(&mock, &store, 5);
    let result = collector.collect("pve1", &garbled, t0()).await;

    assert!(matches!(result, Err(CollectError::DataMissing(_))));

    for _ in 0..2 {
        let summary = collector.collect_round(mock.as_ref(), t0()).await.unwrap();

        assert_eq!((summary.collected, summary.skipped, summary.errored), (1, 0, 0));
        assert_eq!(summary.vms[0].outcome, CollectionOutcome::DataMissing);
        assert!(summary.vms[0].delta.unwrap().is_zero());
    }

    let identity = VmIdentity::new("pve1", "node1", 103);
    let day = store
        .get_bucket(Granularity::Day, &identity.vm_key(), "2024-03-07")
        .await
        .unwrap()
        .unwrap();
    assert_eq!((day.total, day.collections), (0, 2));
    assert!(store.get_current(&identity.vm_key()).await.unwrap().is_none());

    // Readable again: the first good reading seeds the baseline.
    mock.set_traffic("pve1", "node1", 103, 500, 500);
    let recovered = collector.collect("pve1", &garbled, t0()).await.unwrap();
    assert_eq!(recovered.kind, DeltaKind::Seeded);
    assert_eq!(recovered.buckets.day.collections, 3);
}

#[tokio::test]
async fn reads_are_bounded_per_connection() {
    let store: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());
    let mock = Arc::new(MockHypervisor::new());

    mock.add_connection("pve1", ConnectionStatus::Connected);
    mock.set_read_delay(Duration::from_millis(20));

    for vmid in 100..112 {
        mock.add_vm("pve1", "node1", vmid, &format!("vm{vmid}"));
        mock.set_traffic("pve1", "node1", vmid, 1, 1);
    }

    let summary = collector(&mock, &store, 3)
        .collect_round(mock.as_ref(), t0())
        .await
        .unwrap();

    assert_eq!(summary.collected, 12);
    assert_eq!(mock.reads(), 12);
    assert!(mock.peak_in_flight() <= 3);
}

#[tokio::test]
async fn history_is_zero_filled() {
    let store: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());
    let web01 = VmIdentity::new("pve1", "node1", 101);
    let delta = TrafficDelta::new(100, 50, Duration::from_secs(30));

    for at in [t0() - chrono::Duration::hours(5), t0(), quarter_past_ten()] {
        store
            .upsert_bucket(Granularity::Hour, &Granularity::Hour.key_of(at), &web01, &delta, at)
            .await
            .unwrap();
    }

    let query = QueryFacade::new(Arc::clone(&store), DashboardSettings::default())
        .with_clock(quarter_past_ten);

    let history: Vec<TrafficBucket> = query.history_of(&web01, 24).await.unwrap().collect();

    assert_eq!(history.len(), 24);
    assert_eq!(history.first().unwrap().key.as_ref(), "2024-03-06-11");
    assert_eq!(history.last().unwrap().key.as_ref(), "2024-03-07-10");
    assert!(history.windows(2).all(|pair| pair[0].key < pair[1].key));
    assert_eq!(history[23].total, 300);
    assert_eq!(history[23].collections, 2);
    assert_eq!(history[18].total, 150);
    assert_eq!(history.iter().filter(|bucket| bucket.total == 0).count(), 22);

    let unknown = VmIdentity::new("pve1", "node1", 999);
    let mut empty = query.history_of(&unknown, 24).await.unwrap();
    assert_eq!(empty.len(), 24);
    assert!(empty.by_ref().all(|bucket| bucket.total == 0 && bucket.collections == 0));
    assert_eq!(empty.next(), None);

    assert_eq!(query.history_of(&web01, 0).await.unwrap().len(), 0);

    let mut long = query.history_of(&web01, 1_000_000_000).await.unwrap();
    assert_eq!(long.len(), 1_000_000_000);
    assert_eq!(long.next().unwrap().collections, 0);

    assert!(matches!(
        query.history_of(&web01, 3_000_000_000).await,
        Err(QueryError::HistoryTooLong(3_000_000_000))
    ));
}

#[tokio::test]
async fn queries_default_to_current_windows() {
    let store: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());
    let delta = TrafficDelta::new(10, 10, Duration::from_secs(30));
    let small = VmIdentity::new("pve1", "node1", 101);
    let big = VmIdentity::new("pve1", "node1", 102);
    let tied = VmIdentity::new("lab", "node1", 300);

    for (identity, times) in [(&small, 1), (&big, 3), (&tied, 1)] {
        for _ in 0..times {
            for granularity in [Granularity::Hour, Granularity::Day] {
                store
                    .upsert_bucket(granularity, &granularity.key_of(quarter_past_ten()), identity, &delta, quarter_past_ten())
                    .await
                    .unwrap();
            }
        }
    }

    let query = QueryFacade::new(Arc::clone(&store), DashboardSettings::default())
        .with_clock(quarter_past_ten);

    assert_eq!(query.hourly_of(&big, None).await.unwrap().unwrap().total, 60);
    assert_eq!(query.daily_of(&big, Some("2024-03-07")).await.unwrap().unwrap().collections, 3);
    assert!(query.hourly_of(&big, Some("2024-03-07-09")).await.unwrap().is_none());
    assert!(query.hourly_of(&big, Some("yesterday")).await.is_err());

    let order: Vec<VmIdentity> = query
        .all_hourly(None)
        .await
        .unwrap()
        .into_iter()
        .map(|bucket| bucket.identity)
        .collect();

    assert_eq!(order, [big.clone(), tied.clone(), small.clone()]);
    assert_eq!(query.all_daily(None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn dashboard_flags_heavy_consumers() {
    let store: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());
    let now = quarter_past_ten();
    let vms = [
        (VmIdentity::new("pve1", "node1", 101), 2 * GIB),
        (VmIdentity::new("pve1", "node1", 102), 11 * GIB),
        (VmIdentity::new("pve1", "node1", 103), 500 * MIB),
    ];

    for (identity, total) in &vms {
        store
            .put_current(&CurrentSample::new(identity.clone(), CounterReading::new(*total, 0), now))
            .await
            .unwrap();
        store
            .upsert_bucket(
                Granularity::Hour,
                "2024-03-07-10",
                identity,
                &TrafficDelta::new(*total, 0, Duration::from_secs(30)),
                now,
            )
            .await
            .unwrap();
    }

    let snapshot = QueryFacade::new(store, DashboardSettings::default())
        .with_clock(quarter_past_ten)
        .dashboard_snapshot()
        .await
        .unwrap();

    assert_eq!(snapshot.hour, "2024-03-07-10");
    assert_eq!(snapshot.totals.vms, 3);
    assert_eq!(snapshot.totals.total, 13 * GIB + 500 * MIB);

    let alerts: Vec<(u32, AlertLevel)> = snapshot
        .alerts
        .iter()
        .map(|alert| (alert.identity.vmid, alert.level))
        .collect();
    assert_eq!(alerts, [(102, AlertLevel::Critical), (101, AlertLevel::Warning)]);

    assert_eq!(snapshot.vms[0].identity.vmid, 102);
    assert_eq!(snapshot.vms[2].alert, None);

    // No live view: the rate is the hour average over the 15 elapsed minutes.
    assert_eq!(snapshot.vms[2].rate_source, RateSource::HourAverage);
    assert_eq!(snapshot.vms[2].rate, (500 * MIB) as f64 / 900.0);
}

#[tokio::test]
async fn service_rounds_feed_the_dashboard() {
    let mock = Arc::new(MockHypervisor::new());
    let store: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());

    mock.add_connection("pve1", ConnectionStatus::Connected);
    mock.add_vm("pve1", "node1", 101, "web01");
    mock.set_traffic("pve1", "node1", 101, 1000, 500);

    let service = CollectorService::new(mock.clone(), mock.clone(), store, &Config::default());

    let first = service.collect_now().await.unwrap();
    assert_eq!(first.vms[0].outcome, CollectionOutcome::Seeded);

    mock.set_traffic("pve1", "node1", 101, 1600, 800);
    let second = service.collect_now().await.unwrap();
    assert_eq!(second.vms[0].outcome, CollectionOutcome::Collected);
    assert_eq!(second.vms[0].delta.map(|delta| delta.total), Some(900));

    let snapshot = service.query().dashboard_snapshot().await.unwrap();
    let row = &snapshot.vms[0];

    assert_eq!(row.name.as_deref(), Some("web01"));
    assert_eq!(row.rate_source, RateSource::Recent);
    assert_eq!(row.rate, 900.0 / 30.0);
}

#[tokio::test]
async fn orphan_sweep_keeps_unreachable_connections() {
    let mock = Arc::new(MockHypervisor::new());
    let store: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());

    mock.add_connection("pve1", ConnectionStatus::Connected);
    mock.add_connection("lab", ConnectionStatus::Connected);

    for (connection, node, vmid) in [("pve1", "node1", 101), ("pve1", "node1", 102), ("lab", "node1", 300)] {
        mock.add_vm(connection, node, vmid, "guest");
        mock.set_traffic(connection, node, vmid, 10, 10);
    }

    let service = CollectorService::new(mock.clone(), mock.clone(), Arc::clone(&store), &Config::default());
    service.collect_now().await.unwrap();

    // 102 is deleted while lab cannot be listed.
    mock.remove_vm("pve1", "node1", 102);
    mock.break_inventory("lab", true);

    let outcome = service.purge_orphans().await.unwrap();
    assert_eq!(
        outcome,
        PurgeOutcome::Done(PurgeCounts {
            current: 1,
            hourly: 1,
            daily: 1
        })
    );

    let known: Vec<u32> = store
        .known_identities()
        .await
        .unwrap()
        .into_iter()
        .map(|identity| identity.vmid)
        .collect();
    assert_eq!(known, [300, 101]);

    // A disconnected connection keeps its data too.
    mock.break_inventory("lab", false);
    mock.set_status("lab", ConnectionStatus::Disconnected);
    assert_eq!(service.purge_orphans().await.unwrap(), PurgeOutcome::Done(PurgeCounts::default()));

    // Once the connection is gone, so is its data.
    mock.remove_connection("lab");
    service.purge_orphans().await.unwrap();
    assert_eq!(store.known_identities().await.unwrap(), [VmIdentity::new("pve1", "node1", 101)]);
}

#[tokio::test]
async fn connection_data_can_be_dropped() {
    let mock = Arc::new(MockHypervisor::new());
    let store: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());

    mock.add_connection("pve1", ConnectionStatus::Connected);
    mock.add_connection("lab", ConnectionStatus::Connected);
    mock.add_vm("pve1", "node1", 101, "web01");
    mock.add_vm("lab", "node1", 300, "test");
    mock.set_traffic("pve1", "node1", 101, 10, 10);
    mock.set_traffic("lab", "node1", 300, 10, 10);

    let service = CollectorService::new(mock.clone(), mock.clone(), Arc::clone(&store), &Config::default());
    service.collect_now().await.unwrap();

    let counts = service.delete_connection_data("lab").await.unwrap();
    assert_eq!(counts.total(), 3);
    assert_eq!(store.known_identities().await.unwrap().len(), 1);

    let counts = service.delete_all_data().await.unwrap();
    assert_eq!(counts.total(), 3);
    assert!(store.list_current().await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_buckets_are_purged() {
    let store: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());
    let web01 = VmIdentity::new("pve1", "node1", 101);
    let delta = TrafficDelta::new(1, 1, Duration::from_secs(30));
    let now = Utc::now();

    for age in [40, 10] {
        let at = now - chrono::Duration::days(age);

        for granularity in [Granularity::Hour, Granularity::Day] {
            store
                .upsert_bucket(granularity, &granularity.key_of(at), &web01, &delta, at)
                .await
                .unwrap();
        }
    }

    let mock = Arc::new(MockHypervisor::new());
    let service = CollectorService::new(mock.clone(), mock, Arc::clone(&store), &Config::default());

    assert_eq!(
        service.purge_expired().await.unwrap(),
        PurgeOutcome::Done(PurgeCounts {
            current: 0,
            hourly: 1,
            daily: 1
        })
    );

    let recent = Granularity::Day.key_of(now - chrono::Duration::days(10));
    assert!(store.get_bucket(Granularity::Day, &web01.vm_key(), &recent).await.unwrap().is_some());
}

#[tokio::test]
async fn purges_are_single_flight() {
    let store = Arc::new(FaultyStore {
        delete_delay: Duration::from_millis(50),
        ..Default::default()
    });
    let retention = RetentionManager::new(store, TIMEOUT);
    let live = HashSet::new();

    let (a, b) = tokio::join!(retention.purge_orphans(&live), retention.purge_orphans(&live));

    assert!(matches!(a.unwrap(), PurgeOutcome::Done(_)));
    assert_eq!(b.unwrap(), PurgeOutcome::AlreadyRunning);

    assert!(matches!(
        retention.purge_older_than(30, t0()).await.unwrap(),
        PurgeOutcome::Done(_)
    ));

    // An age purge is not turned away by a slow orphan purge.
    let (orphans, expired) = tokio::join!(
        retention.purge_orphans(&live),
        retention.purge_older_than(30, t0())
    );

    assert!(matches!(orphans.unwrap(), PurgeOutcome::Done(_)));
    assert!(matches!(expired.unwrap(), PurgeOutcome::Done(_)));
}

#[tokio::test]
async fn service_lifecycle() {
    let mock = Arc::new(MockHypervisor::new());
    let store: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());
    let web01 = VmIdentity::new("pve1", "node1", 101);

    mock.add_connection("pve1", ConnectionStatus::Connected);
    mock.add_vm("pve1", "node1", 101, "web01");
    mock.set_traffic("pve1", "node1", 101, 10, 10);

    let mut config = Config::default();
    config.polling.interval_secs = 5;
    config.polling.shutdown_grace_secs = 1;

    let service = CollectorService::new(mock.clone(), mock.clone(), Arc::clone(&store), &config);

    service.start().await.unwrap();
    assert!(service.start().await.is_err());
    assert!(service.is_running().await);

    // The first round runs right away.
    let mut seeded = false;
    for _ in 0..100 {
        if store.get_current(&web01.vm_key()).await.unwrap().is_some() {
            seeded = true;
            break;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seeded);

    service.stop().await;
    assert!(!service.is_running().await);

    // Stopping twice is harmless.
    service.stop().await;
}

#[tokio::test]
async fn collect_now_waits_for_the_timer_round() {
    let mock = Arc::new(MockHypervisor::new());
    let store: Arc<dyn TrafficStore> = Arc::new(MemoryStore::new());

    mock.add_connection("pve1", ConnectionStatus::Connected);
    mock.add_vm("pve1", "node1", 101, "web01");
    mock.set_traffic("pve1", "node1", 101, 10, 10);
    mock.set_read_delay(Duration::from_millis(300));

    let mut config = Config::default();
    config.polling.interval_secs = 5;
    config.polling.shutdown_grace_secs = 1;

    let service = CollectorService::new(mock.clone(), mock.clone(), Arc::clone(&store), &config);
    service.start().await.unwrap();

    // Wait for the timer round to be in the middle of its read.
    for _ in 0..100 {
        if mock.reads() > 0 {
            break;
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(mock.reads(), 1);

    let summary = service.collect_now().await.unwrap();

    // The timer round stored its baseline before this round read anything.
    assert_eq!(summary.vms[0].outcome, CollectionOutcome::Collected);
    assert_eq!(mock.reads(), 2);
    assert_eq!(mock.peak_in_flight(), 1);

    service.stop().await;
}
