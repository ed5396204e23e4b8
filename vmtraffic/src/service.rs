//! The collector service: owns the collector, retention and query objects and
//! the background loops driving them.
//!
//! Three loops run once started: polling rounds, age-based retention and the
//! orphan sweep. Polling rounds (timer or [CollectorService::collect_now]) and
//! destructive operations are serialized through one lock.
use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{anyhow, bail};
use chrono::Utc;
use pve_api::{ConnectionRegistry, CounterSource, SourceError};
use tokio::{
    select,
    sync::{watch, Mutex},
    task::JoinSet,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{error, info, instrument, warn};

use crate::{
    aggregator::BucketAggregator,
    collector::{RoundSummary, SampleCollector},
    config::Config,
    query::{DashboardSettings, LiveView, QueryFacade},
    retention::{PurgeOutcome, RetentionManager},
    snapshot::CurrentSnapshotStore,
    store::{retry_once, timed, PurgeCounts, StoreError, TrafficStore},
};

#[derive(Clone, Copy, Debug)]
struct ServiceSettings {
    poll_interval: Duration,
    storage_timeout: Duration,
    shutdown_grace: Duration,
    retention_days: u32,
    retention_sweep: Duration,
    orphan_sweep: Duration,
}

struct Inner {
    registry: Arc<dyn ConnectionRegistry>,
    store: Arc<dyn TrafficStore>,
    collector: SampleCollector,
    retention: RetentionManager,
    dashboard: DashboardSettings,
    settings: ServiceSettings,
    round_lock: Mutex<()>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

pub struct CollectorService {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl CollectorService {
    pub fn new(
        registry: Arc<dyn ConnectionRegistry>,
        source: Arc<dyn CounterSource>,
        store: Arc<dyn TrafficStore>,
        config: &Config,
    ) -> Self {
        let storage_timeout = config.storage_timeout();

        let collector = SampleCollector::new(
            source,
            CurrentSnapshotStore::new(Arc::clone(&store), storage_timeout),
            BucketAggregator::new(Arc::clone(&store), storage_timeout),
            config.collector_settings(),
        );

        let inner = Inner {
            registry,
            retention: RetentionManager::new(Arc::clone(&store), storage_timeout),
            store,
            collector,
            dashboard: config.dashboard_settings(),
            settings: ServiceSettings {
                poll_interval: config.poll_interval(),
                storage_timeout,
                shutdown_grace: config.shutdown_grace(),
                retention_days: config.retention.days,
                retention_sweep: config.retention_sweep(),
                orphan_sweep: config.orphan_sweep(),
            },
            round_lock: Mutex::new(()),
        };

        Self {
            inner: Arc::new(inner),
            running: Mutex::new(None),
        }
    }

    /// Spawn the background loops.
    #[instrument(skip(self))]
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut running = self.running.lock().await;

        if running.is_some() {
            bail!("collector service already started");
        }

        let (shutdown, receiver) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let settings = self.inner.settings;
        let now = Instant::now();

        let inner = Arc::clone(&self.inner);
        tasks.spawn(every("polling", now, settings.poll_interval, receiver.clone(), move || {
            let inner = Arc::clone(&inner);
            async move {
                if let Err(e) = inner.collect_round().await {
                    warn!("Polling round aborted: {e}");
                }
            }
        }));

        let inner = Arc::clone(&self.inner);
        tasks.spawn(every("retention", now, settings.retention_sweep, receiver.clone(), move || {
            let inner = Arc::clone(&inner);
            async move {
                if let Err(e) = inner.purge_expired().await {
                    error!("Retention sweep failed: {e}");
                }
            }
        }));

        // Give the registry time to probe connections before the first sweep.
        let inner = Arc::clone(&self.inner);
        tasks.spawn(every(
            "orphan sweep",
            now + settings.orphan_sweep,
            settings.orphan_sweep,
            receiver,
            move || {
                let inner = Arc::clone(&inner);
                async move {
                    if let Err(e) = inner.purge_orphans().await {
                        error!("Orphan sweep failed: {e}");
                    }
                }
            },
        ));

        info!(
            "Collector service started, polling every {:?}",
            settings.poll_interval
        );

        *running = Some(Running { shutdown, tasks });
        Ok(())
    }

    /// Stop the background loops, giving in-flight work the shutdown grace
    /// period before abandoning it.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let Some(Running { shutdown, mut tasks }) = self.running.lock().await.take() else {
            return;
        };

        shutdown.send_replace(true);

        let drained = time::timeout(self.inner.settings.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Shutdown grace period elapsed, abandoning in-flight work");
            tasks.shutdown().await;
        }

        info!("Collector service stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Run a polling round now, after any round in progress.
    pub async fn collect_now(&self) -> Result<RoundSummary, SourceError> {
        self.inner.collect_round().await
    }

    /// Purge the data of every VM absent from the live inventories.
    pub async fn purge_orphans(&self) -> anyhow::Result<PurgeOutcome> {
        self.inner.purge_orphans().await
    }

    /// Purge buckets older than the retention period.
    pub async fn purge_expired(&self) -> Result<PurgeOutcome, StoreError> {
        self.inner.purge_expired().await
    }

    #[instrument(skip(self))]
    pub async fn delete_all_data(&self) -> Result<PurgeCounts, StoreError> {
        let inner = &self.inner;
        let _round = inner.round_lock.lock().await;

        let counts = retry_once("delete all", true, || {
            timed(inner.settings.storage_timeout, inner.store.delete_all())
        })
        .await?;
        inner.collector.recent().clear();

        warn!("Deleted every traffic record ({} rows)", counts.total());
        Ok(counts)
    }

    #[instrument(skip(self))]
    pub async fn delete_connection_data(&self, connection_id: &str) -> Result<PurgeCounts, StoreError> {
        let inner = &self.inner;
        let _round = inner.round_lock.lock().await;

        let counts = retry_once("connection delete", true, || {
            timed(
                inner.settings.storage_timeout,
                inner.store.delete_connection(connection_id),
            )
        })
        .await?;
        inner.collector.recent().forget_connection(connection_id);

        info!(
            "Deleted traffic of connection {connection_id} ({} rows)",
            counts.total()
        );
        Ok(counts)
    }

    /// Read access to the collected data, with live inventory.
    pub fn query(&self) -> QueryFacade {
        QueryFacade::new(Arc::clone(&self.inner.store), self.inner.dashboard).with_live_view(LiveView {
            registry: Arc::clone(&self.inner.registry),
            recent: self.inner.collector.recent(),
        })
    }
}

impl Inner {
    async fn collect_round(&self) -> Result<RoundSummary, SourceError> {
        let _round = self.round_lock.lock().await;

        self.collector
            .collect_round(self.registry.as_ref(), Utc::now())
            .await
    }

    async fn purge_expired(&self) -> Result<PurgeOutcome, StoreError> {
        self.retention
            .purge_older_than(self.settings.retention_days, Utc::now())
            .await
    }

    async fn purge_orphans(&self) -> anyhow::Result<PurgeOutcome> {
        let _round = self.round_lock.lock().await;

        let live = self
            .retention
            .live_set(self.registry.as_ref())
            .await
            .ok_or_else(|| anyhow!("inventory unavailable, orphan purge skipped"))?;

        Ok(self.retention.purge_orphans(&live).await?)
    }
}

/// Run `job` every `period`, starting at `start`, until shutdown. A job in
/// progress is never interrupted by the shutdown signal itself.
async fn every<F, Fut>(
    name: &'static str,
    start: Instant,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = ticker.tick() => job().await,
            _ = shutdown.changed() => break,
        }

        if *shutdown.borrow() {
            break;
        }
    }

    info!("Stopped {name} loop");
}
