//! SQLite backed [TrafficStore].
use std::{collections::HashSet, path::Path, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row, Sqlite, Transaction,
};
use tracing::{info, instrument};
use vmtraffic_common::{
    model::{CurrentSample, TrafficBucket, TrafficDelta, VmIdentity, VmKey},
    timekey::Granularity,
};

use super::{migrations, PurgeCounts, StoreError, TrafficStore};

const BUCKET_COLUMNS: &str = "connection_id, node, vmid, netin, netout, total, collections, start_time, last_update";

/// Table and time key column of a granularity.
const fn bucket_table(granularity: Granularity) -> (&'static str, &'static str) {
    match granularity {
        Granularity::Hour => ("hourly", "hour"),
        Granularity::Day => ("daily", "day"),
    }
}

/// SQLite INTEGER is signed 64 bits, which is enough for exabytes of traffic.
fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::InvalidRow(format!("timestamp {millis} out of range")))
}

fn row_identity(row: &SqliteRow) -> Result<VmIdentity, StoreError> {
    let vmid: i64 = row.try_get("vmid")?;

    Ok(VmIdentity {
        connection_id: row.try_get::<String, _>("connection_id")?.into(),
        node: row.try_get::<String, _>("node")?.into(),
        vmid: u32::try_from(vmid).map_err(|_| StoreError::InvalidRow(format!("vmid {vmid}")))?,
    })
}

fn row_to_sample(row: &SqliteRow) -> Result<CurrentSample, StoreError> {
    Ok(CurrentSample {
        identity: row_identity(row)?,
        netin: from_db(row.try_get("netin")?),
        netout: from_db(row.try_get("netout")?),
        total: from_db(row.try_get("total")?),
        timestamp: from_millis(row.try_get("timestamp")?)?,
    })
}

fn row_to_bucket(row: &SqliteRow, granularity: Granularity) -> Result<TrafficBucket, StoreError> {
    Ok(TrafficBucket {
        identity: row_identity(row)?,
        granularity,
        key: row.try_get::<String, _>("time_key")?.into(),
        netin: from_db(row.try_get("netin")?),
        netout: from_db(row.try_get("netout")?),
        total: from_db(row.try_get("total")?),
        collections: from_db(row.try_get("collections")?),
        start_time: from_millis(row.try_get("start_time")?)?,
        last_update: from_millis(row.try_get("last_update")?)?,
    })
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        migrations::run(&store.pool).await?;

        info!("Traffic database ready");
        Ok(store)
    }

    /// Open an existing database without writing to it.
    pub async fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// A private in-memory database. A single connection is kept open for
    /// the lifetime of the pool, as the database vanishes with it.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        migrations::run(&store.pool).await?;

        Ok(store)
    }

    async fn purge_where(
        tx: &mut Transaction<'static, Sqlite>,
        condition: &str,
        bind: Option<&str>,
    ) -> Result<PurgeCounts, StoreError> {
        let mut counts = [0u64; 3];

        for (table, count) in ["current", "hourly", "daily"].into_iter().zip(counts.iter_mut()) {
            let sql = format!("DELETE FROM {table} WHERE {condition}");
            let query = match bind {
                Some(value) => sqlx::query(&sql).bind(value),
                None => sqlx::query(&sql),
            };

            *count = query.execute(&mut **tx).await?.rows_affected();
        }

        Ok(PurgeCounts {
            current: counts[0],
            hourly: counts[1],
            daily: counts[2],
        })
    }

    async fn select_buckets(
        &self,
        granularity: Granularity,
        condition: &str,
        binds: &[&str],
    ) -> Result<Vec<TrafficBucket>, StoreError> {
        let (table, column) = bucket_table(granularity);
        let sql = format!(
            "SELECT {column} AS time_key, {BUCKET_COLUMNS} FROM {table} WHERE {condition} ORDER BY {column}, vm_key"
        );

        let rows = binds
            .iter()
            .fold(sqlx::query(&sql), |query, value| query.bind(*value))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row_to_bucket(row, granularity))
            .collect()
    }
}

#[async_trait]
impl TrafficStore for SqliteStore {
    async fn get_current(&self, vm_key: &VmKey) -> Result<Option<CurrentSample>, StoreError> {
        let row = sqlx::query(
            "SELECT connection_id, node, vmid, netin, netout, total, timestamp FROM current WHERE vm_key = ?",
        )
        .bind(vm_key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_sample).transpose()
    }

    async fn put_current(&self, sample: &CurrentSample) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO current (vm_key, connection_id, node, vmid, netin, netout, total, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sample.vm_key().as_str())
        .bind(sample.identity.connection_id.as_ref())
        .bind(sample.identity.node.as_ref())
        .bind(sample.identity.vmid as i64)
        .bind(to_db(sample.netin))
        .bind(to_db(sample.netout))
        .bind(to_db(sample.total))
        .bind(to_millis(sample.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_current(&self) -> Result<Vec<CurrentSample>, StoreError> {
        let rows = sqlx::query(
            "SELECT connection_id, node, vmid, netin, netout, total, timestamp FROM current ORDER BY vm_key",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_sample).collect()
    }

    #[instrument(skip(self, delta), fields(vm = %identity))]
    async fn upsert_bucket(
        &self,
        granularity: Granularity,
        key: &str,
        identity: &VmIdentity,
        delta: &TrafficDelta,
        now: DateTime<Utc>,
    ) -> Result<TrafficBucket, StoreError> {
        let (table, column) = bucket_table(granularity);

        // Single statement: the increment happens inside SQLite, never in here.
        let sql = format!(
            r#"
            INSERT INTO {table} (vm_key, {column}, {BUCKET_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT (vm_key, {column}) DO UPDATE SET
                netin = netin + excluded.netin,
                netout = netout + excluded.netout,
                total = total + excluded.total,
                collections = collections + 1,
                last_update = excluded.last_update
            RETURNING {column} AS time_key, {BUCKET_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(identity.vm_key().as_str())
            .bind(key)
            .bind(identity.connection_id.as_ref())
            .bind(identity.node.as_ref())
            .bind(identity.vmid as i64)
            .bind(to_db(delta.netin))
            .bind(to_db(delta.netout))
            .bind(to_db(delta.total))
            .bind(to_millis(now))
            .bind(to_millis(now))
            .fetch_one(&self.pool)
            .await?;

        row_to_bucket(&row, granularity)
    }

    async fn get_bucket(
        &self,
        granularity: Granularity,
        vm_key: &VmKey,
        key: &str,
    ) -> Result<Option<TrafficBucket>, StoreError> {
        let (_, column) = bucket_table(granularity);

        Ok(self
            .select_buckets(
                granularity,
                &format!("vm_key = ? AND {column} = ?"),
                &[vm_key.as_str(), key],
            )
            .await?
            .pop())
    }

    async fn buckets_for_key(
        &self,
        granularity: Granularity,
        key: &str,
    ) -> Result<Vec<TrafficBucket>, StoreError> {
        let (_, column) = bucket_table(granularity);

        self.select_buckets(granularity, &format!("{column} = ?"), &[key])
            .await
    }

    async fn buckets_in_range(
        &self,
        granularity: Granularity,
        vm_key: &VmKey,
        from: &str,
        to: &str,
    ) -> Result<Vec<TrafficBucket>, StoreError> {
        let (_, column) = bucket_table(granularity);

        self.select_buckets(
            granularity,
            &format!("vm_key = ? AND {column} >= ? AND {column} <= ?"),
            &[vm_key.as_str(), from, to],
        )
        .await
    }

    async fn buckets_with_prefix(
        &self,
        granularity: Granularity,
        vm_key: &VmKey,
        prefix: &str,
    ) -> Result<Vec<TrafficBucket>, StoreError> {
        let (_, column) = bucket_table(granularity);

        self.select_buckets(
            granularity,
            &format!("vm_key = ? AND substr({column}, 1, length(?)) = ?"),
            &[vm_key.as_str(), prefix, prefix],
        )
        .await
    }

    #[instrument(skip(self))]
    async fn delete_buckets_before(
        &self,
        granularity: Granularity,
        key: &str,
    ) -> Result<u64, StoreError> {
        let (table, column) = bucket_table(granularity);

        Ok(sqlx::query(&format!("DELETE FROM {table} WHERE {column} < ?"))
            .bind(key)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    #[instrument(skip(self, live), fields(live = live.len()))]
    async fn delete_orphans(&self, live: &HashSet<VmKey>) -> Result<PurgeCounts, StoreError> {
        let live: Vec<&str> = live.iter().map(VmKey::as_str).collect();
        let live = serde_json::to_string(&live)
            .map_err(|e| StoreError::InvalidRow(format!("live set: {e}")))?;

        let mut tx = self.pool.begin().await?;
        let counts = Self::purge_where(
            &mut tx,
            "vm_key NOT IN (SELECT value FROM json_each(?))",
            Some(live.as_str()),
        )
        .await?;
        tx.commit().await?;

        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn delete_connection(&self, connection_id: &str) -> Result<PurgeCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let counts = Self::purge_where(&mut tx, "connection_id = ?", Some(connection_id)).await?;
        tx.commit().await?;

        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn delete_all(&self) -> Result<PurgeCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let counts = Self::purge_where(&mut tx, "1", None).await?;
        tx.commit().await?;

        Ok(counts)
    }

    async fn known_identities(&self) -> Result<Vec<VmIdentity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT connection_id, node, vmid FROM current
            UNION SELECT connection_id, node, vmid FROM hourly
            UNION SELECT connection_id, node, vmid FROM daily
            ORDER BY connection_id, node, vmid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_identity).collect()
    }
}
