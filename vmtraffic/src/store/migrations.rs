//! Database migrations.
use sqlx::SqlitePool;
use tracing::{info, instrument};

use super::StoreError;

const SCHEMA_VERSION: i64 = 1;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::Migration(e.to_string()))?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {current_version})");
        return Ok(());
    }

    info!("Migrating database from version {current_version} to {SCHEMA_VERSION}");

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    Ok(())
}

/// Counters are plain INTEGER columns (64 bits), time keys are zero-padded
/// strings so that `<` on them is chronological.
#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<(), StoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS current (
            vm_key TEXT PRIMARY KEY,
            connection_id TEXT NOT NULL,
            node TEXT NOT NULL,
            vmid INTEGER NOT NULL,
            netin INTEGER NOT NULL,
            netout INTEGER NOT NULL,
            total INTEGER NOT NULL,
            timestamp INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS hourly (
            vm_key TEXT NOT NULL,
            hour TEXT NOT NULL,
            connection_id TEXT NOT NULL,
            node TEXT NOT NULL,
            vmid INTEGER NOT NULL,
            netin INTEGER NOT NULL DEFAULT 0,
            netout INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            collections INTEGER NOT NULL DEFAULT 0,
            start_time INTEGER NOT NULL,
            last_update INTEGER NOT NULL,
            UNIQUE (vm_key, hour)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS daily (
            vm_key TEXT NOT NULL,
            day TEXT NOT NULL,
            connection_id TEXT NOT NULL,
            node TEXT NOT NULL,
            vmid INTEGER NOT NULL,
            netin INTEGER NOT NULL DEFAULT 0,
            netout INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            collections INTEGER NOT NULL DEFAULT 0,
            start_time INTEGER NOT NULL,
            last_update INTEGER NOT NULL,
            UNIQUE (vm_key, day)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_current_connection ON current(connection_id)",
        "CREATE INDEX IF NOT EXISTS idx_hourly_hour ON hourly(hour)",
        "CREATE INDEX IF NOT EXISTS idx_hourly_connection ON hourly(connection_id)",
        "CREATE INDEX IF NOT EXISTS idx_daily_day ON daily(day)",
        "CREATE INDEX IF NOT EXISTS idx_daily_connection ON daily(connection_id)",
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
    }

    tx.commit()
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

    info!("Migrated database to schema version 1");

    Ok(())
}
