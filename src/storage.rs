//! SQLite store of accumulated per-region observations.
//!
//! The area-history endpoint only ever returns what upstream still keeps, so
//! every archival fetch is folded in here. The temporal indexer reads its
//! history back out by date range.
//!
//! Rows are keyed by `(region, observed_at)`; re-ingesting the same
//! observation is a no-op.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::{PipelineError, PipelineResult};
use crate::model::{CountRecord, Counts};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:epidash.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // A single connection keeps "sqlite::memory:" pointing at one database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> PipelineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS region_observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                region TEXT NOT NULL,
                observed_at INTEGER NOT NULL,
                confirmed INTEGER NOT NULL,
                suspected INTEGER NOT NULL,
                cured INTEGER NOT NULL,
                dead INTEGER NOT NULL,
                UNIQUE (region, observed_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for efficient time-range scans
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_region_observations_ts
            ON region_observations(observed_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert observations, skipping ones already stored.
    ///
    /// Returns the number of new rows.
    pub async fn insert_observations(&self, records: &[CountRecord]) -> PipelineResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO region_observations
                    (region, observed_at, confirmed, suspected, cured, dead)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.region)
            .bind(record.observed_at.timestamp_millis())
            .bind(to_sql_count(record.counts.confirmed))
            .bind(to_sql_count(record.counts.suspected))
            .bind(to_sql_count(record.counts.cured))
            .bind(to_sql_count(record.counts.dead))
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Observations with `from <= observed_at <= until`, in insertion order.
    pub async fn load_observations(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> PipelineResult<Vec<CountRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT region, observed_at, confirmed, suspected, cured, dead
            FROM region_observations
            WHERE observed_at >= ? AND observed_at <= ?
            ORDER BY id
            "#,
        )
        .bind(from.timestamp_millis())
        .bind(until.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let ms: i64 = row.get("observed_at");
                let observed_at = DateTime::from_timestamp_millis(ms)
                    .ok_or_else(|| PipelineError::Schema {
                        record: "region_observations".to_string(),
                        reason: format!("stored timestamp {ms} out of range"),
                    })?;
                Ok(CountRecord::new(
                    row.get::<String, _>("region"),
                    Counts::new(
                        from_sql_count(row.get("confirmed")),
                        from_sql_count(row.get("suspected")),
                        from_sql_count(row.get("cured")),
                        from_sql_count(row.get("dead")),
                    ),
                    observed_at,
                ))
            })
            .collect()
    }

    /// Timestamp of the newest stored observation.
    pub async fn latest_observation(&self) -> PipelineResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(observed_at) as last_ts
            FROM region_observations
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let last_ts: Option<i64> = row.get("last_ts");
        Ok(last_ts.and_then(DateTime::from_timestamp_millis))
    }
}

fn to_sql_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn from_sql_count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}
