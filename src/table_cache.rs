//! Persisted region tables.
//!
//! Each level's most recent known-good table is written as CSV
//! (`region,confirmed,suspected,cured,dead`). A table older than the
//! configured max age must not be served as fresh; readers either wait for a
//! regenerated one or fall back explicitly.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::model::{CountRecord, Counts, RegionLevel, RegionSnapshotTable};

const CSV_COLUMNS: [&str; 5] = ["region", "confirmed", "suspected", "cured", "dead"];

/// A table read back from disk together with its age.
#[derive(Debug, Clone)]
pub struct CachedTable {
    pub table: RegionSnapshotTable,
    pub age: Duration,
}

/// Directory holding the per-level CSV tables.
#[derive(Debug, Clone)]
pub struct TableCache {
    dir: PathBuf,
    max_age: Duration,
}

impl TableCache {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn path(&self, level: RegionLevel) -> PathBuf {
        let name = match level {
            RegionLevel::Province => "provinces_data.csv",
            RegionLevel::City => "cities_data.csv",
        };
        self.dir.join(name)
    }

    /// Replace the level's table on disk.
    ///
    /// Written to a sibling temp file and renamed, so readers never see a
    /// partial table.
    pub async fn write(&self, table: &RegionSnapshotTable) -> PipelineResult<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(table.level);
        let tmp = path.with_extension("csv.tmp");

        tokio::fs::write(&tmp, encode_csv(table)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!(level = %table.level, regions = table.len(), path = %path.display(), "Region table persisted");
        Ok(path)
    }

    /// Read the level's table regardless of age. `None` if it was never written.
    pub async fn read(&self, level: RegionLevel) -> PipelineResult<Option<CachedTable>> {
        let path = self.path(level);
        let modified = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw = tokio::fs::read_to_string(&path).await?;
        let table = decode_csv(level, &raw, DateTime::<Utc>::from(modified))?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);

        Ok(Some(CachedTable { table, age }))
    }

    /// Read the level's table only if it is within the freshness window.
    pub async fn read_fresh(&self, level: RegionLevel) -> PipelineResult<Option<RegionSnapshotTable>> {
        Ok(self
            .read(level)
            .await?
            .filter(|cached| cached.age <= self.max_age)
            .map(|cached| cached.table))
    }

    /// Poll until a fresh table exists, sleeping `poll` between at most `attempts` reads.
    pub async fn wait_for_fresh(
        &self,
        level: RegionLevel,
        attempts: u32,
        poll: Duration,
    ) -> PipelineResult<RegionSnapshotTable> {
        let attempts = attempts.max(1);
        for attempt in 0..attempts {
            if let Some(table) = self.read_fresh(level).await? {
                return Ok(table);
            }
            if attempt + 1 < attempts {
                debug!(level = %level, attempt = attempt + 1, "Waiting for a fresh table");
                tokio::time::sleep(poll).await;
            }
        }

        let age_secs = self.read(level).await?.map(|cached| cached.age.as_secs());
        Err(PipelineError::StaleTable {
            level: level.to_string(),
            age_secs,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TableRow {
    region: String,
    confirmed: u64,
    suspected: u64,
    cured: u64,
    dead: u64,
}

/// Serialize a table in the persisted CSV layout.
pub fn encode_csv(table: &RegionSnapshotTable) -> PipelineResult<String> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(64 * (table.len() + 1)));

    // Written explicitly so an empty table still carries its header.
    writer.write_record(CSV_COLUMNS)?;
    for (region, entry) in &table.entries {
        let c = &entry.record.counts;
        writer.serialize(TableRow {
            region: region.clone(),
            confirmed: c.confirmed,
            suspected: c.suspected,
            cured: c.cured,
            dead: c.dead,
        })?;
    }

    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    String::from_utf8(bytes).map_err(|e| PipelineError::Schema {
        record: format!("{} table", table.level),
        reason: e.to_string(),
    })
}

/// Parse the persisted CSV layout. Bands are recomputed from the counts.
pub fn decode_csv(
    level: RegionLevel,
    raw: &str,
    generated_at: DateTime<Utc>,
) -> PipelineResult<RegionSnapshotTable> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(raw.as_bytes());

    let header_error = |reason: String| PipelineError::Schema {
        record: format!("{level} table header"),
        reason,
    };
    let headers = reader.headers().map_err(|e| header_error(e.to_string()))?;
    let found: Vec<&str> = headers
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}'))
        .collect();
    if found != CSV_COLUMNS {
        return Err(header_error(format!("expected {CSV_COLUMNS:?}, found {found:?}")));
    }

    let mut table = RegionSnapshotTable::new(level, generated_at);
    for (idx, row) in reader.deserialize::<TableRow>().enumerate() {
        let row = row.map_err(|e| {
            let line = e.position().map_or(idx as u64 + 2, |pos| pos.line());
            PipelineError::Schema {
                record: format!("{level} table row {line}"),
                reason: e.to_string(),
            }
        })?;
        table.insert(CountRecord::new(
            row.region,
            Counts::new(row.confirmed, row.suspected, row.cured, row.dead),
            generated_at,
        ));
    }

    Ok(table)
}
