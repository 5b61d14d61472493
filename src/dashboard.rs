//! Dashboard orchestration.
//!
//! One refresh cycle fetches the two primary documents, rebuilds the daily
//! series, global totals and both region tables, and hands the history
//! endpoints to the archival pool. Primary failures propagate to the caller;
//! readers then get the last known-good artifact flagged as stale, or an
//! error if there has never been one.
//!
//! # Usage
//!
//! ```ignore
//! let dashboard = Dashboard::new(fetcher, aggregator, indexer, tables, storage, &config);
//! dashboard.refresh().await?;
//! let trend = dashboard.trend().await?;
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::aggregation::{Aggregator, day_counts_history};
use crate::boundary::BoundaryDataset;
use crate::config::AppConfig;
use crate::data_sources::schema::{AreaHistoryRecord, extract_records, local_midnight, parse_global_totals, parse_records};
use crate::data_sources::{ArchivalPool, EndpointId, SnapshotFetcher};
use crate::error::{PipelineError, PipelineResult};
use crate::model::{GlobalTotals, NationalDailySeries, RegionLevel, RegionSnapshotTable};
use crate::normalize::NameNormalizer;
use crate::render::{FRAME_PATTERN, VideoEncoder, animation_frames, clear_frames, write_frame_specs};
use crate::storage::Storage;
use crate::table_cache::TableCache;
use crate::temporal::{TemporalIndexer, TemporalSnapshotIndex};

/// How often a reader polls for a table regenerated by someone else.
const REGEN_POLL: Duration = Duration::from_millis(200);
const REGEN_POLL_ATTEMPTS: u32 = 3;

/// An artifact together with whether it is a fallback.
#[derive(Debug, Clone, Serialize)]
pub struct Served<T> {
    pub data: T,
    /// True when the artifact is the last known-good one after a failed refresh.
    pub stale: bool,
    pub generated_at: DateTime<Utc>,
}

impl<T> Served<T> {
    fn fresh(data: T, generated_at: DateTime<Utc>) -> Self {
        Self {
            data,
            stale: false,
            generated_at,
        }
    }

    fn stale(data: T, generated_at: DateTime<Utc>) -> Self {
        Self {
            data,
            stale: true,
            generated_at,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Served<U> {
        Served {
            data: f(self.data),
            stale: self.stale,
            generated_at: self.generated_at,
        }
    }
}

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub refreshed_at: DateTime<Utc>,
    pub days: usize,
    pub provinces: usize,
    pub cities: usize,
    /// Normalized names with no boundary match, across both levels.
    pub unresolved: Vec<String>,
}

#[derive(Default)]
struct LastGood {
    trend: Option<(NationalDailySeries, DateTime<Utc>)>,
    totals: Option<(GlobalTotals, DateTime<Utc>)>,
    tables: HashMap<RegionLevel, RegionSnapshotTable>,
}

/// Wires the fetcher, aggregator, indexer and stores together.
#[derive(Clone)]
pub struct Dashboard {
    fetcher: SnapshotFetcher,
    archival: ArchivalPool,
    aggregator: Arc<Aggregator>,
    indexer: TemporalIndexer,
    tables: TableCache,
    storage: Storage,
    encoder: VideoEncoder,
    frames_dir: PathBuf,
    max_age: Duration,
    last_good: Arc<RwLock<LastGood>>,
}

impl Dashboard {
    /// Create a new dashboard from prepared components.
    pub fn new(
        fetcher: SnapshotFetcher,
        aggregator: Aggregator,
        indexer: TemporalIndexer,
        tables: TableCache,
        storage: Storage,
        config: &AppConfig,
    ) -> Self {
        Self {
            archival: ArchivalPool::new(fetcher.clone(), config.archival_workers),
            fetcher,
            aggregator: Arc::new(aggregator),
            indexer,
            max_age: tables.max_age(),
            tables,
            storage,
            encoder: VideoEncoder::new(&config.encoder_program, config.encoder_fps),
            frames_dir: config.frames_dir.clone(),
            last_good: Arc::new(RwLock::new(LastGood::default())),
        }
    }

    pub fn frames_dir(&self) -> &Path {
        &self.frames_dir
    }

    /// Boundary dataset of a level; also the region universe of the time-lapse.
    pub fn boundary(&self, level: RegionLevel) -> &BoundaryDataset {
        &self.aggregator.context(level).boundary
    }

    /// Run one full cycle.
    ///
    /// Both primary products are attempted even if one fails; the first
    /// failure is returned after the other has been stored.
    pub async fn refresh(&self) -> PipelineResult<RefreshReport> {
        self.spawn_archival();

        let (trend, tables) = tokio::join!(self.refresh_trend(), self.refresh_tables());

        let mut report = RefreshReport {
            refreshed_at: Utc::now(),
            days: 0,
            provinces: 0,
            cities: 0,
            unresolved: Vec::new(),
        };
        let mut first_error = None;

        match trend {
            Ok((series, _)) => report.days = series.len(),
            Err(e) => {
                warn!(error = %e, "Trend refresh failed");
                first_error.get_or_insert(e);
            }
        }
        match tables {
            Ok([provinces, cities]) => {
                report.provinces = provinces.len();
                report.cities = cities.len();
                report.unresolved.extend(provinces.unresolved);
                report.unresolved.extend(cities.unresolved);
            }
            Err(e) => {
                warn!(error = %e, "Region table refresh failed");
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            days = report.days,
            provinces = report.provinces,
            cities = report.cities,
            unresolved = report.unresolved.len(),
            "Refresh cycle complete"
        );
        Ok(report)
    }

    /// Daily national series, refetched once the cached one is older than the max age.
    pub async fn trend(&self) -> PipelineResult<Served<NationalDailySeries>> {
        if let Some((series, at)) = self.last_good.read().await.trend.clone() {
            if self.is_fresh(at) {
                return Ok(Served::fresh(series, at));
            }
        }

        match self.refresh_trend().await {
            Ok((series, _)) => Ok(Served::fresh(series, Utc::now())),
            Err(e) => match self.last_good.read().await.trend.clone() {
                Some((series, at)) => {
                    warn!(error = %e, "Serving stale trend series");
                    Ok(Served::stale(series, at))
                }
                None => Err(e),
            },
        }
    }

    /// Headline totals, with the same freshness rules as [`Dashboard::trend`].
    pub async fn totals(&self) -> PipelineResult<Served<GlobalTotals>> {
        if let Some((totals, at)) = self.last_good.read().await.totals.clone() {
            if self.is_fresh(at) {
                return Ok(Served::fresh(totals, at));
            }
        }

        match self.refresh_trend().await {
            Ok((_, totals)) => Ok(Served::fresh(totals, Utc::now())),
            Err(e) => match self.last_good.read().await.totals.clone() {
                Some((totals, at)) => {
                    warn!(error = %e, "Serving stale global totals");
                    Ok(Served::stale(totals, at))
                }
                None => Err(e),
            },
        }
    }

    /// Current table for a level.
    ///
    /// A fresh table on disk is served as-is. Otherwise, including when the
    /// file cannot be parsed, the tables are regenerated and re-read; if that fails the last known-good table is
    /// served as stale, and with none at all the result is
    /// [`PipelineError::StaleTable`].
    pub async fn region_table(&self, level: RegionLevel) -> PipelineResult<Served<RegionSnapshotTable>> {
        match self.tables.read_fresh(level).await {
            Ok(Some(table)) => {
                let at = table.generated_at;
                return Ok(Served::fresh(table, at));
            }
            Ok(None) => {}
            Err(e) => warn!(level = %level, error = %e, "Unreadable region table, regenerating"),
        }

        let regenerated = match self.refresh_tables().await {
            Ok(_) => self
                .tables
                .wait_for_fresh(level, REGEN_POLL_ATTEMPTS, REGEN_POLL)
                .await,
            Err(e) => Err(e),
        };

        match regenerated {
            Ok(table) => {
                let at = table.generated_at;
                Ok(Served::fresh(table, at))
            }
            Err(e) => {
                let fallback = match self.last_good.read().await.tables.get(&level).cloned() {
                    Some(table) => Some(table),
                    None => self
                        .tables
                        .read(level)
                        .await
                        .ok()
                        .flatten()
                        .map(|cached| cached.table),
                };
                match fallback {
                    Some(table) => {
                        warn!(level = %level, error = %e, "Serving stale region table");
                        let at = table.generated_at;
                        Ok(Served::stale(table, at))
                    }
                    None => Err(PipelineError::StaleTable {
                        level: level.to_string(),
                        age_secs: None,
                    }),
                }
            }
        }
    }

    /// Index the accumulated province history over an inclusive local date range.
    pub async fn timeline(&self, start: NaiveDate, end: NaiveDate) -> PipelineResult<TemporalSnapshotIndex> {
        let offset = self.aggregator.offset();
        let empty = || PipelineError::EmptyRange { start, end };
        let from = local_midnight(start, offset).ok_or_else(empty)?;
        let until = local_midnight(end, offset).ok_or_else(empty)? + TimeDelta::days(1);

        let history = self.storage.load_observations(from, until).await?;
        self.indexer
            .build_index(&history, self.boundary(RegionLevel::Province), start, end)
    }

    /// Write one frame spec per bucket of the range to the frames directory.
    pub async fn export_animation(&self, start: NaiveDate, end: NaiveDate) -> PipelineResult<Vec<PathBuf>> {
        let index = self.timeline(start, end).await?;
        let frames = animation_frames(&index, self.boundary(RegionLevel::Province));
        write_frame_specs(&self.frames_dir, &frames).await
    }

    /// Encode the rasterised frames into `output`, then delete the images.
    pub async fn encode_animation(&self, output: &Path) -> PipelineResult<usize> {
        let pattern = self.frames_dir.join(FRAME_PATTERN);
        self.encoder.encode(&pattern, output).await?;
        clear_frames(&self.frames_dir).await
    }

    fn is_fresh(&self, at: DateTime<Utc>) -> bool {
        (Utc::now() - at).to_std().map(|age| age <= self.max_age).unwrap_or(true)
    }

    /// Fetch the national document and rebuild the series and totals.
    async fn refresh_trend(&self) -> PipelineResult<(NationalDailySeries, GlobalTotals)> {
        let doc = self.fetcher.fetch(EndpointId::Qq).await?;
        let records = extract_records(EndpointId::Qq, &doc)?;
        let history = day_counts_history(&records, self.aggregator.offset())?;
        let series = self.aggregator.build_daily_series(&history);
        let totals = parse_global_totals(&doc)?;

        let now = Utc::now();
        let mut last_good = self.last_good.write().await;
        last_good.trend = Some((series.clone(), now));
        last_good.totals = Some((totals.clone(), now));

        info!(days = series.len(), "Trend series refreshed");
        Ok((series, totals))
    }

    /// Fetch the area document and rebuild and persist both tables.
    async fn refresh_tables(&self) -> PipelineResult<[RegionSnapshotTable; 2]> {
        let doc = self.fetcher.fetch(EndpointId::Dxy).await?;
        let records = extract_records(EndpointId::Dxy, &doc)?;

        let provinces = self.aggregator.build_region_table(&records, RegionLevel::Province)?;
        let cities = self.aggregator.build_region_table(&records, RegionLevel::City)?;
        self.tables.write(&provinces).await?;
        self.tables.write(&cities).await?;
        info!(
            provinces = provinces.len(),
            cities = cities.len(),
            confirmed = provinces.totals().confirmed,
            "Region tables rebuilt"
        );

        let mut last_good = self.last_good.write().await;
        last_good.tables.insert(RegionLevel::Province, provinces.clone());
        last_good.tables.insert(RegionLevel::City, cities.clone());

        Ok([provinces, cities])
    }

    /// Hand the history endpoints to the archival pool.
    ///
    /// The area history is also folded into storage for the time-lapse.
    fn spawn_archival(&self) {
        self.archival.spawn(EndpointId::ProvinceCityHistory);
        self.archival.spawn(EndpointId::OverallHistory);

        let storage = self.storage.clone();
        let normalizer = self.aggregator.context(RegionLevel::Province).normalizer.clone();
        self.archival.spawn_with(EndpointId::AreaHistory, move |doc| async move {
            ingest_area_history(&storage, &normalizer, &doc).await.map(|_| ())
        });
    }
}

/// Store every record of an area-history document under its canonical name.
pub async fn ingest_area_history(
    storage: &Storage,
    normalizer: &NameNormalizer,
    doc: &Value,
) -> PipelineResult<u64> {
    let records = extract_records(EndpointId::AreaHistory, doc)?;
    let rows: Vec<AreaHistoryRecord> = parse_records(&records, "provinceShortName")?;

    let observations = rows
        .iter()
        .map(|row| {
            let mut record = row.to_count_record()?;
            record.region = normalizer.normalize(&record.region);
            Ok(record)
        })
        .collect::<PipelineResult<Vec<_>>>()?;

    let inserted = storage.insert_observations(&observations).await?;
    info!(records = observations.len(), inserted, "Area history ingested");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::{Json, Router, http::StatusCode, routing::get};
    use chrono::FixedOffset;
    use serde_json::json;
    use tokio::net::TcpListener;

    use crate::aggregation::RegionContext;
    use crate::data_sources::{Archive, EndpointRegistry, RetryPolicy};

    fn cst() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("epidash-dashboard-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn qq_doc() -> Value {
        json!({
            "data": {
                "wuwei_ww_cn_day_counts": [
                    {"date": "01/21", "confirm": 440, "suspect": 37, "dead": 9, "heal": 25},
                    {"date": "01/20", "confirm": 291, "suspect": 54, "dead": 6, "heal": 25}
                ],
                "wuwei_ww_global_vars": [
                    {"confirmCount": 440, "suspectCount": 37, "deadCount": 9, "cure": 25, "update_time": "2020-01-21 23:00"}
                ]
            }
        })
    }

    fn dxy_doc() -> Value {
        json!({
            "data": {
                "getAreaStat": [
                    {
                        "provinceName": "湖北省", "provinceShortName": "湖北",
                        "confirmedCount": 270, "suspectedCount": 11, "curedCount": 25, "deadCount": 6,
                        "cities": [
                            {"cityName": "武汉", "confirmedCount": 258, "suspectedCount": 0, "curedCount": 25, "deadCount": 6}
                        ]
                    },
                    {
                        "provinceName": "北京市", "provinceShortName": "北京",
                        "confirmedCount": 5, "suspectedCount": 0, "curedCount": 0, "deadCount": 0,
                        "cities": []
                    }
                ]
            }
        })
    }

    fn area_history_doc() -> Value {
        json!({
            "results": [
                {"provinceShortName": "湖北", "updateTime": 1580522400000i64,
                 "confirmedCount": 100, "suspectedCount": 0, "curedCount": 0, "deadCount": 1},
                {"provinceShortName": "西藏", "updateTime": 1580522400000i64,
                 "confirmedCount": 1, "suspectedCount": 0, "curedCount": 0, "deadCount": 0}
            ]
        })
    }

    /// Upstream stub; primary endpoints answer 500 once `failing` is set.
    async fn spawn_upstream(failing: Arc<AtomicBool>) -> String {
        let check = move |doc: Value| {
            let failing = failing.clone();
            move || async move {
                if failing.load(Ordering::SeqCst) {
                    Err(StatusCode::INTERNAL_SERVER_ERROR)
                } else {
                    Ok(Json(doc))
                }
            }
        };
        let app = Router::new()
            .route("/qq", get(check(qq_doc())))
            .route("/dxy", get(check(dxy_doc())))
            .route("/area_history", get(|| async { Json(area_history_doc()) }))
            .route("/overall_history", get(|| async { Json(json!({"results": []})) }))
            .route("/province_city_history", get(|| async { Json(json!([])) }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn dashboard(name: &str, base_url: &str, max_age: Duration) -> Dashboard {
        let dir = temp_dir(name);
        let config = AppConfig {
            frames_dir: dir.join("frames"),
            encoder_program: "true".to_string(),
            ..AppConfig::default()
        };
        let registry = EndpointRegistry::rooted_at(base_url).with_retry_all(RetryPolicy::none());
        let fetcher = SnapshotFetcher::new(registry, Archive::disabled(), Duration::from_secs(5)).unwrap();

        let provinces = BoundaryDataset::from_names(RegionLevel::Province, "NL_NAME_1", ["湖北", "北京", "西藏自治区"]);
        let cities = BoundaryDataset::from_names(RegionLevel::City, "NAME", ["武汉", "北京"]);
        let aggregator = Aggregator::new(
            cst(),
            RegionContext::new(NameNormalizer::provinces(), provinces),
            RegionContext::new(NameNormalizer::cities(), cities),
        );
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        Dashboard::new(
            fetcher,
            aggregator,
            TemporalIndexer::new(TimeDelta::minutes(30), cst()),
            TableCache::new(dir.join("data"), max_age),
            storage,
            &config,
        )
    }

    #[tokio::test]
    async fn test_refresh_builds_all_products() {
        let base = spawn_upstream(Arc::new(AtomicBool::new(false))).await;
        let dashboard = dashboard("refresh", &base, Duration::from_secs(3600)).await;

        let report = dashboard.refresh().await.unwrap();
        assert_eq!(report.provinces, 2);
        assert_eq!(report.cities, 2);

        let trend = dashboard.trend().await.unwrap();
        assert!(!trend.stale);
        assert_eq!(trend.data.latest().unwrap().counts.confirmed, 440);

        let totals = dashboard.totals().await.unwrap();
        assert_eq!(totals.data.counts.confirmed, 440);

        let cities = dashboard.region_table(RegionLevel::City).await.unwrap();
        assert!(!cities.stale);
        assert!(cities.data.get("武汉").is_some());
        assert!(cities.data.get("北京").is_some());
    }

    #[tokio::test]
    async fn test_stale_fallback_after_upstream_failure() {
        let failing = Arc::new(AtomicBool::new(false));
        let base = spawn_upstream(failing.clone()).await;
        // Zero max age: every read goes back upstream.
        let dashboard = dashboard("stale", &base, Duration::ZERO).await;

        dashboard.refresh().await.unwrap();
        failing.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let trend = dashboard.trend().await.unwrap();
        assert!(trend.stale);
        assert_eq!(trend.data.latest().unwrap().counts.confirmed, 440);

        let provinces = dashboard.region_table(RegionLevel::Province).await.unwrap();
        assert!(provinces.stale);
        assert_eq!(provinces.data.len(), 2);

        assert!(dashboard.refresh().await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_table_falls_back_to_last_good() {
        let failing = Arc::new(AtomicBool::new(false));
        let base = spawn_upstream(failing.clone()).await;
        let dashboard = dashboard("corrupt", &base, Duration::from_secs(3600)).await;

        dashboard.refresh().await.unwrap();
        failing.store(true, Ordering::SeqCst);
        std::fs::write(dashboard.tables.path(RegionLevel::Province), "garbage\n").unwrap();

        let provinces = dashboard.region_table(RegionLevel::Province).await.unwrap();
        assert!(provinces.stale);
        assert_eq!(provinces.data.len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_table_is_regenerated() {
        let base = spawn_upstream(Arc::new(AtomicBool::new(false))).await;
        let dashboard = dashboard("regenerate", &base, Duration::from_secs(3600)).await;

        dashboard.refresh().await.unwrap();
        std::fs::write(dashboard.tables.path(RegionLevel::City), "garbage\n").unwrap();

        let cities = dashboard.region_table(RegionLevel::City).await.unwrap();
        assert!(!cities.stale);
        assert!(cities.data.get("武汉").is_some());
    }

    #[tokio::test]
    async fn test_no_fallback_without_prior_success() {
        let base = spawn_upstream(Arc::new(AtomicBool::new(true))).await;
        let dashboard = dashboard("unavailable", &base, Duration::from_secs(3600)).await;

        assert!(dashboard.trend().await.is_err());
        let err = dashboard.region_table(RegionLevel::City).await.unwrap_err();
        assert!(matches!(err, PipelineError::StaleTable { .. }));
    }

    #[tokio::test]
    async fn test_area_history_feeds_timeline() {
        let base = spawn_upstream(Arc::new(AtomicBool::new(false))).await;
        let dashboard = dashboard("timeline", &base, Duration::from_secs(3600)).await;

        let inserted = ingest_area_history(
            &dashboard.storage,
            &NameNormalizer::provinces(),
            &area_history_doc(),
        )
        .await
        .unwrap();
        assert_eq!(inserted, 2);

        // 1580522400000 ms is 2020-02-01 10:00 at UTC+8.
        let day = NaiveDate::from_ymd_opt(2020, 2, 1).unwrap();
        let index = dashboard.timeline(day, day).await.unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.buckets[0].regions.contains_key("西藏自治区"));

        let paths = dashboard.export_animation(day, day).await.unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].exists());

        let other = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap();
        let err = dashboard.timeline(other, other).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyRange { .. }));
    }

    #[tokio::test]
    async fn test_encode_animation_clears_images() {
        let base = spawn_upstream(Arc::new(AtomicBool::new(false))).await;
        let dashboard = dashboard("encode", &base, Duration::from_secs(3600)).await;
        std::fs::create_dir_all(dashboard.frames_dir()).unwrap();
        std::fs::write(dashboard.frames_dir().join("0.png"), b"png").unwrap();

        let removed = dashboard
            .encode_animation(&dashboard.frames_dir().join("out.mp4"))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
