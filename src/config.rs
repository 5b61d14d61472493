//! Process configuration.
//!
//! Every setting comes from an `EPIDASH_*` environment variable and falls
//! back to a default when the variable is unset or does not parse.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, TimeDelta, Utc};

/// Default port if not specified via environment variable.
pub const DEFAULT_PORT: u16 = 9102;

/// Default database path if not specified via environment variable.
pub const DEFAULT_DB_URL: &str = "sqlite:epidash.db?mode=rwc";

/// Runtime settings for the server and the refresh pipeline.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,

    /// Directory for the persisted region tables.
    pub data_dir: PathBuf,
    /// Directory for raw archived upstream documents.
    pub archive_dir: PathBuf,
    /// Directory for animation frame specs and images.
    pub frames_dir: PathBuf,

    pub province_geojson: PathBuf,
    pub province_name_property: String,
    pub city_geojson: PathBuf,
    pub city_name_property: String,

    /// Overrides every upstream URL with `{base}/{endpoint}` when set.
    pub upstream_base_url: Option<String>,

    pub refresh_interval: Duration,
    pub table_max_age: Duration,
    pub bucket_interval: TimeDelta,
    /// Offset defining calendar days and frame labels.
    pub utc_offset: FixedOffset,
    pub archival_workers: usize,
    pub request_timeout: Duration,

    pub encoder_program: String,
    pub encoder_fps: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_URL.to_string(),
            data_dir: PathBuf::from("data"),
            archive_dir: PathBuf::from("history_data"),
            frames_dir: PathBuf::from("frames"),
            province_geojson: PathBuf::from("maps/china_provinces.geojson"),
            province_name_property: "NL_NAME_1".to_string(),
            city_geojson: PathBuf::from("maps/china_cities.geojson"),
            city_name_property: "NAME".to_string(),
            upstream_base_url: None,
            refresh_interval: Duration::from_secs(60 * 60),
            table_max_age: Duration::from_secs(60 * 60),
            bucket_interval: TimeDelta::minutes(30),
            utc_offset: china_standard_time(),
            archival_workers: 5,
            request_timeout: Duration::from_secs(30),
            encoder_program: "ffmpeg".to_string(),
            encoder_fps: 4,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let utc_offset = env::var("EPIDASH_UTC_OFFSET_HOURS")
            .ok()
            .and_then(|v| offset_hours(&v))
            .unwrap_or(defaults.utc_offset);

        Self {
            port: parse_var("EPIDASH_PORT").unwrap_or(defaults.port),
            database_url: env::var("EPIDASH_DATABASE_URL").unwrap_or(defaults.database_url),
            data_dir: path_var("EPIDASH_DATA_DIR").unwrap_or(defaults.data_dir),
            archive_dir: path_var("EPIDASH_ARCHIVE_DIR").unwrap_or(defaults.archive_dir),
            frames_dir: path_var("EPIDASH_FRAMES_DIR").unwrap_or(defaults.frames_dir),
            province_geojson: path_var("EPIDASH_PROVINCE_GEOJSON").unwrap_or(defaults.province_geojson),
            province_name_property: env::var("EPIDASH_PROVINCE_NAME_PROPERTY")
                .unwrap_or(defaults.province_name_property),
            city_geojson: path_var("EPIDASH_CITY_GEOJSON").unwrap_or(defaults.city_geojson),
            city_name_property: env::var("EPIDASH_CITY_NAME_PROPERTY")
                .unwrap_or(defaults.city_name_property),
            upstream_base_url: env::var("EPIDASH_UPSTREAM_BASE_URL").ok(),
            refresh_interval: env::var("EPIDASH_REFRESH_MINUTES")
                .ok()
                .and_then(|v| minutes(&v))
                .unwrap_or(defaults.refresh_interval),
            table_max_age: env::var("EPIDASH_TABLE_MAX_AGE_MINUTES")
                .ok()
                .and_then(|v| minutes(&v))
                .unwrap_or(defaults.table_max_age),
            bucket_interval: env::var("EPIDASH_BUCKET_MINUTES")
                .ok()
                .and_then(|v| bucket_minutes(&v))
                .unwrap_or(defaults.bucket_interval),
            utc_offset,
            archival_workers: parse_var("EPIDASH_ARCHIVAL_WORKERS").unwrap_or(defaults.archival_workers),
            request_timeout: parse_var("EPIDASH_REQUEST_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            encoder_program: env::var("EPIDASH_ENCODER").unwrap_or(defaults.encoder_program),
            encoder_fps: parse_var("EPIDASH_ENCODER_FPS").unwrap_or(defaults.encoder_fps),
        }
    }
}

/// UTC+8.
pub fn china_standard_time() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).unwrap_or(Utc.fix())
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn path_var(name: &str) -> Option<PathBuf> {
    env::var_os(name).map(PathBuf::from)
}

/// Positive whole minutes as a `Duration`; `None` on zero or overflow.
fn minutes(raw: &str) -> Option<Duration> {
    let m: u64 = raw.trim().parse().ok()?;
    m.checked_mul(60)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

/// Positive whole minutes as a bucket width.
fn bucket_minutes(raw: &str) -> Option<TimeDelta> {
    let m: i64 = raw.trim().parse().ok()?;
    TimeDelta::try_minutes(m).filter(|d| *d > TimeDelta::zero())
}

fn offset_hours(raw: &str) -> Option<FixedOffset> {
    let h: i32 = raw.trim().parse().ok()?;
    FixedOffset::east_opt(h.checked_mul(3600)?)
}
