//! Data models for epidash.
//!
//! These are plain structures with no framework types in them. The renderer
//! adapters in [`crate::render`] and the HTTP layer consume them as-is.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// The four counters every statistics source reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub confirmed: u64,
    pub suspected: u64,
    pub cured: u64,
    pub dead: u64,
}

impl Counts {
    pub fn new(confirmed: u64, suspected: u64, cured: u64, dead: u64) -> Self {
        Self {
            confirmed,
            suspected,
            cured,
            dead,
        }
    }

    /// Read a single metric.
    pub fn get(&self, metric: Metric) -> u64 {
        match metric {
            Metric::Confirmed => self.confirmed,
            Metric::Suspected => self.suspected,
            Metric::Cured => self.cured,
            Metric::Dead => self.dead,
        }
    }
}

/// One of the tracked counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Confirmed,
    Suspected,
    Cured,
    Dead,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::Confirmed,
        Metric::Suspected,
        Metric::Cured,
        Metric::Dead,
    ];

    /// Get a human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Metric::Confirmed => "confirmed",
            Metric::Suspected => "suspected",
            Metric::Cured => "cured",
            Metric::Dead => "dead",
        }
    }
}

/// A single region's counts at a point in time.
///
/// `cured + dead <= confirmed` is not enforced; upstream data violates it
/// transiently and the counts are passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRecord {
    /// Region key. Canonical once it has been through the normalizer.
    pub region: String,

    #[serde(flatten)]
    pub counts: Counts,

    /// When the source observed these counts (UTC).
    pub observed_at: DateTime<Utc>,
}

impl CountRecord {
    pub fn new(region: impl Into<String>, counts: Counts, observed_at: DateTime<Utc>) -> Self {
        Self {
            region: region.into(),
            counts,
            observed_at,
        }
    }
}

/// A national-total observation from an irregularly sampled history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NationalObservation {
    pub observed_at: DateTime<Utc>,
    pub counts: Counts,
}

/// Choropleth colour class for a count.
///
/// Bounds are right-exclusive: 0; 1-9; 10-99; 100-499; 500-999; 1000-9999; 10000+.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SeverityBand {
    #[serde(rename = "0")]
    None,
    #[serde(rename = "1-9")]
    Sporadic,
    #[serde(rename = "10-99")]
    Low,
    #[serde(rename = "100-499")]
    Moderate,
    #[serde(rename = "500-999")]
    High,
    #[serde(rename = "1000-9999")]
    Severe,
    #[serde(rename = "10000+")]
    Extreme,
}

impl SeverityBand {
    pub const ALL: [SeverityBand; 7] = [
        SeverityBand::None,
        SeverityBand::Sporadic,
        SeverityBand::Low,
        SeverityBand::Moderate,
        SeverityBand::High,
        SeverityBand::Severe,
        SeverityBand::Extreme,
    ];

    /// Classify a count.
    pub fn from_count(count: u64) -> Self {
        match count {
            0 => SeverityBand::None,
            1..=9 => SeverityBand::Sporadic,
            10..=99 => SeverityBand::Low,
            100..=499 => SeverityBand::Moderate,
            500..=999 => SeverityBand::High,
            1000..=9999 => SeverityBand::Severe,
            _ => SeverityBand::Extreme,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SeverityBand::None => "0",
            SeverityBand::Sporadic => "1-9",
            SeverityBand::Low => "10-99",
            SeverityBand::Moderate => "100-499",
            SeverityBand::High => "500-999",
            SeverityBand::Severe => "1000-9999",
            SeverityBand::Extreme => "10000+",
        }
    }
}

impl fmt::Display for SeverityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SeverityBand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SeverityBand::ALL
            .into_iter()
            .find(|band| band.label() == s)
            .ok_or_else(|| format!("unknown severity band '{s}'"))
    }
}

/// Severity band of every metric of one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricBands {
    pub confirmed: SeverityBand,
    pub suspected: SeverityBand,
    pub cured: SeverityBand,
    pub dead: SeverityBand,
}

impl MetricBands {
    pub fn from_counts(counts: &Counts) -> Self {
        Self {
            confirmed: SeverityBand::from_count(counts.confirmed),
            suspected: SeverityBand::from_count(counts.suspected),
            cured: SeverityBand::from_count(counts.cured),
            dead: SeverityBand::from_count(counts.dead),
        }
    }

    pub fn get(&self, metric: Metric) -> SeverityBand {
        match metric {
            Metric::Confirmed => self.confirmed,
            Metric::Suspected => self.suspected,
            Metric::Cured => self.cured,
            Metric::Dead => self.dead,
        }
    }
}

/// Administrative level a table or boundary dataset covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionLevel {
    Province,
    City,
}

impl RegionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionLevel::Province => "province",
            RegionLevel::City => "city",
        }
    }
}

impl fmt::Display for RegionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A region's current record plus its derived bands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEntry {
    pub record: CountRecord,
    pub bands: MetricBands,
}

/// Current per-region counts, keyed by canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSnapshotTable {
    pub level: RegionLevel,
    pub generated_at: DateTime<Utc>,
    pub entries: BTreeMap<String, RegionEntry>,

    /// Normalized names that had no match in the boundary dataset.
    #[serde(default)]
    pub unresolved: Vec<String>,
}

impl RegionSnapshotTable {
    pub fn new(level: RegionLevel, generated_at: DateTime<Utc>) -> Self {
        Self {
            level,
            generated_at,
            entries: BTreeMap::new(),
            unresolved: Vec::new(),
        }
    }

    /// Insert a record, deriving its bands. Returns false if the region was already present.
    pub fn insert(&mut self, record: CountRecord) -> bool {
        if self.entries.contains_key(&record.region) {
            return false;
        }
        let bands = MetricBands::from_counts(&record.counts);
        self.entries
            .insert(record.region.clone(), RegionEntry { record, bands });
        true
    }

    pub fn get(&self, region: &str) -> Option<&RegionEntry> {
        self.entries.get(region)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of every region's counts.
    pub fn totals(&self) -> Counts {
        self.entries.values().fold(Counts::default(), |acc, e| {
            let c = &e.record.counts;
            Counts::new(
                acc.confirmed + c.confirmed,
                acc.suspected + c.suspected,
                acc.cured + c.cured,
                acc.dead + c.dead,
            )
        })
    }
}

/// Day-over-day change of every metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyDelta {
    pub confirmed: i64,
    pub suspected: i64,
    pub cured: i64,
    pub dead: i64,
}

impl DailyDelta {
    pub fn between(yesterday: &Counts, today: &Counts) -> Self {
        let diff = |a: u64, b: u64| b as i64 - a as i64;
        Self {
            confirmed: diff(yesterday.confirmed, today.confirmed),
            suspected: diff(yesterday.suspected, today.suspected),
            cured: diff(yesterday.cured, today.cured),
            dead: diff(yesterday.dead, today.dead),
        }
    }

    pub fn get(&self, metric: Metric) -> i64 {
        match metric {
            Metric::Confirmed => self.confirmed,
            Metric::Suspected => self.suspected,
            Metric::Cured => self.cured,
            Metric::Dead => self.dead,
        }
    }
}

/// National totals for one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub date: NaiveDate,

    #[serde(flatten)]
    pub counts: Counts,

    /// Absent on the first day of a series.
    pub delta: Option<DailyDelta>,
}

/// One record per calendar day, ordered by date, without gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NationalDailySeries {
    pub records: Vec<DailyRecord>,
}

impl NationalDailySeries {
    pub fn first_date(&self) -> Option<NaiveDate> {
        self.records.first().map(|r| r.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.records.last().map(|r| r.date)
    }

    pub fn latest(&self) -> Option<&DailyRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Headline totals from the global-totals object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTotals {
    #[serde(flatten)]
    pub counts: Counts,

    /// Upstream's own update time string, passed through verbatim.
    pub update_time: String,
}
