//! Aggregation of raw snapshots into the dashboard's two products.
//!
//! - [`Aggregator::build_daily_series`]: one national-total record per calendar
//!   day, with day-over-day deltas.
//! - [`Aggregator::build_region_table`]: current per-region counts keyed by
//!   canonical name and classified into severity bands.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::boundary::BoundaryDataset;
use crate::data_sources::schema::{AreaStat, DayCount, OverallHistoryRecord, parse_records};
use crate::error::PipelineResult;
use crate::model::{
    CountRecord, Counts, DailyDelta, DailyRecord, NationalDailySeries, NationalObservation,
    RegionLevel, RegionSnapshotTable,
};
use crate::normalize::NameNormalizer;

/// Provinces shown as single entries on the city-level map.
///
/// The four municipalities are province-level in the source data; Taiwan and
/// Hong Kong are included the same way.
pub const CITY_LEVEL_PROVINCES: [&str; 6] = ["北京", "上海", "天津", "重庆", "台湾", "香港"];

/// National totals for the days before live API coverage began.
///
/// (year, month, day, confirmed, suspected, cured, dead)
const EARLY_BASELINE: &[(i32, u32, u32, u64, u64, u64, u64)] = &[
    (2020, 1, 10, 41, 0, 2, 1),
    (2020, 1, 11, 41, 0, 6, 1),
    (2020, 1, 12, 41, 0, 7, 1),
    (2020, 1, 13, 41, 0, 7, 1),
    (2020, 1, 14, 41, 0, 7, 1),
    (2020, 1, 15, 41, 0, 12, 2),
    (2020, 1, 16, 45, 0, 15, 2),
    (2020, 1, 17, 62, 0, 19, 2),
    (2020, 1, 18, 121, 0, 24, 3),
    (2020, 1, 19, 198, 0, 25, 3),
];

/// Built-in baseline segment.
pub fn early_baseline() -> Vec<(NaiveDate, Counts)> {
    EARLY_BASELINE
        .iter()
        .filter_map(|&(y, m, d, confirmed, suspected, cured, dead)| {
            NaiveDate::from_ymd_opt(y, m, d)
                .map(|date| (date, Counts::new(confirmed, suspected, cured, dead)))
        })
        .collect()
}

/// Normalizer and boundary dataset for one administrative level.
#[derive(Debug, Clone)]
pub struct RegionContext {
    pub normalizer: NameNormalizer,
    pub boundary: BoundaryDataset,
}

impl RegionContext {
    pub fn new(normalizer: NameNormalizer, boundary: BoundaryDataset) -> Self {
        Self {
            normalizer,
            boundary,
        }
    }
}

/// Turns raw snapshots into series and tables.
#[derive(Debug, Clone)]
pub struct Aggregator {
    offset: FixedOffset,
    baseline: Vec<(NaiveDate, Counts)>,
    provinces: RegionContext,
    cities: RegionContext,
    city_level_provinces: HashSet<String>,
}

impl Aggregator {
    /// `offset` decides which calendar day an observation belongs to.
    pub fn new(offset: FixedOffset, provinces: RegionContext, cities: RegionContext) -> Self {
        Self {
            offset,
            baseline: early_baseline(),
            provinces,
            cities,
            city_level_provinces: CITY_LEVEL_PROVINCES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace the baseline segment prepended to every daily series.
    pub fn with_baseline(mut self, baseline: Vec<(NaiveDate, Counts)>) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn context(&self, level: RegionLevel) -> &RegionContext {
        match level {
            RegionLevel::Province => &self.provinces,
            RegionLevel::City => &self.cities,
        }
    }

    /// Resample an irregular national history to one record per calendar day.
    ///
    /// Within a day the latest observation wins; equal timestamps resolve to
    /// the one that came later in `history`. Baseline days earlier than the
    /// first live day are prepended, days with no observation repeat the
    /// previous day's counts, and the first day has no delta.
    pub fn build_daily_series(&self, history: &[NationalObservation]) -> NationalDailySeries {
        let mut days: BTreeMap<NaiveDate, (DateTime<Utc>, Counts)> = BTreeMap::new();
        for obs in history {
            let date = obs.observed_at.with_timezone(&self.offset).date_naive();
            match days.get(&date) {
                Some((seen_at, _)) if *seen_at > obs.observed_at => {}
                _ => {
                    days.insert(date, (obs.observed_at, obs.counts));
                }
            }
        }

        let mut by_date: BTreeMap<NaiveDate, Counts> =
            days.into_iter().map(|(date, (_, counts))| (date, counts)).collect();

        let first_live = by_date.keys().next().copied();
        for (date, counts) in &self.baseline {
            if first_live.is_none_or(|first| *date < first) {
                by_date.insert(*date, *counts);
            }
        }

        let (Some(&first), Some(&last)) = (by_date.keys().next(), by_date.keys().next_back())
        else {
            return NationalDailySeries::default();
        };

        let mut records: Vec<DailyRecord> = Vec::new();
        let mut previous: Option<Counts> = None;
        for date in first.iter_days().take_while(|d| *d <= last) {
            let counts = match (by_date.get(&date), previous) {
                (Some(counts), _) => *counts,
                (None, Some(prev)) => prev,
                // `first` is always present.
                (None, None) => continue,
            };
            records.push(DailyRecord {
                date,
                counts,
                delta: previous.map(|prev| DailyDelta::between(&prev, &counts)),
            });
            previous = Some(counts);
        }

        debug!(days = records.len(), "Daily series built");
        NationalDailySeries { records }
    }

    /// Build the current table for one level from the raw area-stat array.
    ///
    /// Fails on the first record that lacks an expected field. Regions whose
    /// normalized name is not in the level's boundary dataset are left out and
    /// listed in `unresolved`.
    pub fn build_region_table(
        &self,
        snapshot: &[Value],
        level: RegionLevel,
    ) -> PipelineResult<RegionSnapshotTable> {
        let stats: Vec<AreaStat> = parse_records(snapshot, "provinceName")?;
        let now = Utc::now();

        let candidates: Vec<(&str, Counts)> = match level {
            RegionLevel::Province => stats.iter().map(|s| (s.short_name(), s.counts())).collect(),
            RegionLevel::City => stats
                .iter()
                .flat_map(|s| {
                    if self.city_level_provinces.contains(s.short_name()) {
                        vec![(s.short_name(), s.counts())]
                    } else {
                        s.cities
                            .iter()
                            .map(|c| (c.city_name.as_str(), c.counts()))
                            .collect()
                    }
                })
                .collect(),
        };

        let ctx = self.context(level);
        let mut table = RegionSnapshotTable::new(level, now);
        for (raw, counts) in candidates {
            let canonical = ctx.normalizer.normalize(raw);
            if !ctx.boundary.contains(&canonical) {
                warn!(
                    level = %level,
                    raw = raw,
                    normalized = %canonical,
                    "Unresolved region name, dropping from map"
                );
                table.unresolved.push(canonical);
                continue;
            }
            if !table.insert(CountRecord::new(canonical.clone(), counts, now)) {
                warn!(level = %level, region = %canonical, "Duplicate region, keeping first");
            }
        }

        debug!(
            level = %level,
            regions = table.len(),
            unresolved = table.unresolved.len(),
            "Region table built"
        );
        Ok(table)
    }
}

/// National history from the `qq` daily-counts array.
pub fn day_counts_history(
    records: &[Value],
    offset: FixedOffset,
) -> PipelineResult<Vec<NationalObservation>> {
    let days: Vec<DayCount> = parse_records(records, "date")?;
    days.iter().map(|d| d.to_observation(offset)).collect()
}

/// National history from the overall-history array.
///
/// The live trend is built from the `qq` daily array, stamped at local
/// midnight. This is the entry point for irregular, intra-day history such as
/// archived `overall_history` documents replayed offline; `build_daily_series`
/// keeps the last observation of each day.
pub fn overall_history(records: &[Value]) -> PipelineResult<Vec<NationalObservation>> {
    let rows: Vec<OverallHistoryRecord> = parse_records(records, "updateTime")?;
    rows.iter().map(|r| r.to_observation()).collect()
}
