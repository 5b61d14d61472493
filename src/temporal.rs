//! Temporal snapshot index: the frame sequence behind the time-lapse map.
//!
//! Snapshots arrive at irregular times, one region at a time. They are grouped
//! into variable-width windows by greedily advancing a baseline timestamp
//! whenever a record is at least one interval past it, then every window is
//! completed by carrying forward the last known value of regions that did not
//! report in it.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::boundary::BoundaryDataset;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{CountRecord, Metric};

/// Default window threshold.
pub const DEFAULT_BUCKET_INTERVAL: TimeDelta = TimeDelta::minutes(30);

/// Format of a bucket label, in the indexer's local offset.
pub const BUCKET_LABEL_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// One window of the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBucket {
    /// Baseline timestamp formatted with [`BUCKET_LABEL_FORMAT`].
    pub label: String,
    pub baseline: DateTime<FixedOffset>,
    pub regions: BTreeMap<String, CountRecord>,
}

impl TimeBucket {
    /// One metric for every region of `universe`, in order; absent regions read 0.
    pub fn values(&self, universe: &[String], metric: Metric) -> Vec<u64> {
        universe
            .iter()
            .map(|region| {
                self.regions
                    .get(region)
                    .map(|r| r.counts.get(metric))
                    .unwrap_or(0)
            })
            .collect()
    }
}

/// Chronologically ordered windows of complete per-region maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalSnapshotIndex {
    pub buckets: Vec<TimeBucket>,
}

impl TemporalSnapshotIndex {
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<&TimeBucket> {
        self.buckets.iter().find(|b| b.label == label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.buckets.iter().map(|b| b.label.as_str())
    }
}

/// Builds [`TemporalSnapshotIndex`]es.
#[derive(Debug, Clone, Copy)]
pub struct TemporalIndexer {
    interval: TimeDelta,
    offset: FixedOffset,
}

impl TemporalIndexer {
    /// `offset` interprets the date range and formats labels.
    pub fn new(interval: TimeDelta, offset: FixedOffset) -> Self {
        Self { interval, offset }
    }

    pub fn interval(&self) -> TimeDelta {
        self.interval
    }

    /// Index `history` over the inclusive local date range `[start_date, end_date]`.
    ///
    /// Every in-range record is bucketed, including regions outside
    /// `region_universe`; [`TimeBucket::values`] restricts a bucket to the
    /// universe. Fails with [`PipelineError::EmptyRange`] if the window is empty.
    pub fn build_index(
        &self,
        history: &[CountRecord],
        region_universe: &BoundaryDataset,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> PipelineResult<TemporalSnapshotIndex> {
        let empty = || PipelineError::EmptyRange {
            start: start_date,
            end: end_date,
        };
        let from = self.local_to_utc(start_date, 0, 0, 0).ok_or_else(empty)?;
        let until = self.local_to_utc(end_date, 23, 59, 59).ok_or_else(empty)?;

        let mut records: Vec<&CountRecord> = history
            .iter()
            .filter(|r| r.observed_at >= from && r.observed_at <= until)
            .collect();
        if records.is_empty() {
            return Err(empty());
        }

        // Outside regions still shape the windows; frames read only the universe.
        let outside = records
            .iter()
            .filter(|r| !region_universe.contains(&r.region))
            .count();
        if outside > 0 {
            debug!(records = outside, "History records outside the region universe");
        }

        // Stable: equal timestamps keep their input order.
        records.sort_by_key(|r| r.observed_at);

        let mut buckets = self.bucket(&records);
        forward_fill(&mut buckets);

        debug!(
            buckets = buckets.len(),
            records = records.len(),
            %start_date,
            %end_date,
            "Temporal index built"
        );
        Ok(TemporalSnapshotIndex { buckets })
    }

    fn bucket(&self, sorted: &[&CountRecord]) -> Vec<TimeBucket> {
        let mut buckets: Vec<TimeBucket> = Vec::new();
        let Some(first) = sorted.first() else {
            return buckets;
        };
        let mut baseline = first.observed_at;

        for record in sorted {
            if record.observed_at - baseline >= self.interval {
                baseline = record.observed_at;
            }

            let needs_new = buckets
                .last()
                .is_none_or(|b| b.baseline.with_timezone(&Utc) != baseline);
            if needs_new {
                let local = baseline.with_timezone(&self.offset);
                buckets.push(TimeBucket {
                    label: local.format(BUCKET_LABEL_FORMAT).to_string(),
                    baseline: local,
                    regions: BTreeMap::new(),
                });
            }

            if let Some(bucket) = buckets.last_mut() {
                match bucket.regions.get(&record.region) {
                    Some(existing) if existing.observed_at >= record.observed_at => {}
                    _ => {
                        bucket
                            .regions
                            .insert(record.region.clone(), (*record).clone());
                    }
                }
            }
        }

        buckets
    }

    fn local_to_utc(&self, date: NaiveDate, h: u32, m: u32, s: u32) -> Option<DateTime<Utc>> {
        let naive = date.and_hms_opt(h, m, s)?;
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Copy regions missing from a bucket in from the bucket before it.
///
/// Runs front to back, so a region absent for several buckets keeps the same
/// stale value until it reports again.
fn forward_fill(buckets: &mut [TimeBucket]) {
    for i in 1..buckets.len() {
        let (done, rest) = buckets.split_at_mut(i);
        let previous = &done[i - 1];
        let current = &mut rest[0];
        for (region, record) in &previous.regions {
            current
                .regions
                .entry(region.clone())
                .or_insert_with(|| record.clone());
        }
    }
}
