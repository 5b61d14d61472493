//! Upstream record shapes.
//!
//! Documents are decoded to [`serde_json::Value`] first and records are then
//! lifted into these types one at a time, so a missing field can be reported
//! against the record that lacks it.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::data_sources::endpoints::EndpointId;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{CountRecord, Counts, GlobalTotals, NationalObservation};
use crate::normalize::strip_admin_suffix;

/// Pointer to the global-totals object inside the `qq` document.
const GLOBAL_VARS_POINTER: &str = "/data/wuwei_ww_global_vars/0";

/// Year the `MM/DD` dates of the national daily-counts array belong to.
pub const DAY_COUNT_YEAR: i32 = 2020;

/// One entry of the national daily-counts array.
#[derive(Debug, Clone, Deserialize)]
pub struct DayCount {
    /// `MM/DD`, no year.
    pub date: String,
    pub confirm: u64,
    pub suspect: u64,
    pub dead: u64,
    pub heal: u64,
}

impl DayCount {
    pub fn counts(&self) -> Counts {
        Counts::new(self.confirm, self.suspect, self.heal, self.dead)
    }

    /// Calendar date, assuming [`DAY_COUNT_YEAR`].
    pub fn calendar_date(&self) -> PipelineResult<NaiveDate> {
        let full = format!("{}/{}", DAY_COUNT_YEAR, self.date);
        NaiveDate::parse_from_str(&full, "%Y/%m/%d").map_err(|e| PipelineError::Schema {
            record: format!("day count '{}'", self.date),
            reason: e.to_string(),
        })
    }

    /// Observation stamped at local midnight of its date.
    pub fn to_observation(&self, offset: FixedOffset) -> PipelineResult<NationalObservation> {
        let date = self.calendar_date()?;
        let observed_at = local_midnight(date, offset).ok_or_else(|| PipelineError::Schema {
            record: format!("day count '{}'", self.date),
            reason: "date has no local midnight".to_string(),
        })?;
        Ok(NationalObservation {
            observed_at,
            counts: self.counts(),
        })
    }
}

/// The global-totals object.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalVars {
    #[serde(rename = "confirmCount")]
    pub confirm_count: u64,
    #[serde(rename = "suspectCount")]
    pub suspect_count: u64,
    #[serde(rename = "deadCount")]
    pub dead_count: u64,
    pub cure: u64,
    pub update_time: String,
}

impl From<GlobalVars> for GlobalTotals {
    fn from(vars: GlobalVars) -> Self {
        GlobalTotals {
            counts: Counts::new(
                vars.confirm_count,
                vars.suspect_count,
                vars.cure,
                vars.dead_count,
            ),
            update_time: vars.update_time,
        }
    }
}

/// One province of the area-stat array.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaStat {
    pub province_name: String,
    #[serde(default)]
    pub province_short_name: Option<String>,
    pub confirmed_count: u64,
    pub suspected_count: u64,
    pub cured_count: u64,
    pub dead_count: u64,
    #[serde(default)]
    pub cities: Vec<CityStat>,
}

impl AreaStat {
    /// Short name as reported, or the full name with its admin suffix stripped.
    pub fn short_name(&self) -> &str {
        match &self.province_short_name {
            Some(short) if !short.is_empty() => short.as_str(),
            _ => strip_admin_suffix(&self.province_name),
        }
    }

    pub fn counts(&self) -> Counts {
        Counts::new(
            self.confirmed_count,
            self.suspected_count,
            self.cured_count,
            self.dead_count,
        )
    }
}

/// One city nested under an [`AreaStat`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityStat {
    pub city_name: String,
    pub confirmed_count: u64,
    pub suspected_count: u64,
    pub cured_count: u64,
    pub dead_count: u64,
}

impl CityStat {
    pub fn counts(&self) -> Counts {
        Counts::new(
            self.confirmed_count,
            self.suspected_count,
            self.cured_count,
            self.dead_count,
        )
    }
}

/// One national-total observation of the overall-history array.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallHistoryRecord {
    /// Epoch milliseconds.
    pub update_time: i64,
    pub confirmed_count: u64,
    pub suspected_count: u64,
    pub cured_count: u64,
    pub dead_count: u64,
}

impl OverallHistoryRecord {
    pub fn to_observation(&self) -> PipelineResult<NationalObservation> {
        Ok(NationalObservation {
            observed_at: from_epoch_millis(self.update_time)?,
            counts: Counts::new(
                self.confirmed_count,
                self.suspected_count,
                self.cured_count,
                self.dead_count,
            ),
        })
    }
}

/// One per-province observation of the area-history array.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaHistoryRecord {
    pub province_short_name: String,
    /// Epoch milliseconds.
    pub update_time: i64,
    pub confirmed_count: u64,
    pub suspected_count: u64,
    pub cured_count: u64,
    pub dead_count: u64,
}

impl AreaHistoryRecord {
    /// Region is the raw short name; normalization is up to the caller.
    pub fn to_count_record(&self) -> PipelineResult<CountRecord> {
        Ok(CountRecord::new(
            self.province_short_name.clone(),
            Counts::new(
                self.confirmed_count,
                self.suspected_count,
                self.cured_count,
                self.dead_count,
            ),
            from_epoch_millis(self.update_time)?,
        ))
    }
}

/// Pull the record array of an endpoint's document.
pub fn extract_records(endpoint: EndpointId, doc: &Value) -> PipelineResult<Vec<Value>> {
    let target = match endpoint.records_pointer() {
        Some(pointer) => doc.pointer(pointer),
        None => Some(doc),
    };

    match target {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(PipelineError::Schema {
            record: format!("{endpoint} document"),
            reason: format!(
                "expected an array at '{}'",
                endpoint.records_pointer().unwrap_or("/")
            ),
        }),
        None => Err(PipelineError::Schema {
            record: format!("{endpoint} document"),
            reason: format!(
                "missing '{}'",
                endpoint.records_pointer().unwrap_or("/")
            ),
        }),
    }
}

/// Lift every record into `T`, failing on the first one that does not fit.
///
/// `label_field` names the field used to identify the offending record in the error.
pub fn parse_records<T: DeserializeOwned>(
    records: &[Value],
    label_field: &str,
) -> PipelineResult<Vec<T>> {
    records
        .iter()
        .enumerate()
        .map(|(idx, value)| {
            T::deserialize(value).map_err(|e| PipelineError::Schema {
                record: describe_record(idx, value, label_field),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Read the global-totals object out of a `qq` document.
pub fn parse_global_totals(doc: &Value) -> PipelineResult<GlobalTotals> {
    let vars = doc
        .pointer(GLOBAL_VARS_POINTER)
        .ok_or_else(|| PipelineError::Schema {
            record: "qq global totals".to_string(),
            reason: format!("missing '{GLOBAL_VARS_POINTER}'"),
        })?;
    let vars = GlobalVars::deserialize(vars).map_err(|e| PipelineError::Schema {
        record: "qq global totals".to_string(),
        reason: e.to_string(),
    })?;
    Ok(vars.into())
}

fn describe_record(idx: usize, value: &Value, label_field: &str) -> String {
    match value.get(label_field).and_then(Value::as_str) {
        Some(label) => format!("#{idx} ({label})"),
        None => format!("#{idx}"),
    }
}

fn from_epoch_millis(ms: i64) -> PipelineResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| PipelineError::Schema {
        record: format!("timestamp {ms}"),
        reason: "out of range".to_string(),
    })
}

/// Midnight of `date` in `offset`, as UTC.
pub fn local_midnight(date: NaiveDate, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    offset
        .from_local_datetime(&midnight)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}
