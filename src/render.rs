//! Renderer adapters.
//!
//! Everything here turns prepared pipeline structures into plain,
//! serializable chart descriptions. Drawing happens elsewhere: the HTTP
//! client draws the trend chart, counters and maps, and an external
//! rasteriser turns frame specs into PNGs for [`VideoEncoder`].

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::info;

use crate::boundary::BoundaryDataset;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{GlobalTotals, Metric, MetricBands, NationalDailySeries, RegionLevel, RegionSnapshotTable};
use crate::temporal::TemporalSnapshotIndex;

/// Line colours, indexed confirmed, suspected, cured, dead.
pub const TREND_COLORS: [&str; 4] = ["#E51017", "#FA893A", "#307D47", "#FFFFFF"];

/// Image-sequence pattern the rasteriser writes and the encoder reads.
pub const FRAME_PATTERN: &str = "%d.png";

/// Display name shown in legends and hover text.
pub fn display_name(metric: Metric) -> &'static str {
    match metric {
        Metric::Confirmed => "确诊",
        Metric::Suspected => "疑似",
        Metric::Cured => "治愈",
        Metric::Dead => "死亡",
    }
}

fn color(metric: Metric) -> &'static str {
    match metric {
        Metric::Confirmed => TREND_COLORS[0],
        Metric::Suspected => TREND_COLORS[1],
        Metric::Cured => TREND_COLORS[2],
        Metric::Dead => TREND_COLORS[3],
    }
}

/// Choropleth z-value for a count.
pub fn log_scale(count: u64) -> f64 {
    (count as f64 + 1.0).ln()
}

// ============================================================================
// Trend chart
// ============================================================================

/// One line of the trend chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendLine {
    pub metric: Metric,
    pub name: String,
    pub color: String,
    pub values: Vec<u64>,
    /// Day-over-day change; `None` on the first day.
    pub deltas: Vec<Option<i64>>,
}

/// Two stacked panels sharing the date axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendChart {
    pub dates: Vec<NaiveDate>,
    /// Confirmed and suspected on top; dead and cured below.
    pub panels: Vec<Vec<TrendLine>>,
}

impl TrendChart {
    pub fn from_series(series: &NationalDailySeries) -> Self {
        let line = |metric: Metric| TrendLine {
            metric,
            name: display_name(metric).to_string(),
            color: color(metric).to_string(),
            values: series.records.iter().map(|r| r.counts.get(metric)).collect(),
            deltas: series
                .records
                .iter()
                .map(|r| r.delta.map(|d| d.get(metric)))
                .collect(),
        };

        Self {
            dates: series.records.iter().map(|r| r.date).collect(),
            panels: vec![
                vec![line(Metric::Confirmed), line(Metric::Suspected)],
                vec![line(Metric::Dead), line(Metric::Cured)],
            ],
        }
    }
}

// ============================================================================
// Counter panel
// ============================================================================

/// Headline counters, zero-padded to five digits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterPanel {
    pub update_time: String,
    pub confirmed: String,
    pub suspected: String,
    pub dead: String,
    pub cured: String,
}

impl From<&GlobalTotals> for CounterPanel {
    fn from(totals: &GlobalTotals) -> Self {
        let c = &totals.counts;
        Self {
            update_time: totals.update_time.clone(),
            confirmed: format!("{:05}", c.confirmed),
            suspected: format!("{:05}", c.suspected),
            dead: format!("{:05}", c.dead),
            cured: format!("{:05}", c.cured),
        }
    }
}

// ============================================================================
// Choropleth map
// ============================================================================

/// Hover payload of one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoverRow {
    pub region: String,
    pub confirmed: u64,
    pub suspected: u64,
    pub cured: u64,
    pub dead: u64,
}

/// Region-level map keyed by the boundary dataset's feature-id property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoroplethMap {
    pub level: RegionLevel,
    pub feature_id_key: String,
    pub colorscale: String,
    pub reverse_scale: bool,
    pub locations: Vec<String>,
    /// `ln(confirmed + 1)` per location.
    pub z: Vec<f64>,
    pub bands: Vec<MetricBands>,
    pub hover: Vec<HoverRow>,
}

impl ChoroplethMap {
    /// Build from a region table; locations follow the table's key order.
    pub fn from_table(table: &RegionSnapshotTable, boundary: &BoundaryDataset) -> Self {
        let colorscale = match table.level {
            RegionLevel::Province => "BuPu",
            RegionLevel::City => "PuRd",
        };

        let mut map = Self {
            level: table.level,
            feature_id_key: boundary.feature_id_key(),
            colorscale: colorscale.to_string(),
            reverse_scale: true,
            locations: Vec::with_capacity(table.len()),
            z: Vec::with_capacity(table.len()),
            bands: Vec::with_capacity(table.len()),
            hover: Vec::with_capacity(table.len()),
        };

        for (region, entry) in &table.entries {
            let c = &entry.record.counts;
            map.locations.push(region.clone());
            map.z.push(log_scale(c.confirmed));
            map.bands.push(entry.bands);
            map.hover.push(HoverRow {
                region: region.clone(),
                confirmed: c.confirmed,
                suspected: c.suspected,
                cured: c.cured,
                dead: c.dead,
            });
        }

        map
    }
}

// ============================================================================
// Animation frames
// ============================================================================

/// Everything a rasteriser needs to draw one time-lapse frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationFrame {
    pub index: usize,
    pub label: String,
    /// Label with `_` replaced by a space.
    pub caption: String,
    pub locations: Vec<String>,
    /// Confirmed count per location; regions with no value yet read 0.
    pub values: Vec<u64>,
    pub log_values: Vec<f64>,
}

/// One frame per bucket, every frame covering the whole universe in order.
pub fn animation_frames(index: &TemporalSnapshotIndex, universe: &BoundaryDataset) -> Vec<AnimationFrame> {
    index
        .buckets
        .iter()
        .enumerate()
        .map(|(i, bucket)| {
            let values = bucket.values(universe.names(), Metric::Confirmed);
            AnimationFrame {
                index: i,
                label: bucket.label.clone(),
                caption: bucket.label.replace('_', " "),
                locations: universe.names().to_vec(),
                log_values: values.iter().copied().map(log_scale).collect(),
                values,
            }
        })
        .collect()
}

/// Write each frame to `{dir}/{index}.json`.
pub async fn write_frame_specs(dir: &Path, frames: &[AnimationFrame]) -> PipelineResult<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir).await?;

    let mut paths = Vec::with_capacity(frames.len());
    for frame in frames {
        let path = dir.join(format!("{}.json", frame.index));
        let body = serde_json::to_vec(frame).map_err(std::io::Error::other)?;
        tokio::fs::write(&path, body).await?;
        paths.push(path);
    }

    info!(frames = paths.len(), dir = %dir.display(), "Frame specs written");
    Ok(paths)
}

/// Delete every `*.png` in `dir`, returning how many were removed.
pub async fn clear_frames(dir: &Path) -> PipelineResult<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "png") {
            tokio::fs::remove_file(&path).await?;
            removed += 1;
        }
    }

    info!(removed, dir = %dir.display(), "Frame images removed");
    Ok(removed)
}

// ============================================================================
// Video encoder
// ============================================================================

/// External transcoder turning a numbered image sequence into a video.
#[derive(Debug, Clone)]
pub struct VideoEncoder {
    program: String,
    fps: u32,
}

impl Default for VideoEncoder {
    fn default() -> Self {
        Self::new("ffmpeg", 4)
    }
}

impl VideoEncoder {
    pub fn new(program: impl Into<String>, fps: u32) -> Self {
        Self {
            program: program.into(),
            fps,
        }
    }

    /// Command-line arguments for encoding `pattern` into `output`.
    pub fn args(&self, pattern: &Path, output: &Path) -> Vec<String> {
        vec![
            "-r".to_string(),
            self.fps.to_string(),
            "-f".to_string(),
            "image2".to_string(),
            "-s".to_string(),
            "1920x1080".to_string(),
            "-i".to_string(),
            pattern.display().to_string(),
            "-vcodec".to_string(),
            "libx264".to_string(),
            "-crf".to_string(),
            "25".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            output.display().to_string(),
        ]
    }

    /// Run the transcoder and wait for it.
    pub async fn encode(&self, pattern: &Path, output: &Path) -> PipelineResult<()> {
        let args = self.args(pattern, output);
        info!(program = %self.program, args = ?args, "Encoding video");

        let status = Command::new(&self.program).args(&args).status().await?;
        if !status.success() {
            return Err(PipelineError::Encoder {
                status: status.to_string(),
            });
        }

        info!(output = %output.display(), "Video encoded");
        Ok(())
    }
}
