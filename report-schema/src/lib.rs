use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Date format used for every `date` field the dashboard plots.
pub const DASHBOARD_DATE_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

// ── Dashboard report (github_action_data.json) ──────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Workflow name → runs, oldest first.
    pub workflow_time: BTreeMap<String, Vec<RunRecord>>,
    /// Image category → size observations, oldest first.
    pub docker_images: BTreeMap<String, Vec<ImageSizePoint>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: u64,
    pub date: String,
    /// Hours.
    pub duration: f64,
    /// Job name (or dashboard alias) → seconds. `null` when per-job timings
    /// were not collected for the run.
    pub jobs: Option<BTreeMap<String, Option<f64>>>,
    /// Package name → build seconds. `null` when no build log was analyzed.
    pub details: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSizePoint {
    /// Compressed bytes.
    pub size: u64,
    pub date: String,
    pub tag: String,
}

// ── Image size snapshot (data/docker_image_sizes_*.json) ─

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeSnapshot {
    pub registry: String,
    pub org: String,
    pub image: String,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub images: Vec<ImageSizeRecord>,
}

/// One tag's outcome. A failed tag carries only its error; it never shows up
/// as a zero-sized image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSizeRecord {
    Measured(MeasuredImage),
    Failed {
        tag: String,
        error: String,
        fetched_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasuredImage {
    pub tag: String,
    pub compressed_size_bytes: u64,
    pub compressed_size_gb: f64,
    #[serde(default)]
    pub uncompressed_size_bytes: Option<u64>,
    #[serde(default)]
    pub uncompressed_size_gb: Option<f64>,
    pub num_layers: usize,
    #[serde(default)]
    pub digest: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl ImageSizeRecord {
    pub fn tag(&self) -> &str {
        match self {
            ImageSizeRecord::Measured(m) => &m.tag,
            ImageSizeRecord::Failed { tag, .. } => tag,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ImageSizeRecord::Failed { .. })
    }
}

/// Bytes → GiB rounded to two decimals.
pub fn bytes_to_gb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0 * 1024.0) * 100.0).round() / 100.0
}
