//! Extraction pipeline configuration.
//!
//! Every threshold the extractor, detector, calibrator and validators use is
//! carried here so it can be re-tuned against real scan batches. Values are
//! loaded from an optional JSON file (missing keys take defaults), then
//! individual `FORMSCAN_*` environment variables override them.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Pixel-density classification bands for mark detection.
///
/// `high`/`low` split the density axis into a confident "marked" band,
/// a confident "unmarked" band and an uncertain band between them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityBands {
    /// Density at or above which the region counts as marked.
    pub high: f32,
    /// Density at or below which the region counts as unmarked.
    pub low: f32,
    /// Intensity (0-255) below which a pixel counts as ink.
    pub dark_pixel: u8,
    /// Confidence at the edge of a confident band.
    pub base_confidence: f32,
    /// Confidence ceiling.
    pub max_confidence: f32,
}

impl DensityBands {
    pub const fn checkbox() -> Self {
        Self {
            high: 0.40,
            low: 0.20,
            dark_pixel: 128,
            base_confidence: 0.70,
            max_confidence: 0.95,
        }
    }

    /// Sparse ink: a signature covers far less of its box than a tick.
    pub const fn signature() -> Self {
        Self {
            high: 0.08,
            low: 0.02,
            dark_pixel: 200,
            base_confidence: 0.60,
            max_confidence: 0.90,
        }
    }

    /// Best-guess cutoff inside the uncertain band.
    pub fn midpoint(&self) -> f32 {
        (self.high + self.low) / 2.0
    }
}

impl Default for DensityBands {
    fn default() -> Self {
        Self::checkbox()
    }
}

/// Region calibration thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Center distance above which a mismatch is reported.
    pub report_distance: f32,
    /// Answer confidence required before a region is rewritten.
    pub auto_confidence: f32,
    /// Center distance below which no rewrite is staged.
    pub dead_zone: f32,
    /// Decimal places kept in calibrated regions.
    pub precision: u32,
    /// Run calibration opportunistically during extraction.
    pub auto_calibrate: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            report_distance: 0.05,
            auto_confidence: 0.85,
            dead_zone: 0.02,
            precision: 3,
            auto_calibrate: true,
        }
    }
}

/// Template persistence policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Unsaved calibrations that trigger a write without `force`.
    pub auto_save_threshold: u32,
    /// Backup snapshots kept beside the canonical template.
    pub backup_retention: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            auto_save_threshold: 10,
            backup_retention: 20,
        }
    }
}

/// Vision service batching and throttling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Upper bound on queries per call (the service may impose a lower one).
    pub max_queries_per_call: usize,
    /// Pause between consecutive batches.
    pub inter_batch_delay_ms: u64,
    /// Retries of a throttled batch before giving up on it.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queries_per_call: 15,
            inter_batch_delay_ms: 500,
            max_retries: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 8000,
        }
    }
}

/// Fuzzy-correction tolerances (edit distance / longer length).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzyConfig {
    pub place_tolerance: f32,
    pub facility_tolerance: f32,
    pub categorical_tolerance: f32,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            place_tolerance: 0.25,
            facility_tolerance: 0.30,
            categorical_tolerance: 0.25,
        }
    }
}

/// Top-level extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Minimum answer confidence for a query attempt to be considered.
    pub query_min_confidence: f32,
    /// Minimum confidence for a region text attempt to be considered.
    pub region_min_confidence: f32,
    /// Minimum confidence for a checkbox/signature attempt.
    pub mark_min_confidence: f32,
    /// Results below this confidence are flagged for review.
    pub review_threshold: f32,
    /// Margin added around a field region when matching text blocks.
    pub block_tolerance: f32,
    pub checkbox: DensityBands,
    pub signature: DensityBands,
    /// Use per-region Otsu thresholds instead of the fixed dark-pixel cutoff.
    pub adaptive_checkbox: bool,
    /// Stretch contrast on low-contrast scans before analysis.
    pub enhance_low_contrast: bool,
    pub calibration: CalibrationConfig,
    pub persistence: PersistenceConfig,
    pub batching: BatchConfig,
    pub fuzzy: FuzzyConfig,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            query_min_confidence: 0.70,
            region_min_confidence: 0.50,
            mark_min_confidence: 0.50,
            review_threshold: 0.70,
            block_tolerance: 0.02,
            checkbox: DensityBands::checkbox(),
            signature: DensityBands::signature(),
            adaptive_checkbox: false,
            enhance_low_contrast: true,
            calibration: CalibrationConfig::default(),
            persistence: PersistenceConfig::default(),
            batching: BatchConfig::default(),
            fuzzy: FuzzyConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════

impl ExtractionConfig {
    /// Load configuration: JSON file (if present) → env overrides → validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                let parsed: ExtractionConfig = serde_json::from_str(&raw)?;
                tracing::info!(path = %p.display(), "Loaded extraction config");
                parsed
            }
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `FORMSCAN_*` overrides from a key lookup.
    ///
    /// Unparseable values are ignored with a warning so a typo in one
    /// variable never prevents startup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_value(&lookup, "FORMSCAN_QUERY_MIN_CONFIDENCE", &mut self.query_min_confidence);
        override_value(&lookup, "FORMSCAN_REGION_MIN_CONFIDENCE", &mut self.region_min_confidence);
        override_value(&lookup, "FORMSCAN_REVIEW_THRESHOLD", &mut self.review_threshold);
        override_value(
            &lookup,
            "FORMSCAN_MAX_QUERIES_PER_CALL",
            &mut self.batching.max_queries_per_call,
        );
        override_value(
            &lookup,
            "FORMSCAN_AUTO_CALIBRATE",
            &mut self.calibration.auto_calibrate,
        );
        override_value(&lookup, "FORMSCAN_ADAPTIVE_CHECKBOX", &mut self.adaptive_checkbox);
    }

    /// Reject thresholds outside `[0, 1]` and inverted density bands.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = [
            ("query_min_confidence", self.query_min_confidence),
            ("region_min_confidence", self.region_min_confidence),
            ("mark_min_confidence", self.mark_min_confidence),
            ("review_threshold", self.review_threshold),
            ("block_tolerance", self.block_tolerance),
            ("calibration.report_distance", self.calibration.report_distance),
            ("calibration.auto_confidence", self.calibration.auto_confidence),
            ("calibration.dead_zone", self.calibration.dead_zone),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        for (name, bands) in [("checkbox", &self.checkbox), ("signature", &self.signature)] {
            if bands.low >= bands.high {
                return Err(ConfigError::Invalid(format!(
                    "{name} bands: low ({}) must be below high ({})",
                    bands.low, bands.high
                )));
            }
        }
        if self.batching.max_queries_per_call == 0 {
            return Err(ConfigError::Invalid(
                "batching.max_queries_per_call must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn override_value<T, F>(lookup: &F, key: &str, target: &mut T)
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable config override"),
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = ExtractionConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.query_min_confidence - 0.70).abs() < f32::EPSILON);
        assert_eq!(config.persistence.auto_save_threshold, 10);
        assert_eq!(config.persistence.backup_retention, 20);
        assert_eq!(config.batching.max_queries_per_call, 15);
    }

    #[test]
    fn checkbox_midpoint_between_bands() {
        let bands = DensityBands::checkbox();
        assert!((bands.midpoint() - 0.30).abs() < 1e-6);
    }

    #[test]
    fn partial_json_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extraction.json");
        std::fs::write(&path, r#"{"query_min_confidence": 0.8, "checkbox": {"high": 0.5}}"#)
            .unwrap();

        let config = ExtractionConfig::load(Some(path.as_path())).unwrap();
        assert!((config.query_min_confidence - 0.8).abs() < f32::EPSILON);
        assert!((config.checkbox.high - 0.5).abs() < f32::EPSILON);
        assert!((config.checkbox.low - 0.20).abs() < f32::EPSILON);
        assert!((config.region_min_confidence - 0.50).abs() < f32::EPSILON);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExtractionConfig::load(Some(dir.path().join("nope.json").as_path())).unwrap();
        assert_eq!(config.calibration.precision, 3);
    }

    #[test]
    fn overrides_replace_values() {
        let vars: HashMap<&str, &str> = [
            ("FORMSCAN_QUERY_MIN_CONFIDENCE", "0.9"),
            ("FORMSCAN_MAX_QUERIES_PER_CALL", "5"),
            ("FORMSCAN_AUTO_CALIBRATE", "false"),
        ]
        .into_iter()
        .collect();
        let mut config = ExtractionConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert!((config.query_min_confidence - 0.9).abs() < f32::EPSILON);
        assert_eq!(config.batching.max_queries_per_call, 5);
        assert!(!config.calibration.auto_calibrate);
    }

    #[test]
    fn unparseable_override_is_ignored() {
        let mut config = ExtractionConfig::default();
        config.apply_overrides(|k| {
            (k == "FORMSCAN_REVIEW_THRESHOLD").then(|| "high".to_string())
        });
        assert!((config.review_threshold - 0.70).abs() < f32::EPSILON);
    }

    #[test]
    fn inverted_bands_rejected() {
        let mut config = ExtractionConfig::default();
        config.checkbox.low = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let mut config = ExtractionConfig::default();
        config.query_min_confidence = 70.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("query_min_confidence"));
    }

    #[test]
    fn config_serializes_round_trip_shape() {
        let json = serde_json::to_string(&ExtractionConfig::default()).unwrap();
        assert!(json.contains("\"auto_save_threshold\":10"));
        assert!(json.contains("\"dark_pixel\":128"));
    }
}
