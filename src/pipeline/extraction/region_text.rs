//! Region-based text matching.
//!
//! A text block belongs to a field when its bounding-box center falls inside
//! the field region expanded by the configured tolerance. Matched blocks are
//! joined in reading order.

use regex::Regex;

use super::types::{ExtractionResult, ExtractionSource, FieldValue};
use super::ExtractionError;
use crate::pipeline::vision::TextBlock;
use crate::pipeline_config::ExtractionConfig;
use crate::template::Region;

/// Confidence reported when a region was searched and held no text.
pub const NO_BLOCKS_CONFIDENCE: f32 = 0.2;

/// Confidence multiplier when the joined text fails the field pattern.
const PATTERN_MISS_FACTOR: f32 = 0.5;

/// Height of a reading-order line band, in normalized page units.
const LINE_BAND: f32 = 0.01;

/// Blocks whose center lies inside `region` expanded by `tolerance`,
/// sorted top-to-bottom then left-to-right.
pub fn blocks_in_region<'a>(blocks: &'a [TextBlock], region: &Region, tolerance: f32) -> Vec<&'a TextBlock> {
    let search = region.expanded(tolerance);
    let mut matched: Vec<&TextBlock> = blocks
        .iter()
        .filter(|b| {
            let (cx, cy) = b.bbox.center();
            search.contains_point(cx, cy)
        })
        .collect();

    matched.sort_by(|a, b| {
        let (ax, ay) = a.bbox.center();
        let (bx, by) = b.bbox.center();
        let a_line = (ay / LINE_BAND).floor() as i64;
        let b_line = (by / LINE_BAND).floor() as i64;
        a_line.cmp(&b_line).then(ax.total_cmp(&bx))
    });
    matched
}

pub fn compile_pattern(pattern: &str) -> Result<Regex, ExtractionError> {
    Regex::new(pattern).map_err(|e| ExtractionError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Read the text inside `region`.
///
/// - no usable region → `coordinate-no-region`, confidence 0
/// - no blocks → `coordinate-no-blocks`, confidence 0.2
/// - otherwise → `form-field`, mean block confidence, halved on pattern miss
pub fn extract_region_text(
    region: Option<Region>,
    pattern: Option<&str>,
    blocks: &[TextBlock],
    config: &ExtractionConfig,
) -> Result<ExtractionResult, ExtractionError> {
    let Some(region) = region.filter(Region::is_valid) else {
        return Ok(
            ExtractionResult::new(None, 0.0, ExtractionSource::CoordinateNoRegion).with_review(true),
        );
    };

    let matched = blocks_in_region(blocks, &region, config.block_tolerance);
    if matched.is_empty() {
        let mut result = ExtractionResult::new(None, NO_BLOCKS_CONFIDENCE, ExtractionSource::CoordinateNoBlocks)
            .with_review(true);
        result.provenance.block_count = Some(0);
        return Ok(result);
    }

    let text = matched
        .iter()
        .map(|b| b.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let mean = matched.iter().map(|b| b.confidence).sum::<f32>() / matched.len() as f32;

    let factor = match pattern {
        Some(p) if !text.is_empty() => {
            if compile_pattern(p)?.is_match(&text) {
                1.0
            } else {
                PATTERN_MISS_FACTOR
            }
        }
        _ => 1.0,
    };
    let confidence = mean * factor;

    let requires_review = confidence < config.review_threshold || text.is_empty();
    let value = (!text.is_empty()).then(|| FieldValue::Text(text));
    let mut result = ExtractionResult::new(value, confidence, ExtractionSource::FormField)
        .with_review(requires_review);
    result.provenance.block_count = Some(matched.len());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(text: &str, x: f32, y: f32, confidence: f32) -> TextBlock {
        TextBlock {
            text: text.into(),
            confidence,
            bbox: Region::new(x, y, 0.1, 0.02),
        }
    }

    fn config() -> ExtractionConfig {
        ExtractionConfig::default()
    }

    #[test]
    fn no_blocks_reports_low_constant_confidence() {
        let region = Region::new(0.1, 0.1, 0.2, 0.05);
        let result = extract_region_text(Some(region), None, &[], &config()).unwrap();
        assert!(result.value.is_none());
        assert!((result.confidence - 0.2).abs() < f32::EPSILON);
        assert!(result.requires_review);
        assert_eq!(result.method, ExtractionSource::CoordinateNoBlocks);
    }

    #[test]
    fn missing_region_is_diagnosable() {
        let result = extract_region_text(None, None, &[block("X", 0.1, 0.1, 0.9)], &config()).unwrap();
        assert_eq!(result.method, ExtractionSource::CoordinateNoRegion);
        assert!(result.confidence.abs() < f32::EPSILON);

        let broken = Region::new(0.9, 0.9, 0.5, 0.5);
        let result = extract_region_text(Some(broken), None, &[], &config()).unwrap();
        assert_eq!(result.method, ExtractionSource::CoordinateNoRegion);
    }

    #[test]
    fn joins_blocks_in_reading_order() {
        let region = Region::new(0.1, 0.1, 0.5, 0.1);
        let blocks = vec![
            block("CRUZ", 0.35, 0.12, 0.9),
            block("JUAN", 0.12, 0.12, 0.8),
            block("DELA", 0.12, 0.15, 0.7),
            block("elsewhere", 0.8, 0.8, 0.99),
        ];
        let result = extract_region_text(Some(region), None, &blocks, &config()).unwrap();
        assert_eq!(result.text(), Some("JUAN CRUZ DELA"));
        assert_eq!(result.method, ExtractionSource::FormField);
        assert_eq!(result.provenance.block_count, Some(3));
        assert!((result.confidence - 0.8).abs() < 1e-5, "got {}", result.confidence);
        assert!(!result.requires_review);
    }

    #[test]
    fn tolerance_admits_blocks_just_outside() {
        let region = Region::new(0.2, 0.2, 0.1, 0.05);
        // Center at (0.31, 0.21): outside by 0.01, inside the 0.02 margin.
        let blocks = vec![block("A", 0.26, 0.20, 0.9)];
        let result = extract_region_text(Some(region), None, &blocks, &config()).unwrap();
        assert_eq!(result.text(), Some("A"));
    }

    #[test]
    fn pattern_miss_halves_confidence() {
        let region = Region::new(0.1, 0.1, 0.3, 0.05);
        let blocks = vec![block("ABC", 0.12, 0.11, 0.9)];
        let result = extract_region_text(Some(region), Some(r"^\d+$"), &blocks, &config()).unwrap();
        assert!((result.confidence - 0.45).abs() < 1e-5);
        assert!(result.requires_review);

        let result = extract_region_text(Some(region), Some(r"^[A-Z]+$"), &blocks, &config()).unwrap();
        assert!((result.confidence - 0.9).abs() < 1e-5);
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let region = Region::new(0.1, 0.1, 0.3, 0.05);
        let blocks = vec![block("ABC", 0.12, 0.11, 0.9)];
        let err = extract_region_text(Some(region), Some("(unclosed"), &blocks, &config()).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidPattern { .. }));
    }
}
