use super::types::{DocumentFields, ExtractionStats};
use crate::template::PageSide;

/// Confidence bands used for statistics and review routing.
pub mod thresholds {
    /// At or above: high confidence.
    pub const HIGH: f32 = 0.90;

    /// At or above (and below HIGH): medium confidence.
    pub const MEDIUM: f32 = 0.70;
}

/// Weighted mean of field confidences. Required fields count twice.
pub fn compute_document_confidence(fields: &DocumentFields, required: &[(PageSide, String)]) -> f32 {
    let mut weighted_sum = 0.0f32;
    let mut total_weight = 0.0f32;

    for (side, page) in fields {
        for (name, result) in page {
            let is_required = required.iter().any(|(s, n)| s == side && n == name);
            let weight = if is_required { 2.0 } else { 1.0 };
            weighted_sum += result.confidence * weight;
            total_weight += weight;
        }
    }

    if total_weight == 0.0 {
        return 0.0;
    }
    weighted_sum / total_weight
}

/// Counts by confidence band and by method across both pages.
pub fn compute_stats(fields: &DocumentFields) -> ExtractionStats {
    let mut stats = ExtractionStats::default();
    let mut sum = 0.0f32;

    for result in fields.values().flat_map(|page| page.values()) {
        stats.total += 1;
        sum += result.confidence;
        if result.confidence >= thresholds::HIGH {
            stats.high += 1;
        } else if result.confidence >= thresholds::MEDIUM {
            stats.medium += 1;
        } else {
            stats.low += 1;
        }
        if result.requires_review {
            stats.requires_review += 1;
        }
        *stats.by_method.entry(result.method).or_insert(0) += 1;
    }

    if stats.total > 0 {
        stats.average_confidence = sum / stats.total as f32;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extraction::types::{ExtractionResult, ExtractionSource, PageFields};

    fn result(confidence: f32, method: ExtractionSource, review: bool) -> ExtractionResult {
        ExtractionResult::new(None, confidence, method).with_review(review)
    }

    fn document() -> DocumentFields {
        let mut front = PageFields::new();
        front.insert("name".into(), result(0.95, ExtractionSource::Query, false));
        front.insert("age".into(), result(0.80, ExtractionSource::FormField, false));
        let mut back = PageFields::new();
        back.insert("sig".into(), result(0.50, ExtractionSource::Signature, true));
        back.insert("x".into(), result(0.0, ExtractionSource::Failed, true));
        [(PageSide::Front, front), (PageSide::Back, back)].into()
    }

    #[test]
    fn required_fields_weigh_double() {
        let fields = document();
        let plain = compute_document_confidence(&fields, &[]);
        assert!((plain - 0.5625).abs() < 1e-5, "got {plain}");

        let required = vec![(PageSide::Front, "name".to_string())];
        let weighted = compute_document_confidence(&fields, &required);
        // (0.95*2 + 0.80 + 0.50 + 0.0) / 5
        assert!((weighted - 0.64).abs() < 1e-5, "got {weighted}");
    }

    #[test]
    fn required_match_is_page_specific() {
        let fields = document();
        let wrong_page = vec![(PageSide::Back, "name".to_string())];
        let c = compute_document_confidence(&fields, &wrong_page);
        assert!((c - 0.5625).abs() < 1e-5);
    }

    #[test]
    fn empty_document_has_zero_confidence() {
        assert!(compute_document_confidence(&DocumentFields::new(), &[]).abs() < f32::EPSILON);
        assert_eq!(compute_stats(&DocumentFields::new()).total, 0);
    }

    #[test]
    fn stats_by_band_and_method() {
        let stats = compute_stats(&document());
        assert_eq!(stats.total, 4);
        assert_eq!(stats.high, 1);
        assert_eq!(stats.medium, 1);
        assert_eq!(stats.low, 2);
        assert_eq!(stats.requires_review, 2);
        assert_eq!(stats.by_method[&ExtractionSource::Query], 1);
        assert_eq!(stats.by_method[&ExtractionSource::Failed], 1);
        assert!((stats.average_confidence - 0.5625).abs() < 1e-5);
    }

    #[test]
    fn band_edges_are_inclusive_low() {
        let mut page = PageFields::new();
        page.insert("a".into(), result(0.90, ExtractionSource::Query, false));
        page.insert("b".into(), result(0.70, ExtractionSource::Query, false));
        let stats = compute_stats(&[(PageSide::Front, page)].into());
        assert_eq!(stats.high, 1);
        assert_eq!(stats.medium, 1);
    }
}
