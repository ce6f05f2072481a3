use serde::{Deserialize, Serialize};

use super::cross_field::{CrossFieldError, Severity};
use super::{ConfidenceLevel, ValidationOutcome};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossFieldCounts {
    pub total: usize,
    pub critical: usize,
    pub major: usize,
}

/// Aggregate view of a validation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub valid: usize,
    pub corrected: usize,
    /// Mean validator confidence; 0 when nothing was validated.
    pub average_confidence: f32,
    /// Whole percent of fields that validated.
    pub valid_percentage: u32,
    /// Whole percent of fields the validator changed.
    pub corrected_percentage: u32,
    pub confidence_levels: LevelCounts,
    pub requires_review: usize,
    pub cross_field: CrossFieldCounts,
}

impl ValidationSummary {
    pub fn from_outcomes(outcomes: &[ValidationOutcome], cross_field: &[CrossFieldError]) -> Self {
        let total = outcomes.len();
        let valid = outcomes.iter().filter(|o| o.is_valid).count();
        let corrected = outcomes.iter().filter(|o| o.was_corrected()).count();

        let mut levels = LevelCounts::default();
        for outcome in outcomes {
            match outcome.level {
                ConfidenceLevel::High => levels.high += 1,
                ConfidenceLevel::Medium => levels.medium += 1,
                ConfidenceLevel::Low => levels.low += 1,
            }
        }

        let percent = |count: usize| (count as f32 * 100.0 / total as f32).round() as u32;
        let (average_confidence, valid_percentage, corrected_percentage) = if total == 0 {
            (0.0, 0, 0)
        } else {
            let sum: f32 = outcomes.iter().map(|o| o.confidence).sum();
            (sum / total as f32, percent(valid), percent(corrected))
        };

        Self {
            total,
            valid,
            corrected,
            average_confidence,
            valid_percentage,
            corrected_percentage,
            confidence_levels: levels,
            requires_review: outcomes.iter().filter(|o| o.requires_review).count(),
            cross_field: CrossFieldCounts {
                total: cross_field.len(),
                critical: cross_field.iter().filter(|e| e.severity == Severity::Critical).count(),
                major: cross_field.iter().filter(|e| e.severity == Severity::Major).count(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::validation::CrossFieldRule;
    use crate::template::{PageSide, SemanticType};

    fn outcome(original: &str, corrected: Option<&str>, is_valid: bool, confidence: f32, level: ConfidenceLevel) -> ValidationOutcome {
        ValidationOutcome {
            page: PageSide::Front,
            field: "f".into(),
            semantic_type: SemanticType::Phone,
            original: original.into(),
            corrected: corrected.map(str::to_string),
            is_valid,
            confidence,
            level,
            requires_review: !is_valid || level != ConfidenceLevel::High,
        }
    }

    #[test]
    fn empty_run_is_all_zero() {
        let summary = ValidationSummary::from_outcomes(&[], &[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.valid_percentage, 0);
        assert_eq!(summary.corrected_percentage, 0);
        assert!(summary.average_confidence.abs() < f32::EPSILON);
    }

    #[test]
    fn counts_and_percentages() {
        let outcomes = vec![
            outcome("O9123456789", Some("09123456789"), true, 0.9, ConfidenceLevel::High),
            outcome("09123456789", Some("09123456789"), true, 0.9, ConfidenceLevel::Medium),
            outcome("12", None, false, 0.3, ConfidenceLevel::Low),
        ];
        let errors = vec![CrossFieldError {
            rule: CrossFieldRule::AgeMatchesBirthDate,
            severity: Severity::Major,
            fields: vec!["age".into()],
            message: "Age mismatch".into(),
            suggested_value: Some("34".into()),
        }];
        let summary = ValidationSummary::from_outcomes(&outcomes, &errors);

        assert_eq!(summary.total, 3);
        assert_eq!(summary.valid, 2);
        assert_eq!(summary.corrected, 1);
        assert_eq!(summary.valid_percentage, 67);
        assert_eq!(summary.corrected_percentage, 33);
        assert!((summary.average_confidence - 0.7).abs() < 1e-5);
        assert_eq!(summary.confidence_levels, LevelCounts { high: 1, medium: 1, low: 1 });
        assert_eq!(summary.requires_review, 2);
        assert_eq!(summary.cross_field, CrossFieldCounts { total: 1, critical: 0, major: 1 });
    }

    #[test]
    fn corrected_percentage_counts_changed_values() {
        let outcomes = vec![
            outcome("O9123456789", Some("09123456789"), true, 0.9, ConfidenceLevel::High),
            outcome("09123456789", None, true, 0.95, ConfidenceLevel::High),
            outcome("09987654321", Some("09987654321"), true, 0.95, ConfidenceLevel::High),
            outcome("12", None, false, 0.3, ConfidenceLevel::Low),
        ];
        let summary = ValidationSummary::from_outcomes(&outcomes, &[]);

        assert_eq!(summary.corrected, 1);
        assert_eq!(summary.corrected_percentage, 25);
        assert_eq!(summary.valid_percentage, 75);
    }
}
