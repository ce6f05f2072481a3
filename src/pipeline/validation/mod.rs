//! Validation and correction of extracted values.
//!
//! Every field with a declared semantic type runs through the matching
//! validator. Corrections are recorded next to the original value and only
//! written back by [`apply_corrections`], which keeps the original in the
//! field's provenance.

pub mod cross_field;
pub mod fuzzy;
pub mod lists;
pub mod summary;
pub mod validators;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::extraction::{DocumentFields, FieldValue};
use crate::pipeline_config::FuzzyConfig;
use crate::template::{FormTemplate, PageSide, SemanticType};

pub use cross_field::{CrossFieldError, CrossFieldRule, Severity};
pub use lists::CanonicalLists;
pub use summary::ValidationSummary;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result of running one validator on one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCheck {
    pub is_valid: bool,
    /// Normalized value; `None` when the input could not be repaired.
    pub corrected: Option<String>,
    pub confidence: f32,
}

impl FieldCheck {
    pub fn valid(corrected: String, confidence: f32) -> Self {
        Self {
            is_valid: true,
            corrected: Some(corrected),
            confidence,
        }
    }

    pub fn invalid(confidence: f32) -> Self {
        Self {
            is_valid: false,
            corrected: None,
            confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence >= 0.90 {
            Self::High
        } else if confidence >= 0.70 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// One validated field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub page: PageSide,
    pub field: String,
    pub semantic_type: SemanticType,
    pub original: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected: Option<String>,
    pub is_valid: bool,
    /// Validator confidence.
    pub confidence: f32,
    /// Band of the extraction confidence.
    pub level: ConfidenceLevel,
    pub requires_review: bool,
}

impl ValidationOutcome {
    /// Whether the validator changed the value.
    pub fn was_corrected(&self) -> bool {
        self.corrected
            .as_deref()
            .is_some_and(|c| c != self.original)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub outcomes: Vec<ValidationOutcome>,
    pub cross_field: Vec<CrossFieldError>,
    pub summary: ValidationSummary,
}

pub struct DocumentValidator {
    lists: CanonicalLists,
    fuzzy: FuzzyConfig,
}

impl DocumentValidator {
    pub fn new(lists: CanonicalLists, fuzzy: FuzzyConfig) -> Self {
        Self { lists, fuzzy }
    }

    /// Run the validator for `semantic_type` on `value`.
    pub fn check(&self, semantic_type: SemanticType, allowed_values: &[String], value: &str) -> FieldCheck {
        match semantic_type {
            SemanticType::Date => validators::validate_date(value),
            SemanticType::Phone => validators::validate_phone(value),
            SemanticType::HealthId => validators::validate_health_id(value),
            SemanticType::ControlNumber => validators::validate_control_number(value),
            SemanticType::Place => {
                validators::validate_place(value, &self.lists.places, self.fuzzy.place_tolerance)
            }
            SemanticType::Facility => validators::validate_facility(
                value,
                &self.lists.facilities,
                self.fuzzy.facility_tolerance,
            ),
            SemanticType::Categorical if allowed_values.is_empty() => validators::validate_categorical(
                value,
                validators::DEFAULT_RESULT_CATEGORIES,
                self.fuzzy.categorical_tolerance,
            ),
            SemanticType::Categorical => validators::validate_categorical(
                value,
                allowed_values,
                self.fuzzy.categorical_tolerance,
            ),
            SemanticType::Age => validators::validate_age(value),
            SemanticType::Sex => validators::validate_sex(value),
        }
    }

    /// Validate every typed field, then run the cross-field rules.
    pub fn validate_document(&self, template: &FormTemplate, fields: &DocumentFields) -> ValidationReport {
        let _span = tracing::info_span!("validate_document", template_id = %template.template_id).entered();

        let mut outcomes = Vec::new();
        for (side, page) in &template.pages {
            let Some(page_fields) = fields.get(side) else {
                continue;
            };
            for (name, definition) in &page.fields {
                let Some(semantic_type) = definition.semantic_type else {
                    continue;
                };
                let Some(result) = page_fields.get(name) else {
                    continue;
                };
                let Some(original) = result.text().filter(|t| !t.trim().is_empty()) else {
                    continue;
                };

                let check = self.check(semantic_type, &definition.allowed_values, original);
                let level = ConfidenceLevel::from_confidence(result.confidence);
                outcomes.push(ValidationOutcome {
                    page: *side,
                    field: name.clone(),
                    semantic_type,
                    original: original.to_string(),
                    corrected: check.corrected,
                    is_valid: check.is_valid,
                    confidence: check.confidence,
                    level,
                    requires_review: level != ConfidenceLevel::High || !check.is_valid,
                });
            }
        }

        let cross_field = if template.validation.cross_field {
            let values = scalar_values(fields, &outcomes);
            cross_field::check_cross_fields(
                &template.validation.names,
                |name| values.get(name).map(String::as_str),
                &template.required_fields(),
                |side, name| {
                    fields
                        .get(&side)
                        .and_then(|page| page.get(name))
                        .and_then(|result| result.value.as_ref())
                        .is_some_and(|value| !value.is_empty())
                },
            )
        } else {
            Vec::new()
        };

        let summary = ValidationSummary::from_outcomes(&outcomes, &cross_field);
        tracing::info!(
            validated = summary.total,
            valid = summary.valid,
            corrected = summary.corrected,
            cross_field_errors = cross_field.len(),
            "Validation complete"
        );

        ValidationReport {
            outcomes,
            cross_field,
            summary,
        }
    }
}

/// Field name → scalar value for cross-field lookups. Front page wins over
/// back; valid corrections replace the raw text.
fn scalar_values(fields: &DocumentFields, outcomes: &[ValidationOutcome]) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for side in PageSide::ALL.iter().rev() {
        let Some(page) = fields.get(side) else {
            continue;
        };
        for (name, result) in page {
            let scalar = match result.value.as_ref() {
                Some(FieldValue::Flag(flag)) => Some(flag.to_string()),
                Some(value) => value.as_text().map(str::to_string),
                None => None,
            };
            if let Some(scalar) = scalar {
                values.insert(name.clone(), scalar);
            }
        }
    }
    for outcome in outcomes.iter().filter(|o| o.is_valid) {
        let front_shadows = outcome.page != PageSide::Front
            && fields
                .get(&PageSide::Front)
                .is_some_and(|page| page.contains_key(&outcome.field));
        if front_shadows {
            continue;
        }
        if let Some(corrected) = &outcome.corrected {
            values.insert(outcome.field.clone(), corrected.clone());
        }
    }
    values
}

/// Write valid corrections back into `fields`. Returns how many values changed.
pub fn apply_corrections(fields: &mut DocumentFields, outcomes: &[ValidationOutcome]) -> usize {
    let mut applied = 0;
    for outcome in outcomes.iter().filter(|o| o.is_valid && o.was_corrected()) {
        let Some(result) = fields
            .get_mut(&outcome.page)
            .and_then(|page| page.get_mut(&outcome.field))
        else {
            continue;
        };
        let Some(FieldValue::Text(current)) = result.value.as_mut() else {
            continue;
        };
        let Some(corrected) = outcome.corrected.clone() else {
            continue;
        };
        let original = std::mem::replace(current, corrected);
        result.provenance.original_value = Some(FieldValue::Text(original));
        applied += 1;
    }
    if applied > 0 {
        tracing::debug!(applied, "Corrections applied");
    }
    applied
}
