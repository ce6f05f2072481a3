//! Checkbox and signature fields.
//!
//! Each composite kind is built from per-option detector verdicts. Dependent
//! text and sub-fields are only read when their parent option is checked.

use std::collections::BTreeMap;

use super::extractor::PageView;
use super::region_text::extract_region_text;
use super::types::{Choice, ExtractionResult, ExtractionSource, FieldValue, MatrixRow};
use super::ExtractionError;
use crate::pipeline::detector::{self, MarkDetection};
use crate::pipeline_config::ExtractionConfig;
use crate::template::{CheckboxOption, ExtractionKind, FieldDefinition, Region};

/// Matrix results are an aggregate; their confidence is nominal.
pub const MATRIX_CONFIDENCE: f32 = 0.80;

/// Run the mark strategy matching `field.method`.
pub fn extract_marks(
    field: &FieldDefinition,
    page: &PageView<'_>,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, ExtractionError> {
    match field.method {
        ExtractionKind::TextRegion => extract_region_text(
            field.usable_region(),
            field.pattern.as_deref(),
            page.blocks,
            config,
        ),
        ExtractionKind::CheckboxSingle => single(field, page, config),
        ExtractionKind::CheckboxMulti => multi(field, page, config),
        ExtractionKind::CheckboxWithText => with_text(field, page, config),
        ExtractionKind::CheckboxMultiWithText => multi_with_text(field, page, config),
        ExtractionKind::CheckboxNested => nested(field, page, config),
        ExtractionKind::CheckboxMatrix => matrix(field, page, config),
        ExtractionKind::Signature => signature(field, page, config),
    }
}

// ──────────────────────────────────────────────
// Detection helpers
// ──────────────────────────────────────────────

fn detect_box(
    region: Option<Region>,
    page: &PageView<'_>,
    config: &ExtractionConfig,
) -> Result<Option<MarkDetection>, ExtractionError> {
    let Some(region) = region.filter(Region::is_valid) else {
        return Ok(None);
    };
    let detection = if config.adaptive_checkbox {
        detector::detect_mark_adaptive(page.image, &region, &config.checkbox)?
    } else {
        detector::detect_mark(page.image, &region, &config.checkbox)?
    };
    Ok(Some(detection))
}

struct OptionVerdict<'f> {
    option: &'f CheckboxOption,
    detection: MarkDetection,
}

/// Detect every option; options without a usable region are skipped.
fn detect_options<'f>(
    field: &'f FieldDefinition,
    page: &PageView<'_>,
    config: &ExtractionConfig,
) -> Result<(Vec<OptionVerdict<'f>>, bool), ExtractionError> {
    let mut verdicts = Vec::with_capacity(field.options.len());
    let mut skipped = false;
    for option in &field.options {
        match detect_box(option.region, page, config)? {
            Some(detection) => verdicts.push(OptionVerdict { option, detection }),
            None => {
                tracing::warn!(
                    field = %field.label,
                    option = %option.value,
                    "Checkbox option has no usable region, skipping"
                );
                skipped = true;
            }
        }
    }
    Ok((verdicts, skipped))
}

/// Highest-confidence checked verdict; the first wins ties.
fn best_checked<'v, 'f>(verdicts: &'v [OptionVerdict<'f>]) -> Option<&'v OptionVerdict<'f>> {
    let mut best: Option<&'v OptionVerdict<'f>> = None;
    for verdict in verdicts.iter().filter(|v| v.detection.marked) {
        if best.map_or(true, |b| verdict.detection.confidence > b.detection.confidence) {
            best = Some(verdict);
        }
    }
    best
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = values.fold((0.0f32, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

fn unselected(method: ExtractionSource, value: Option<FieldValue>) -> ExtractionResult {
    ExtractionResult::new(value, 0.0, method).with_review(true)
}

/// Text under a checked option. Returns (text, confidence).
fn dependent_text(
    region: Option<Region>,
    pattern: Option<&str>,
    page: &PageView<'_>,
    config: &ExtractionConfig,
) -> Result<(Option<String>, f32), ExtractionError> {
    if region.is_none() {
        return Ok((None, 0.0));
    }
    let result = extract_region_text(region, pattern, page.blocks, config)?;
    let text = result.text().map(str::to_string);
    Ok((text, result.confidence))
}

/// Extract one dependent sub-field. Failures stay local to the sub-field.
fn dependent_field(
    name: &str,
    def: &FieldDefinition,
    page: &PageView<'_>,
    config: &ExtractionConfig,
) -> ExtractionResult {
    match extract_marks(def, page, config) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(sub_field = %name, error = %e, "Sub-field extraction failed");
            ExtractionResult::error(e.to_string())
        }
    }
}

// ──────────────────────────────────────────────
// Composite kinds
// ──────────────────────────────────────────────

fn single(
    field: &FieldDefinition,
    page: &PageView<'_>,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, ExtractionError> {
    let (verdicts, skipped) = detect_options(field, page, config)?;
    let Some(best) = best_checked(&verdicts) else {
        return Ok(unselected(ExtractionSource::CheckboxSingle, None));
    };
    let d = &best.detection;
    Ok(ExtractionResult::new(
        Some(FieldValue::Text(best.option.value.clone())),
        d.confidence,
        ExtractionSource::CheckboxSingle,
    )
    .with_review(d.requires_review || skipped))
}

fn multi(
    field: &FieldDefinition,
    page: &PageView<'_>,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, ExtractionError> {
    let (verdicts, skipped) = detect_options(field, page, config)?;
    let checked: Vec<&OptionVerdict> = verdicts.iter().filter(|v| v.detection.marked).collect();
    let selection = checked.iter().map(|v| v.option.value.clone()).collect::<Vec<_>>();
    if checked.is_empty() {
        return Ok(unselected(
            ExtractionSource::CheckboxMulti,
            Some(FieldValue::Selection(selection)),
        ));
    }

    let confidence = mean(checked.iter().map(|v| v.detection.confidence));
    let review = skipped || verdicts.iter().any(|v| v.detection.requires_review);
    Ok(ExtractionResult::new(
        Some(FieldValue::Selection(selection)),
        confidence,
        ExtractionSource::CheckboxMulti,
    )
    .with_review(review))
}

fn with_text(
    field: &FieldDefinition,
    page: &PageView<'_>,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, ExtractionError> {
    let (verdicts, skipped) = detect_options(field, page, config)?;
    let Some(best) = best_checked(&verdicts) else {
        return Ok(unselected(ExtractionSource::CheckboxWithText, None));
    };

    let (text, text_confidence) = dependent_text(
        best.option.text_region,
        best.option.text_pattern.as_deref(),
        page,
        config,
    )?;
    let confidence = if text.is_some() {
        (best.detection.confidence + text_confidence) / 2.0
    } else {
        best.detection.confidence
    };

    let mut choice = Choice::new(&best.option.value);
    choice.text = text;
    Ok(ExtractionResult::new(
        Some(FieldValue::Choice(Box::new(choice))),
        confidence,
        ExtractionSource::CheckboxWithText,
    )
    .with_review(best.detection.requires_review || skipped))
}

fn multi_with_text(
    field: &FieldDefinition,
    page: &PageView<'_>,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, ExtractionError> {
    let (verdicts, skipped) = detect_options(field, page, config)?;
    let mut choices = Vec::new();
    let mut confidences = Vec::new();
    let mut review = skipped;

    for verdict in verdicts.iter().filter(|v| v.detection.marked) {
        let (text, _) = dependent_text(
            verdict.option.text_region,
            verdict.option.text_pattern.as_deref(),
            page,
            config,
        )?;
        let mut choice = Choice::new(&verdict.option.value);
        choice.text = text;
        choices.push(choice);
        confidences.push(verdict.detection.confidence);
        review |= verdict.detection.requires_review;
    }

    if choices.is_empty() {
        return Ok(unselected(
            ExtractionSource::CheckboxMultiWithText,
            Some(FieldValue::Choices(choices)),
        ));
    }
    Ok(ExtractionResult::new(
        Some(FieldValue::Choices(choices)),
        mean(confidences.into_iter()),
        ExtractionSource::CheckboxMultiWithText,
    )
    .with_review(review))
}

fn nested(
    field: &FieldDefinition,
    page: &PageView<'_>,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, ExtractionError> {
    let (verdicts, skipped) = detect_options(field, page, config)?;
    let Some(best) = best_checked(&verdicts) else {
        return Ok(unselected(ExtractionSource::CheckboxNested, None));
    };

    let mut choice = Choice::new(&best.option.value);
    choice.sub_fields = best
        .option
        .sub_fields
        .iter()
        .map(|(name, def)| (name.clone(), dependent_field(name, def, page, config)))
        .collect();
    if let Some(region) = best.option.text_region {
        choice.text = dependent_text(Some(region), best.option.text_pattern.as_deref(), page, config)?.0;
    }

    Ok(ExtractionResult::new(
        Some(FieldValue::Choice(Box::new(choice))),
        best.detection.confidence,
        ExtractionSource::CheckboxNested,
    )
    .with_review(best.detection.requires_review || skipped))
}

fn matrix(
    field: &FieldDefinition,
    page: &PageView<'_>,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, ExtractionError> {
    let mut rows = BTreeMap::new();
    let mut review = false;

    for section in &field.sections {
        let mut row = MatrixRow {
            selected: Vec::new(),
            checked: None,
            date: None,
        };

        if !section.options.is_empty() {
            for option in &section.options {
                if let Some(d) = detect_box(option.region, page, config)? {
                    review |= d.requires_review;
                    if d.marked {
                        row.selected.push(option.value.clone());
                    }
                }
            }
        } else if let Some(d) = detect_box(section.checkbox, page, config)? {
            review |= d.requires_review;
            row.checked = Some(d.marked);
            if d.marked && section.date_region.is_some() {
                row.date = dependent_text(section.date_region, None, page, config)?.0;
            }
        } else {
            tracing::warn!(field = %field.label, section = %section.name, "Matrix section has no usable region");
            review = true;
        }

        rows.insert(section.name.clone(), row);
    }

    Ok(ExtractionResult::new(
        Some(FieldValue::Matrix(rows)),
        MATRIX_CONFIDENCE,
        ExtractionSource::CheckboxMatrix,
    )
    .with_review(review))
}

fn signature(
    field: &FieldDefinition,
    page: &PageView<'_>,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, ExtractionError> {
    let Some(region) = field.usable_region() else {
        return Ok(
            ExtractionResult::new(None, 0.0, ExtractionSource::CoordinateNoRegion).with_review(true),
        );
    };
    let d = detector::detect_signature(page.image, &region, &config.signature)?;
    Ok(
        ExtractionResult::new(Some(FieldValue::Flag(d.marked)), d.confidence, ExtractionSource::Signature)
            .with_review(d.requires_review),
    )
}
