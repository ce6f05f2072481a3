//! Multi-strategy field extraction.
//!
//! Every applicable strategy yields a tagged attempt. Attempts below their
//! strategy minimum are rejected; the rest are stable-sorted by confidence
//! and the first wins. Strategy order only breaks ties: query, then region
//! or mark detection.

use std::collections::BTreeMap;

use image::GrayImage;

use super::aliases::{alias_candidates, resolve_answer};
use super::marks::extract_marks;
use super::types::{
    AttemptSummary, ExtractionMode, ExtractionResult, ExtractionSource, FieldValue, PageFields,
};
use crate::pipeline::vision::{QueryAnswer, TextBlock, VisionQuery};
use crate::pipeline_config::ExtractionConfig;
use crate::template::{FieldDefinition, PageSide, PageTemplate};

/// Query answers under this confidence are kept but flagged.
const QUERY_REVIEW_CONFIDENCE: f32 = 0.75;

/// Everything the strategies may read for one page.
pub struct PageView<'a> {
    pub image: &'a GrayImage,
    pub blocks: &'a [TextBlock],
    pub answers: &'a BTreeMap<String, QueryAnswer>,
}

/// One strategy's result plus the minimum it must clear.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub result: ExtractionResult,
    pub minimum: f32,
}

impl Attempt {
    fn summary(&self) -> AttemptSummary {
        AttemptSummary {
            method: self.result.method,
            confidence: self.result.confidence,
        }
    }
}

/// Pick the winning attempt.
///
/// Returns `failed` (carrying the rejected attempts) when nothing clears
/// its minimum.
pub fn select_best(attempts: Vec<Attempt>) -> ExtractionResult {
    let (mut qualified, rejected): (Vec<Attempt>, Vec<Attempt>) = attempts
        .into_iter()
        .partition(|a| a.result.confidence >= a.minimum);

    let rejected: Vec<AttemptSummary> = rejected.iter().map(Attempt::summary).collect();

    // Stable: ties keep strategy order.
    qualified.sort_by(|a, b| b.result.confidence.total_cmp(&a.result.confidence));

    let runner_up = qualified.get(1).map(Attempt::summary);
    let Some(winner) = qualified.into_iter().next() else {
        let mut failed = ExtractionResult::failed();
        failed.provenance.rejected = rejected;
        return failed;
    };

    let mut result = winner.result;
    result.provenance.runner_up = runner_up;
    result.provenance.rejected = rejected;
    result
}

pub struct FieldExtractor<'a> {
    config: &'a ExtractionConfig,
    mode: ExtractionMode,
}

impl<'a> FieldExtractor<'a> {
    pub fn new(config: &'a ExtractionConfig, mode: ExtractionMode) -> Self {
        Self { config, mode }
    }

    pub fn mode(&self) -> ExtractionMode {
        self.mode
    }

    /// Queries to send for a page: one per query-eligible field, under the
    /// field's first alias candidate.
    pub fn queries_for(&self, page: &PageTemplate) -> Vec<VisionQuery> {
        if !self.mode.allows_query() {
            return Vec::new();
        }
        page.fields
            .iter()
            .filter(|(_, def)| def.method.supports_query())
            .filter_map(|(name, def)| {
                let question = def.query.as_deref()?;
                let alias = alias_candidates(name, &def.aliases).into_iter().next()?;
                Some(VisionQuery::new(&alias, question))
            })
            .collect()
    }

    /// Extract every field declared for a page.
    pub fn extract_page(&self, side: PageSide, page: &PageTemplate, view: &PageView<'_>) -> PageFields {
        let mut fields = PageFields::new();
        for (name, def) in &page.fields {
            let result = self.extract_field(name, def, view);
            tracing::debug!(
                page = %side,
                field = %name,
                method = %result.method,
                confidence = result.confidence,
                requires_review = result.requires_review,
                "Field extracted"
            );
            fields.insert(name.clone(), result);
        }
        fields
    }

    /// Run every applicable strategy for one field and select the best.
    /// Never fails: strategy errors become an `error` result for this field.
    pub fn extract_field(&self, name: &str, def: &FieldDefinition, view: &PageView<'_>) -> ExtractionResult {
        let mut attempts = Vec::with_capacity(2);
        let mut strategy_error: Option<String> = None;

        if let Some(result) = self.query_attempt(name, def, view) {
            attempts.push(Attempt {
                result,
                minimum: self.config.query_min_confidence,
            });
        }

        if self.mode.allows_region() {
            match extract_marks(def, view, self.config) {
                Ok(result) => {
                    let minimum = if def.method.is_mark() {
                        self.config.mark_min_confidence
                    } else {
                        self.config.region_min_confidence
                    };
                    attempts.push(Attempt { result, minimum });
                }
                Err(e) => {
                    tracing::warn!(field = %name, error = %e, "Region strategy failed");
                    strategy_error = Some(e.to_string());
                }
            }
        }

        let result = select_best(attempts);
        if let Some(runner_up) = &result.provenance.runner_up {
            tracing::debug!(
                field = %name,
                winner = %result.method,
                confidence = result.confidence,
                runner_up = %runner_up.method,
                runner_up_confidence = runner_up.confidence,
                "Strategy arbitration"
            );
        }

        match strategy_error {
            Some(message) if result.method == ExtractionSource::Failed => {
                let mut errored = ExtractionResult::error(message);
                errored.provenance.rejected = result.provenance.rejected;
                errored
            }
            _ => result,
        }
    }

    fn query_attempt(&self, name: &str, def: &FieldDefinition, view: &PageView<'_>) -> Option<ExtractionResult> {
        if !self.mode.allows_query() || def.query.is_none() || !def.method.supports_query() {
            return None;
        }
        if view.answers.is_empty() {
            return None;
        }
        let candidates = alias_candidates(name, &def.aliases);
        let Some((alias, answer)) = resolve_answer(view.answers, &candidates) else {
            tracing::debug!(field = %name, tried = candidates.len(), "No query answer");
            return None;
        };

        let mut result = ExtractionResult::new(
            Some(FieldValue::Text(answer.text.trim().to_string())),
            answer.confidence,
            ExtractionSource::Query,
        )
        .with_review(answer.confidence < QUERY_REVIEW_CONFIDENCE);
        result.provenance.alias = Some(alias.to_string());
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{ExtractionKind, Region};
    use image::Luma;

    const NAME_REGION: Region = Region::new(0.10, 0.10, 0.30, 0.05);

    fn page() -> GrayImage {
        GrayImage::from_pixel(100, 100, Luma([255u8]))
    }

    fn name_field() -> FieldDefinition {
        FieldDefinition {
            query: Some("What is the first name?".into()),
            ..FieldDefinition::text("First name", NAME_REGION)
        }
    }

    fn block(text: &str, confidence: f32) -> TextBlock {
        TextBlock {
            text: text.into(),
            confidence,
            bbox: Region::new(0.12, 0.11, 0.10, 0.03),
        }
    }

    fn answers(text: &str, confidence: f32) -> BTreeMap<String, QueryAnswer> {
        [(
            "first_name".to_string(),
            QueryAnswer {
                text: text.into(),
                confidence,
                bbox: None,
            },
        )]
        .into()
    }

    fn attempt(method: ExtractionSource, confidence: f32, minimum: f32) -> Attempt {
        Attempt {
            result: ExtractionResult::new(Some(FieldValue::Text(method.to_string())), confidence, method),
            minimum,
        }
    }

    #[test]
    fn higher_confidence_attempt_wins() {
        let best = select_best(vec![
            attempt(ExtractionSource::Query, 0.80, 0.70),
            attempt(ExtractionSource::FormField, 0.95, 0.50),
        ]);
        assert_eq!(best.method, ExtractionSource::FormField);
        let runner_up = best.provenance.runner_up.unwrap();
        assert_eq!(runner_up.method, ExtractionSource::Query);
        assert!((runner_up.confidence - 0.80).abs() < f32::EPSILON);
    }

    #[test]
    fn ties_keep_strategy_order() {
        let best = select_best(vec![
            attempt(ExtractionSource::Query, 0.90, 0.70),
            attempt(ExtractionSource::FormField, 0.90, 0.50),
        ]);
        assert_eq!(best.method, ExtractionSource::Query);
    }

    #[test]
    fn attempts_below_minimum_are_rejected() {
        let best = select_best(vec![
            attempt(ExtractionSource::Query, 0.65, 0.70),
            attempt(ExtractionSource::CoordinateNoBlocks, 0.2, 0.50),
        ]);
        assert_eq!(best.method, ExtractionSource::Failed);
        assert!(best.value.is_none());
        assert!(best.confidence.abs() < f32::EPSILON);
        assert!(best.requires_review);
        assert_eq!(best.provenance.rejected.len(), 2);
    }

    #[test]
    fn query_answer_used_when_no_better_attempt() {
        let img = page();
        let answers = answers("JUAN", 0.92);
        let view = PageView {
            image: &img,
            blocks: &[],
            answers: &answers,
        };
        let config = ExtractionConfig::default();
        let extractor = FieldExtractor::new(&config, ExtractionMode::Hybrid);
        let result = extractor.extract_field("firstName", &name_field(), &view);
        assert_eq!(result.method, ExtractionSource::Query);
        assert_eq!(result.text(), Some("JUAN"));
        assert_eq!(result.provenance.alias.as_deref(), Some("first_name"));
        assert!(!result.requires_review);
        // The empty region attempt was below its minimum.
        assert_eq!(result.provenance.rejected[0].method, ExtractionSource::CoordinateNoBlocks);
    }

    #[test]
    fn region_beats_weaker_query() {
        let img = page();
        let answers = answers("JUAM", 0.72);
        let blocks = vec![block("JUAN", 0.96)];
        let view = PageView {
            image: &img,
            blocks: &blocks,
            answers: &answers,
        };
        let config = ExtractionConfig::default();
        let extractor = FieldExtractor::new(&config, ExtractionMode::Hybrid);
        let result = extractor.extract_field("firstName", &name_field(), &view);
        assert_eq!(result.method, ExtractionSource::FormField);
        assert_eq!(result.text(), Some("JUAN"));
    }

    #[test]
    fn mode_gates_strategies() {
        let img = page();
        let answers = answers("JUAN", 0.92);
        let blocks = vec![block("PEDRO", 0.96)];
        let view = PageView {
            image: &img,
            blocks: &blocks,
            answers: &answers,
        };
        let config = ExtractionConfig::default();

        let query_only = FieldExtractor::new(&config, ExtractionMode::QueryOnly);
        assert_eq!(
            query_only.extract_field("firstName", &name_field(), &view).text(),
            Some("JUAN")
        );

        let region_only = FieldExtractor::new(&config, ExtractionMode::RegionOnly);
        assert_eq!(
            region_only.extract_field("firstName", &name_field(), &view).text(),
            Some("PEDRO")
        );
        assert!(region_only.queries_for(&PageTemplate::default()).is_empty());
    }

    #[test]
    fn strategy_error_is_isolated_to_the_field() {
        let img = page();
        let answers = BTreeMap::new();
        let blocks = vec![block("JUAN", 0.96)];
        let view = PageView {
            image: &img,
            blocks: &blocks,
            answers: &answers,
        };
        let config = ExtractionConfig::default();
        let extractor = FieldExtractor::new(&config, ExtractionMode::Hybrid);

        let mut page_template = PageTemplate::default();
        let mut broken = name_field();
        broken.pattern = Some("([".into());
        page_template.fields.insert("broken".into(), broken);
        page_template.fields.insert("firstName".into(), name_field());

        let fields = extractor.extract_page(PageSide::Front, &page_template, &view);
        assert_eq!(fields["broken"].method, ExtractionSource::Error);
        assert!(fields["broken"].provenance.error.is_some());
        assert_eq!(fields["firstName"].text(), Some("JUAN"));
    }

    #[test]
    fn queries_only_for_eligible_fields() {
        let config = ExtractionConfig::default();
        let extractor = FieldExtractor::new(&config, ExtractionMode::Hybrid);
        let mut page_template = PageTemplate::default();
        page_template.fields.insert("firstName".into(), name_field());
        page_template
            .fields
            .insert("lastName".into(), FieldDefinition::text("Last name", NAME_REGION));
        let mut sex = name_field();
        sex.method = ExtractionKind::CheckboxSingle;
        page_template.fields.insert("sex".into(), sex);

        let queries = extractor.queries_for(&page_template);
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].alias, "first_name");
    }
}
