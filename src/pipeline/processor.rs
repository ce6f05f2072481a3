//! Two-page form processing orchestrator.
//!
//! Single entry point that drives the whole pipeline for one document:
//! prepare → analyze (batched) → extract → calibrate (optional) →
//! validate → correct → score.
//!
//! Both pages run concurrently on scoped threads against one template
//! snapshot. Nothing a single page does can fail the other page; only
//! template problems fail the whole call.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::pipeline::calibration::{evidence_from_answers, CalibrationEvidence, CalibrationReport, RegionCalibrator};
use crate::pipeline::extraction::{
    compute_document_confidence, compute_stats, prepare_page, DocumentFields, ExtractionMode,
    ExtractionResult, ExtractionStats, FieldExtractor, PageFields, PageView, QualityWarning,
};
use crate::pipeline::validation::{apply_corrections, CanonicalLists, DocumentValidator, ValidationReport};
use crate::pipeline::vision::{analyze_in_batches, AnalysisResult, BatchError, VisionService};
use crate::pipeline_config::ExtractionConfig;
use crate::template::{FormTemplate, PageSide, PageTemplate, TemplateError, TemplateRegistry};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that fail a whole processing call.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// A page-level problem that did not abort the document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageError {
    pub page: PageSide,
    pub error: String,
}

/// Everything returned to the caller for one document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentExtraction {
    pub document_id: Uuid,
    pub template_id: String,
    pub template_version: String,
    pub mode: ExtractionMode,
    pub fields: DocumentFields,
    pub overall_confidence: f32,
    pub stats: ExtractionStats,
    pub validation: ValidationReport,
    /// Corrections written into `fields`.
    pub corrections_applied: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub page_errors: Vec<PageError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub batch_errors: Vec<BatchError>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub quality_warnings: BTreeMap<PageSide, Vec<QualityWarning>>,
}

/// Output of one page worker.
struct PageRun {
    side: PageSide,
    fields: PageFields,
    analysis: AnalysisResult,
    warnings: Vec<QualityWarning>,
    batch_errors: Vec<BatchError>,
    errors: Vec<String>,
}

impl PageRun {
    /// Every field on the page reported as `error`.
    fn unusable(side: PageSide, page: &PageTemplate, error: String) -> Self {
        let fields = page
            .fields
            .keys()
            .map(|name| (name.clone(), ExtractionResult::error(error.clone())))
            .collect();
        Self {
            side,
            fields,
            analysis: AnalysisResult::default(),
            warnings: Vec::new(),
            batch_errors: Vec::new(),
            errors: vec![error],
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Orchestrates document extraction for one registered template.
///
/// Holds no per-document state: one processor can serve many concurrent
/// `extract` calls, which share only the registry.
pub struct FormProcessor {
    registry: Arc<TemplateRegistry>,
    vision: Arc<dyn VisionService>,
    config: ExtractionConfig,
    validator: DocumentValidator,
}

impl FormProcessor {
    pub fn new(
        registry: Arc<TemplateRegistry>,
        vision: Arc<dyn VisionService>,
        config: ExtractionConfig,
        lists: CanonicalLists,
    ) -> Self {
        let validator = DocumentValidator::new(lists, config.fuzzy.clone());
        Self {
            registry,
            vision,
            config,
            validator,
        }
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Extract every field of a two-page form.
    ///
    /// Fails only when the template cannot be read or `template_id` names a
    /// different form. Page-level failures are reported in `page_errors`
    /// and mark that page's fields for review.
    pub fn extract(
        &self,
        front: &[u8],
        back: &[u8],
        template_id: &str,
        mode: ExtractionMode,
    ) -> Result<DocumentExtraction, ProcessingError> {
        let template = self.registry.snapshot()?;
        if template.template_id != template_id {
            return Err(TemplateError::IdMismatch {
                expected: template_id.to_string(),
                found: template.template_id.clone(),
            }
            .into());
        }

        let document_id = Uuid::new_v4();
        let _span = tracing::info_span!(
            "extract_document",
            document_id = %document_id,
            template_id = %template.template_id,
            version = %template.version,
            mode = %mode
        )
        .entered();

        let extractor = FieldExtractor::new(&self.config, mode);
        let runs = self.run_pages(&template, &extractor, [(PageSide::Front, front), (PageSide::Back, back)]);

        let mut fields = DocumentFields::new();
        let mut page_errors = Vec::new();
        let mut batch_errors = Vec::new();
        let mut quality_warnings = BTreeMap::new();
        let mut evidence: Vec<CalibrationEvidence> = Vec::new();

        for run in runs {
            if let Some(page) = template.page(run.side) {
                evidence.extend(evidence_from_answers(run.side, page, &run.analysis.answers));
            }
            page_errors.extend(run.errors.into_iter().map(|error| PageError { page: run.side, error }));
            batch_errors.extend(run.batch_errors);
            if !run.warnings.is_empty() {
                quality_warnings.insert(run.side, run.warnings);
            }
            fields.insert(run.side, run.fields);
        }

        let calibration = self.opportunistic_calibration(&evidence);

        let validation = self.validator.validate_document(&template, &fields);
        let corrections_applied = apply_corrections(&mut fields, &validation.outcomes);

        let stats = compute_stats(&fields);
        let overall_confidence = compute_document_confidence(&fields, &template.required_fields());

        tracing::info!(
            fields = stats.total,
            high = stats.high,
            medium = stats.medium,
            low = stats.low,
            requires_review = stats.requires_review,
            overall_confidence,
            page_errors = page_errors.len(),
            "Document extraction complete"
        );

        Ok(DocumentExtraction {
            document_id,
            template_id: template.template_id.clone(),
            template_version: template.version.clone(),
            mode,
            fields,
            overall_confidence,
            stats,
            validation,
            corrections_applied,
            calibration,
            page_errors,
            batch_errors,
            quality_warnings,
        })
    }

    /// Maintenance entry point: calibrate the live template from
    /// accumulated evidence. Returns the report and the number of regions
    /// updated.
    pub fn calibrate(&self, evidence: &[CalibrationEvidence]) -> Result<(CalibrationReport, usize), ProcessingError> {
        let calibrator = RegionCalibrator::new(&self.config.calibration);
        let report = calibrator.calibrate(&self.registry, evidence)?;
        let updated = report.applied;
        Ok((report, updated))
    }

    fn run_pages(
        &self,
        template: &FormTemplate,
        extractor: &FieldExtractor<'_>,
        pages: [(PageSide, &[u8]); 2],
    ) -> Vec<PageRun> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = pages
                .into_iter()
                .filter_map(|(side, bytes)| {
                    let page = template.page(side)?;
                    let handle = scope.spawn(move || self.process_page(side, page, bytes, extractor));
                    Some((side, page, handle))
                })
                .collect();

            handles
                .into_iter()
                .map(|(side, page, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        tracing::error!(page = %side, "Page worker panicked");
                        PageRun::unusable(side, page, "page worker panicked".to_string())
                    })
                })
                .collect()
        })
    }

    fn process_page(
        &self,
        side: PageSide,
        page: &PageTemplate,
        bytes: &[u8],
        extractor: &FieldExtractor<'_>,
    ) -> PageRun {
        let _span = tracing::info_span!("page", page = %side, fields = page.fields.len()).entered();

        let prepared = match prepare_page(bytes, self.config.enhance_low_contrast) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!(page = %side, error = %e, "Page image unusable");
                return PageRun::unusable(side, page, e.to_string());
            }
        };
        for warning in &prepared.warnings {
            tracing::warn!(page = %side, warning = ?warning, "Page quality warning");
        }

        let queries = extractor.queries_for(page);
        let mut errors = Vec::new();
        let (analysis, batch_errors) =
            match analyze_in_batches(self.vision.as_ref(), &prepared.analysis_png, &queries, &self.config.batching) {
                Ok(outcome) => (outcome.result, outcome.batch_errors),
                Err(e) => {
                    // Mark detection still works from pixels alone.
                    tracing::warn!(page = %side, error = %e, "Vision analysis failed for page");
                    errors.push(format!("vision analysis failed: {e}"));
                    (AnalysisResult::default(), Vec::new())
                }
            };

        let view = PageView {
            image: &prepared.luma,
            blocks: &analysis.blocks,
            answers: &analysis.answers,
        };
        let fields = extractor.extract_page(side, page, &view);

        PageRun {
            side,
            fields,
            analysis,
            warnings: prepared.warnings,
            batch_errors,
            errors,
        }
    }

    /// Calibrate from this document's confident answers when enabled.
    /// Failures are logged; extraction results stand regardless.
    fn opportunistic_calibration(&self, evidence: &[CalibrationEvidence]) -> Option<CalibrationReport> {
        if !self.config.calibration.auto_calibrate {
            return None;
        }
        let confident: Vec<CalibrationEvidence> = evidence
            .iter()
            .filter(|e| e.answer.confidence >= self.config.calibration.auto_confidence)
            .cloned()
            .collect();
        if confident.is_empty() {
            return None;
        }

        match RegionCalibrator::new(&self.config.calibration).calibrate(&self.registry, &confident) {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(error = %e, "Opportunistic calibration failed, continuing");
                None
            }
        }
    }
}
