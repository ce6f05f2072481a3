//! Region calibration from query-answer evidence.
//!
//! Query answers carry the position the vision service actually found a
//! field at. Comparing that against the template region detects layout
//! drift between print runs:
//!
//! - distance > `report_distance` → mismatch entry in the report
//! - confidence ≥ `auto_confidence` and distance > `dead_zone` → staged
//!   region replacement (answer box rounded to `precision` decimals)
//!
//! Staged replacements are applied through a `CalibrationSession`, so one
//! calibration-and-persist sequence runs at a time, and persistence follows
//! the registry's auto-save threshold.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::extraction::aliases::{alias_candidates, resolve_answer};
use crate::pipeline::vision::QueryAnswer;
use crate::pipeline_config::CalibrationConfig;
use crate::template::{FormTemplate, PageSide, PageTemplate, Region, RegionUpdate, TemplateError, TemplateRegistry};

/// Characters of answer text kept in report previews.
const PREVIEW_CHARS: usize = 30;

/// One observed answer position for a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEvidence {
    pub page: PageSide,
    pub field: String,
    pub answer: QueryAnswer,
}

/// A proposed region replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSuggestion {
    pub page: PageSide,
    pub field: String,
    pub previous: Option<Region>,
    pub proposed: Region,
    pub distance: f32,
    pub confidence: f32,
    pub text: String,
}

/// Expected vs. actual position beyond the reporting distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MismatchEntry {
    pub page: PageSide,
    pub field: String,
    pub label: String,
    pub expected: Region,
    pub actual: Region,
    pub dx: f32,
    pub dy: f32,
    pub distance: f32,
    pub confidence: f32,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedEvidence {
    pub page: PageSide,
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub generated_at: DateTime<Utc>,
    pub template_id: String,
    pub evidence_count: usize,
    pub mismatches: Vec<MismatchEntry>,
    pub staged: Vec<CalibrationSuggestion>,
    /// Staged replacements accepted by the registry.
    pub applied: usize,
    pub skipped: Vec<SkippedEvidence>,
    /// Whether this run wrote the template to disk.
    pub persisted: bool,
}

/// Distance between the centers of two regions, in normalized page units.
pub fn calibration_distance(expected: &Region, actual: &Region) -> f32 {
    expected.center_distance(actual)
}

fn preview(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() > PREVIEW_CHARS {
        let head: String = trimmed.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        trimmed.to_string()
    }
}

/// Evidence from one page's query answers: every query-eligible field whose
/// answer came back with a bounding box.
pub fn evidence_from_answers(
    side: PageSide,
    page: &PageTemplate,
    answers: &BTreeMap<String, QueryAnswer>,
) -> Vec<CalibrationEvidence> {
    page.fields
        .iter()
        .filter(|(_, def)| def.query.is_some() && def.method.supports_query())
        .filter_map(|(name, def)| {
            let candidates = alias_candidates(name, &def.aliases);
            let (_, answer) = resolve_answer(answers, &candidates)?;
            answer.bbox?;
            Some(CalibrationEvidence {
                page: side,
                field: name.clone(),
                answer: answer.clone(),
            })
        })
        .collect()
}

pub struct RegionCalibrator<'a> {
    config: &'a CalibrationConfig,
}

impl<'a> RegionCalibrator<'a> {
    pub fn new(config: &'a CalibrationConfig) -> Self {
        Self { config }
    }

    /// Build the report and staged replacements without touching the template.
    pub fn analyze(&self, template: &FormTemplate, evidence: &[CalibrationEvidence]) -> CalibrationReport {
        let mut report = CalibrationReport {
            generated_at: Utc::now(),
            template_id: template.template_id.clone(),
            evidence_count: evidence.len(),
            mismatches: Vec::new(),
            staged: Vec::new(),
            applied: 0,
            skipped: Vec::new(),
            persisted: false,
        };

        for item in evidence {
            let skip = |reason: &str| SkippedEvidence {
                page: item.page,
                field: item.field.clone(),
                reason: reason.to_string(),
            };

            let Some(def) = template.field(item.page, &item.field) else {
                report.skipped.push(skip("unknown field"));
                continue;
            };
            let Some(actual) = item.answer.bbox.filter(Region::is_valid) else {
                report.skipped.push(skip("answer has no usable bounding box"));
                continue;
            };
            let expected = def.usable_region();
            let confidence = item.answer.confidence;

            let distance = match expected {
                Some(expected) => {
                    let distance = calibration_distance(&expected, &actual);
                    if distance > self.config.report_distance {
                        let (ex, ey) = expected.center();
                        let (ax, ay) = actual.center();
                        report.mismatches.push(MismatchEntry {
                            page: item.page,
                            field: item.field.clone(),
                            label: def.label.clone(),
                            expected,
                            actual,
                            dx: (ex - ax).abs(),
                            dy: (ey - ay).abs(),
                            distance,
                            confidence,
                            preview: preview(&item.answer.text),
                        });
                    }
                    distance
                }
                // No region configured: any confident answer is an improvement.
                None => f32::INFINITY,
            };

            if confidence < self.config.auto_confidence {
                report.skipped.push(skip("confidence below auto-calibration threshold"));
                continue;
            }
            if distance <= self.config.dead_zone {
                continue;
            }

            let proposed = actual.rounded(self.config.precision);
            if !proposed.is_valid() {
                report.skipped.push(skip("rounded region left the page"));
                continue;
            }
            report.staged.push(CalibrationSuggestion {
                page: item.page,
                field: item.field.clone(),
                previous: expected,
                proposed,
                distance: if distance.is_finite() { distance } else { 1.0 },
                confidence,
                text: item.answer.text.clone(),
            });
        }

        report
    }

    /// Analyze against the live template, apply staged replacements and
    /// request persistence, all under one calibration session.
    ///
    /// A failed write is returned as an error; the in-memory updates stay
    /// applied and unsaved so the next persist retries them.
    pub fn calibrate(
        &self,
        registry: &TemplateRegistry,
        evidence: &[CalibrationEvidence],
    ) -> Result<CalibrationReport, TemplateError> {
        let mut session = registry.begin_calibration()?;
        let current = session.live_mut()?.clone();
        let mut report = self.analyze(&current, evidence);

        if report.staged.is_empty() {
            tracing::info!(
                template_id = %report.template_id,
                evidence = evidence.len(),
                mismatches = report.mismatches.len(),
                "No calibration updates staged"
            );
            return Ok(report);
        }

        let updates: Vec<RegionUpdate> = report
            .staged
            .iter()
            .map(|s| RegionUpdate {
                page: s.page,
                field: s.field.clone(),
                region: s.proposed,
            })
            .collect();
        report.applied = session.apply_updates(&updates);
        report.persisted = session.persist(false)?;

        tracing::info!(
            template_id = %report.template_id,
            staged = report.staged.len(),
            applied = report.applied,
            persisted = report.persisted,
            unsaved = session.unsaved(),
            "Calibration applied"
        );
        Ok(report)
    }
}

impl CalibrationReport {
    /// Human-readable report: summary, mismatch table, staged updates.
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        let _ = writeln!(md, "# Region Calibration Report\n");
        let _ = writeln!(md, "Template: `{}`", self.template_id);
        let _ = writeln!(md, "Generated: {}\n", self.generated_at.to_rfc3339());

        let _ = writeln!(md, "## Summary\n");
        let _ = writeln!(md, "| Metric | Count |");
        let _ = writeln!(md, "|--------|-------|");
        let _ = writeln!(md, "| Evidence | {} |", self.evidence_count);
        let _ = writeln!(md, "| Mismatches | {} |", self.mismatches.len());
        let _ = writeln!(md, "| Staged updates | {} |", self.staged.len());
        let _ = writeln!(md, "| Applied updates | {} |", self.applied);
        let _ = writeln!(md, "| Skipped | {} |", self.skipped.len());
        let _ = writeln!(md, "| Persisted | {} |\n", if self.persisted { "yes" } else { "no" });

        for side in PageSide::ALL {
            let rows: Vec<&MismatchEntry> = self.mismatches.iter().filter(|m| m.page == side).collect();
            if rows.is_empty() {
                continue;
            }
            let _ = writeln!(md, "## {} page mismatches\n", side.as_str().to_uppercase());
            let _ = writeln!(md, "| Field | Label | Distance | Expected (x,y) | Actual (x,y) | Confidence | Answer |");
            let _ = writeln!(md, "|-------|-------|----------|----------------|--------------|------------|--------|");
            for m in rows {
                let _ = writeln!(
                    md,
                    "| {} | {} | {:.3} | ({:.3}, {:.3}) | ({:.3}, {:.3}) | {:.3} | {} |",
                    m.field,
                    m.label,
                    m.distance,
                    m.expected.x,
                    m.expected.y,
                    m.actual.x,
                    m.actual.y,
                    m.confidence,
                    if m.preview.is_empty() { "N/A" } else { &m.preview },
                );
            }
            md.push('\n');
        }

        if !self.staged.is_empty() {
            let _ = writeln!(md, "## Staged updates\n");
            let _ = writeln!(md, "| Page | Field | Proposed (x, y, w, h) | Distance | Confidence |");
            let _ = writeln!(md, "|------|-------|-----------------------|----------|------------|");
            for s in &self.staged {
                let _ = writeln!(
                    md,
                    "| {} | {} | ({:.3}, {:.3}, {:.3}, {:.3}) | {:.3} | {:.3} |",
                    s.page, s.field, s.proposed.x, s.proposed.y, s.proposed.width, s.proposed.height, s.distance, s.confidence,
                );
            }
            md.push('\n');
        }

        if !self.skipped.is_empty() {
            let _ = writeln!(md, "## Skipped evidence\n");
            for s in &self.skipped {
                let _ = writeln!(md, "- {} / {}: {}", s.page, s.field, s.reason);
            }
        }

        md
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline_config::PersistenceConfig;
    use crate::template::FieldDefinition;

    const EXPECTED: Region = Region::new(0.10, 0.10, 0.20, 0.04);

    fn template() -> FormTemplate {
        let mut t = FormTemplate::new("hts-form", "HTS Form");
        let mut name = FieldDefinition::text("First name", EXPECTED);
        name.query = Some("What is the first name?".into());
        t.insert_field(PageSide::Front, "firstName", name);
        t
    }

    fn evidence(bbox: Option<Region>, confidence: f32) -> CalibrationEvidence {
        CalibrationEvidence {
            page: PageSide::Front,
            field: "firstName".into(),
            answer: QueryAnswer {
                text: "JUAN DELA CRUZ SANTOS MARIA CLARA IBARRA".into(),
                confidence,
                bbox,
            },
        }
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_coincident_centers() {
        let a = Region::new(0.1, 0.1, 0.2, 0.2);
        let b = Region::new(0.4, 0.5, 0.1, 0.1);
        assert!((calibration_distance(&a, &b) - calibration_distance(&b, &a)).abs() < f32::EPSILON);
        // Same center, different size.
        let c = Region::new(0.15, 0.15, 0.1, 0.1);
        assert!(calibration_distance(&a, &c).abs() < 1e-6);
    }

    #[test]
    fn drift_is_reported_and_staged() {
        let config = CalibrationConfig::default();
        let moved = Region::new(0.1004, 0.2003, 0.2, 0.04);
        let report = RegionCalibrator::new(&config).analyze(&template(), &[evidence(Some(moved), 0.95)]);

        assert_eq!(report.mismatches.len(), 1);
        let m = &report.mismatches[0];
        assert!((m.distance - 0.1).abs() < 1e-3);
        assert_eq!(m.preview.chars().count(), PREVIEW_CHARS + 3);

        assert_eq!(report.staged.len(), 1);
        let s = &report.staged[0];
        assert_eq!(s.proposed, Region::new(0.1, 0.2, 0.2, 0.04));
        assert_eq!(s.previous, Some(EXPECTED));
    }

    #[test]
    fn low_confidence_never_staged() {
        let config = CalibrationConfig::default();
        let calibrator = RegionCalibrator::new(&config);
        for dy in [0.03f32, 0.1, 0.5] {
            let moved = Region::new(0.1, 0.1 + dy, 0.2, 0.04);
            let report = calibrator.analyze(&template(), &[evidence(Some(moved), 0.84)]);
            assert!(report.staged.is_empty(), "staged at dy={dy}");
        }
    }

    #[test]
    fn dead_zone_suppresses_small_moves() {
        let config = CalibrationConfig::default();
        let nudged = Region::new(0.11, 0.10, 0.2, 0.04);
        let report = RegionCalibrator::new(&config).analyze(&template(), &[evidence(Some(nudged), 0.99)]);
        assert!(report.staged.is_empty());
        assert!(report.mismatches.is_empty());
    }

    #[test]
    fn between_dead_zone_and_report_distance_stages_silently() {
        let config = CalibrationConfig::default();
        let moved = Region::new(0.13, 0.10, 0.2, 0.04);
        let report = RegionCalibrator::new(&config).analyze(&template(), &[evidence(Some(moved), 0.99)]);
        assert!(report.mismatches.is_empty());
        assert_eq!(report.staged.len(), 1);
    }

    #[test]
    fn unknown_fields_and_missing_boxes_skipped() {
        let config = CalibrationConfig::default();
        let mut unknown = evidence(Some(EXPECTED), 0.99);
        unknown.field = "nope".into();
        let report = RegionCalibrator::new(&config).analyze(&template(), &[unknown, evidence(None, 0.99)]);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.staged.is_empty());
    }

    #[test]
    fn calibrate_applies_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hts-form.json");
        let policy = PersistenceConfig {
            auto_save_threshold: 1,
            backup_retention: 5,
        };
        let registry = TemplateRegistry::from_template(template(), &path, policy);
        let config = CalibrationConfig::default();
        let moved = Region::new(0.1, 0.3, 0.2, 0.04);

        let report = RegionCalibrator::new(&config)
            .calibrate(&registry, &[evidence(Some(moved), 0.95)])
            .unwrap();
        assert_eq!(report.applied, 1);
        assert!(report.persisted);

        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot.field(PageSide::Front, "firstName").unwrap().region, Some(moved));
        assert_eq!(snapshot.calibration_count, 1);
        assert_eq!(snapshot.version, "1.0.1");
        assert!(path.exists());
    }

    #[test]
    fn evidence_only_for_answers_with_boxes() {
        let t = template();
        let page = t.page(PageSide::Front).unwrap();
        let mut answers = BTreeMap::new();
        answers.insert(
            "first_name".to_string(),
            QueryAnswer {
                text: "JUAN".into(),
                confidence: 0.9,
                bbox: Some(EXPECTED),
            },
        );
        assert_eq!(evidence_from_answers(PageSide::Front, page, &answers).len(), 1);

        answers.get_mut("first_name").unwrap().bbox = None;
        assert!(evidence_from_answers(PageSide::Front, page, &answers).is_empty());
    }

    #[test]
    fn markdown_lists_mismatches_and_updates() {
        let config = CalibrationConfig::default();
        let moved = Region::new(0.1, 0.3, 0.2, 0.04);
        let report = RegionCalibrator::new(&config).analyze(&template(), &[evidence(Some(moved), 0.95)]);
        let md = report.to_markdown();
        assert!(md.contains("# Region Calibration Report"));
        assert!(md.contains("## FRONT page mismatches"));
        assert!(md.contains("| firstName | First name | 0.200 |"));
        assert!(md.contains("(0.100, 0.300, 0.200, 0.040)"));
    }
}
