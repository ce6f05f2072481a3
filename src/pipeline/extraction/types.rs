use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::template::PageSide;

/// Which extraction strategies may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionMode {
    QueryOnly,
    RegionOnly,
    #[default]
    Hybrid,
}

impl ExtractionMode {
    pub fn allows_query(&self) -> bool {
        matches!(self, Self::QueryOnly | Self::Hybrid)
    }

    pub fn allows_region(&self) -> bool {
        matches!(self, Self::RegionOnly | Self::Hybrid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueryOnly => "query-only",
            Self::RegionOnly => "region-only",
            Self::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExtractionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "query-only" | "queries" => Ok(Self::QueryOnly),
            "region-only" | "coordinate" => Ok(Self::RegionOnly),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown extraction mode: {other}")),
        }
    }
}

/// The strategy (or failure mode) a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionSource {
    Query,
    FormField,
    CoordinateNoBlocks,
    CoordinateNoRegion,
    CheckboxSingle,
    CheckboxMulti,
    CheckboxWithText,
    CheckboxMultiWithText,
    CheckboxNested,
    CheckboxMatrix,
    Signature,
    Failed,
    Error,
}

impl ExtractionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::FormField => "form-field",
            Self::CoordinateNoBlocks => "coordinate-no-blocks",
            Self::CoordinateNoRegion => "coordinate-no-region",
            Self::CheckboxSingle => "checkbox-single",
            Self::CheckboxMulti => "checkbox-multi",
            Self::CheckboxWithText => "checkbox-with-text",
            Self::CheckboxMultiWithText => "checkbox-multi-with-text",
            Self::CheckboxNested => "checkbox-nested",
            Self::CheckboxMatrix => "checkbox-matrix",
            Self::Signature => "signature",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ExtractionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A checked option, with its dependent text and sub-fields when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub option: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_fields: BTreeMap<String, ExtractionResult>,
}

impl Choice {
    pub fn new(option: &str) -> Self {
        Self {
            option: option.to_string(),
            text: None,
            sub_fields: BTreeMap::new(),
        }
    }
}

/// One row of a checkbox matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixRow {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// Extracted value; shape depends on the field's extraction method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Flag(bool),
    Selection(Vec<String>),
    Choice(Box<Choice>),
    Choices(Vec<Choice>),
    Matrix(BTreeMap<String, MatrixRow>),
}

impl FieldValue {
    /// Scalar text form used by validators and cross-field checks.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t.as_str()),
            Self::Choice(c) => Some(c.option.as_str()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(t) => t.trim().is_empty(),
            Self::Flag(_) => false,
            Self::Selection(v) => v.is_empty(),
            Self::Choice(_) => false,
            Self::Choices(v) => v.is_empty(),
            Self::Matrix(m) => m.is_empty(),
        }
    }
}

/// An attempt that lost, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub method: ExtractionSource,
    pub confidence: f32,
}

/// Where a result came from and what it beat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Query alias the answer was found under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_up: Option<AttemptSummary>,
    /// Attempts below their strategy minimum.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<AttemptSummary>,
    /// Number of text blocks matched by a region strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_count: Option<usize>,
    /// Value before a validation correction replaced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_value: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-field extraction outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub value: Option<FieldValue>,
    pub confidence: f32,
    pub requires_review: bool,
    pub method: ExtractionSource,
    #[serde(default)]
    pub provenance: Provenance,
}

impl ExtractionResult {
    pub fn new(value: Option<FieldValue>, confidence: f32, method: ExtractionSource) -> Self {
        Self {
            value,
            confidence,
            requires_review: false,
            method,
            provenance: Provenance::default(),
        }
    }

    /// No attempt cleared its threshold.
    pub fn failed() -> Self {
        Self {
            value: None,
            confidence: 0.0,
            requires_review: true,
            method: ExtractionSource::Failed,
            provenance: Provenance::default(),
        }
    }

    /// The field could not be processed at all.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            value: None,
            confidence: 0.0,
            requires_review: true,
            method: ExtractionSource::Error,
            provenance: Provenance {
                error: Some(message.into()),
                ..Provenance::default()
            },
        }
    }

    pub fn with_review(mut self, requires_review: bool) -> Self {
        self.requires_review = requires_review;
        self
    }

    pub fn text(&self) -> Option<&str> {
        self.value.as_ref().and_then(FieldValue::as_text)
    }
}

/// Field results for one page, keyed by field name.
pub type PageFields = BTreeMap<String, ExtractionResult>;

/// Field results for the whole document.
pub type DocumentFields = BTreeMap<PageSide, PageFields>;

/// Counts by confidence band and method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub total: usize,
    /// Confidence ≥ 0.90.
    pub high: usize,
    /// Confidence in [0.70, 0.90).
    pub medium: usize,
    /// Confidence < 0.70.
    pub low: usize,
    pub requires_review: usize,
    pub by_method: BTreeMap<ExtractionSource, usize>,
    pub average_confidence: f32,
}
