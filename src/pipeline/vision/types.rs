use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::VisionError;
use crate::template::Region;

/// Bounding boxes share the normalized page coordinate system of regions.
pub type BoundingBox = Region;

/// A run of text detected by the vision service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    /// Normalized to `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// The service's answer to one natural-language query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub text: String,
    /// Normalized to `[0, 1]`.
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

/// Per-page analysis output. Read-only input to extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub blocks: Vec<TextBlock>,
    /// Keyed by query alias.
    #[serde(default)]
    pub answers: BTreeMap<String, QueryAnswer>,
}

impl AnalysisResult {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.answers.is_empty()
    }

    /// Fold a later batch into this result.
    ///
    /// Every batch re-analyses the same image, so raw blocks are taken from
    /// the first batch that returned any; answers accumulate.
    pub fn merge(&mut self, other: AnalysisResult) {
        if self.blocks.is_empty() {
            self.blocks = other.blocks;
        }
        self.answers.extend(other.answers);
    }
}

/// A natural-language question keyed by the alias its answer comes back under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionQuery {
    pub alias: String,
    pub text: String,
}

impl VisionQuery {
    pub fn new(alias: &str, text: &str) -> Self {
        Self {
            alias: alias.to_string(),
            text: text.to_string(),
        }
    }
}

/// External document-analysis service.
///
/// Implementations must normalize confidences to `[0, 1]` and report
/// rate limiting as `VisionError::Throttled` so callers can back off.
pub trait VisionService: Send + Sync {
    /// Largest query batch accepted by a single `analyze` call.
    fn max_queries_per_call(&self) -> usize;

    fn analyze(
        &self,
        image: &[u8],
        queries: &[VisionQuery],
    ) -> Result<AnalysisResult, VisionError>;
}
