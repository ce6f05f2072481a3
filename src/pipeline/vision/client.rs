//! Vision service clients.
//!
//! `HttpVisionClient` talks to a document-analysis endpoint over blocking
//! HTTP. The wire format reports confidences as percentages; they are
//! normalized to `[0, 1]` here so nothing downstream sees the 0-100 scale.
//! `MockVisionService` replays a canned result for tests and offline runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::types::{AnalysisResult, BoundingBox, QueryAnswer, TextBlock, VisionQuery, VisionService};
use super::VisionError;

/// Service-side cap on queries per request.
pub const DEFAULT_MAX_QUERIES: usize = 15;

// ──────────────────────────────────────────────
// Wire types
// ──────────────────────────────────────────────

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    image: String,
    #[serde(skip_serializing_if = "no_queries")]
    queries: &'a [VisionQuery],
}

fn no_queries(queries: &&[VisionQuery]) -> bool {
    queries.is_empty()
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    blocks: Vec<WireBlock>,
    #[serde(default)]
    answers: BTreeMap<String, WireAnswer>,
}

#[derive(Deserialize)]
struct WireBlock {
    text: String,
    /// Percent, 0-100.
    confidence: f32,
    bbox: BoundingBox,
}

#[derive(Deserialize)]
struct WireAnswer {
    text: String,
    /// Percent, 0-100.
    confidence: f32,
    #[serde(default)]
    bbox: Option<BoundingBox>,
}

fn normalize_percent(confidence: f32) -> f32 {
    if confidence.is_finite() {
        (confidence / 100.0).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl From<AnalyzeResponse> for AnalysisResult {
    fn from(wire: AnalyzeResponse) -> Self {
        let blocks = wire
            .blocks
            .into_iter()
            .map(|b| TextBlock {
                text: b.text,
                confidence: normalize_percent(b.confidence),
                bbox: b.bbox,
            })
            .collect();
        let answers = wire
            .answers
            .into_iter()
            .map(|(alias, a)| {
                (
                    alias,
                    QueryAnswer {
                        text: a.text,
                        confidence: normalize_percent(a.confidence),
                        bbox: a.bbox,
                    },
                )
            })
            .collect();
        AnalysisResult { blocks, answers }
    }
}

// ──────────────────────────────────────────────
// HttpVisionClient
// ──────────────────────────────────────────────

pub struct HttpVisionClient {
    base_url: String,
    client: reqwest::blocking::Client,
    api_key: Option<String>,
    timeout_secs: u64,
    max_queries: usize,
}

impl HttpVisionClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, VisionError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| VisionError::Http(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            api_key: None,
            timeout_secs,
            max_queries: DEFAULT_MAX_QUERIES,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_max_queries(mut self, max: usize) -> Self {
        self.max_queries = max.max(1);
        self
    }

    /// Parse a `Retry-After` header given in seconds.
    fn retry_after_ms(response: &reqwest::blocking::Response) -> Option<u64> {
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs * 1000)
    }
}

impl VisionService for HttpVisionClient {
    fn max_queries_per_call(&self) -> usize {
        self.max_queries
    }

    fn analyze(
        &self,
        image: &[u8],
        queries: &[VisionQuery],
    ) -> Result<AnalysisResult, VisionError> {
        let _span = tracing::info_span!(
            "vision_analyze",
            image_size = image.len(),
            queries = queries.len(),
        )
        .entered();
        let start = std::time::Instant::now();

        let url = format!("{}/analyze", self.base_url);
        let body = AnalyzeRequest {
            image: base64::engine::general_purpose::STANDARD.encode(image),
            queries,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().map_err(|e| {
            if e.is_connect() {
                VisionError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                VisionError::Http(format!("Request timed out after {}s", self.timeout_secs))
            } else {
                VisionError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(VisionError::Throttled {
                retry_after_ms: Self::retry_after_ms(&response),
            });
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(VisionError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: AnalyzeResponse = response
            .json()
            .map_err(|e| VisionError::ResponseParsing(e.to_string()))?;
        let result = AnalysisResult::from(parsed);

        tracing::info!(
            elapsed_ms = %start.elapsed().as_millis(),
            blocks = result.blocks.len(),
            answers = result.answers.len(),
            "Vision analysis complete"
        );
        Ok(result)
    }
}

// ──────────────────────────────────────────────
// MockVisionService
// ──────────────────────────────────────────────

/// Replays a fixed result. Answers are filtered to the aliases actually
/// queried, the way a real service only answers what it was asked.
pub struct MockVisionService {
    result: AnalysisResult,
    max_queries: usize,
    calls: AtomicUsize,
    received: Mutex<Vec<Vec<String>>>,
}

impl MockVisionService {
    pub fn new(result: AnalysisResult) -> Self {
        Self {
            result,
            max_queries: DEFAULT_MAX_QUERIES,
            calls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(AnalysisResult::default())
    }

    pub fn with_max_queries(mut self, max: usize) -> Self {
        self.max_queries = max.max(1);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Aliases received per call, in call order.
    pub fn received_batches(&self) -> Vec<Vec<String>> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl VisionService for MockVisionService {
    fn max_queries_per_call(&self) -> usize {
        self.max_queries
    }

    fn analyze(
        &self,
        _image: &[u8],
        queries: &[VisionQuery],
    ) -> Result<AnalysisResult, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut received) = self.received.lock() {
            received.push(queries.iter().map(|q| q.alias.clone()).collect());
        }
        let answers = queries
            .iter()
            .filter_map(|q| {
                self.result
                    .answers
                    .get(&q.alias)
                    .map(|a| (q.alias.clone(), a.clone()))
            })
            .collect();
        Ok(AnalysisResult {
            blocks: self.result.blocks.clone(),
            answers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Region;

    #[test]
    fn wire_confidence_normalized_from_percent() {
        let json = r#"{
            "blocks": [{"text": "JUAN", "confidence": 92.5,
                        "bbox": {"x": 0.1, "y": 0.2, "width": 0.1, "height": 0.03}}],
            "answers": {"first_name": {"text": "JUAN", "confidence": 180.0}}
        }"#;
        let wire: AnalyzeResponse = serde_json::from_str(json).unwrap();
        let result = AnalysisResult::from(wire);
        assert!((result.blocks[0].confidence - 0.925).abs() < 1e-6);
        assert!((result.answers["first_name"].confidence - 1.0).abs() < f32::EPSILON);
        assert!(result.answers["first_name"].bbox.is_none());
    }

    #[test]
    fn wire_missing_sections_default_empty() {
        let wire: AnalyzeResponse = serde_json::from_str("{}").unwrap();
        assert!(AnalysisResult::from(wire).is_empty());
    }

    #[test]
    fn non_finite_confidence_is_zero() {
        assert!(normalize_percent(f32::NAN).abs() < f32::EPSILON);
        assert!((normalize_percent(-5.0)).abs() < f32::EPSILON);
    }

    #[test]
    fn request_omits_empty_queries() {
        let body = AnalyzeRequest {
            image: "aGk=".into(),
            queries: &[],
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("queries"));
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = HttpVisionClient::new("http://localhost:8080/", 5).unwrap();
        assert_eq!(client.base_url, "http://localhost:8080");
        assert_eq!(client.max_queries_per_call(), DEFAULT_MAX_QUERIES);
    }

    #[test]
    fn mock_answers_only_requested_aliases() {
        let canned = AnalysisResult {
            blocks: vec![],
            answers: [
                (
                    "first_name".to_string(),
                    QueryAnswer {
                        text: "JUAN".into(),
                        confidence: 0.9,
                        bbox: Some(Region::new(0.1, 0.1, 0.1, 0.02)),
                    },
                ),
                (
                    "last_name".to_string(),
                    QueryAnswer {
                        text: "CRUZ".into(),
                        confidence: 0.9,
                        bbox: None,
                    },
                ),
            ]
            .into(),
        };
        let mock = MockVisionService::new(canned);
        let result = mock
            .analyze(b"img", &[VisionQuery::new("first_name", "What is the first name?")])
            .unwrap();
        assert_eq!(result.answers.len(), 1);
        assert!(result.answers.contains_key("first_name"));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.received_batches(), vec![vec!["first_name".to_string()]]);
    }
}
