//! Query batching against a rate-limited vision service.
//!
//! Queries are split into sequential batches no larger than the smaller of
//! the service cap and the configured cap, with a pause between batches.
//! A throttled batch is retried alone with bounded exponential backoff;
//! results of earlier batches are kept whatever happens to later ones.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use super::types::{AnalysisResult, VisionQuery, VisionService};
use super::VisionError;
use crate::pipeline_config::BatchConfig;

/// A batch that failed after all retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchError {
    pub batch: usize,
    pub aliases: Vec<String>,
    pub error: String,
}

/// Merged output of every batch that succeeded.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub result: AnalysisResult,
    pub batches: usize,
    pub batch_errors: Vec<BatchError>,
}

/// Exponential backoff for the n-th retry (1-based) plus up to 25% jitter,
/// never above `max_backoff_ms`.
pub fn retry_delay_ms(attempt: u32, config: &BatchConfig) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = config
        .base_backoff_ms
        .saturating_mul(1u64 << exponent)
        .min(config.max_backoff_ms);
    let jitter_span = delay / 4;
    if jitter_span == 0 {
        return delay;
    }
    (delay + rand::thread_rng().gen_range(0..=jitter_span)).min(config.max_backoff_ms)
}

/// Analyze one page image, splitting `queries` into batches.
///
/// Fails only when no batch succeeded; otherwise per-batch failures are
/// reported in `batch_errors` alongside the merged partial result.
pub fn analyze_in_batches(
    service: &dyn VisionService,
    image: &[u8],
    queries: &[VisionQuery],
    config: &BatchConfig,
) -> Result<BatchOutcome, VisionError> {
    let batch_size = service
        .max_queries_per_call()
        .min(config.max_queries_per_call)
        .max(1);

    // No queries still needs one call for the raw text blocks.
    let batches: Vec<&[VisionQuery]> = if queries.is_empty() {
        vec![&queries[..0]]
    } else {
        queries.chunks(batch_size).collect()
    };

    let mut outcome = BatchOutcome {
        batches: batches.len(),
        ..Default::default()
    };
    let mut succeeded = 0usize;
    let mut last_error: Option<VisionError> = None;

    for (index, batch) in batches.iter().enumerate() {
        if index > 0 && config.inter_batch_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(config.inter_batch_delay_ms));
        }

        match analyze_with_retry(service, image, batch, index, config) {
            Ok(result) => {
                succeeded += 1;
                outcome.result.merge(result);
            }
            Err(e) => {
                tracing::warn!(
                    batch = index,
                    size = batch.len(),
                    throttled = e.is_throttled(),
                    error = %e,
                    "Vision batch failed"
                );
                outcome.batch_errors.push(BatchError {
                    batch: index,
                    aliases: batch.iter().map(|q| q.alias.clone()).collect(),
                    error: e.to_string(),
                });
                last_error = Some(e);
            }
        }
    }

    match (succeeded, last_error) {
        (0, Some(e)) => Err(e),
        _ => Ok(outcome),
    }
}

fn analyze_with_retry(
    service: &dyn VisionService,
    image: &[u8],
    batch: &[VisionQuery],
    index: usize,
    config: &BatchConfig,
) -> Result<AnalysisResult, VisionError> {
    let mut attempt = 0u32;
    loop {
        match service.analyze(image, batch) {
            Ok(result) => return Ok(result),
            Err(VisionError::Throttled { retry_after_ms }) if attempt < config.max_retries => {
                attempt += 1;
                let delay = retry_after_ms
                    .map(|ms| ms.min(config.max_backoff_ms))
                    .unwrap_or_else(|| retry_delay_ms(attempt, config));
                tracing::warn!(
                    batch = index,
                    attempt,
                    delay_ms = delay,
                    "Vision service throttled, backing off"
                );
                if delay > 0 {
                    std::thread::sleep(Duration::from_millis(delay));
                }
            }
            Err(e) => return Err(e),
        }
    }
}
