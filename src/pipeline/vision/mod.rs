//! Boundary to the external document-analysis service.

pub mod types;
pub mod client;
pub mod batching;

pub use batching::*;
pub use client::*;
pub use types::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VisionError {
    #[error("Vision service throttled the request")]
    Throttled { retry_after_ms: Option<u64> },

    #[error("Cannot reach vision service at {0}")]
    Connection(String),

    #[error("Vision service error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Failed to parse vision response: {0}")]
    ResponseParsing(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),
}

impl VisionError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }
}
