//! Form template: versioned field definitions and their single-writer registry.

pub mod types;
pub mod store;
pub mod registry;

pub use registry::*;
pub use store::*;
pub use types::*;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Unknown field '{field}' on {page} page")]
    UnknownField { page: PageSide, field: String },

    #[error("Invalid region for '{field}': {reason}")]
    InvalidRegion { field: String, reason: String },

    #[error("Template mismatch: expected '{expected}', found '{found}'")]
    IdMismatch { expected: String, found: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed template JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal lock poisoned")]
    LockPoisoned,
}
