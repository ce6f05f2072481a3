pub mod types;
pub mod preprocess;
pub mod aliases;
pub mod region_text;
pub mod marks;
pub mod extractor;
pub mod confidence;

pub use types::*;
pub use preprocess::*;
pub use aliases::*;
pub use extractor::*;
pub use confidence::*;

use thiserror::Error;

use crate::pipeline::detector::DetectionError;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Detection error: {0}")]
    Detection(#[from] DetectionError),

    #[error("Invalid field pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}
