pub mod extract;
pub mod ingest;
pub mod ocr;
pub mod parse;
pub mod preprocess;
pub mod prompts;
pub mod runtime;

pub use extract::*;
pub use ingest::*;
pub use parse::*;
pub use prompts::*;
pub use runtime::*;

use thiserror::Error;

/// Errors raised inside the extraction pipeline.
///
/// These never escape to the conversation layer: extractor variants catch
/// them at their boundary and convert them into sentinel field maps so the
/// controller always has *some* result to act on.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Text generation failed: {0}")]
    Generation(String),

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("OCR initialization failed: {0}")]
    OcrInit(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),
}
