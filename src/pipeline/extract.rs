//! Per-document extraction strategies.
//!
//! Each photo-bearing document kind has its own extractor: same skeleton
//! (verify → downscale → model → parse), different prompt, decode
//! parameters, and recovery behavior. Extraction is infallible at this
//! boundary — pipeline errors are converted into an in-band status entry
//! under [`STATUS_KEY`] so the conversation layer always has a field map
//! to act on.

use std::path::Path;
use std::sync::Arc;

use image::RgbImage;
use tracing::{info, warn};

use super::ocr::{parse_identity_lines, OcrEngine};
use super::parse::{parse_fields, FieldDefaults, NOT_FOUND};
use super::preprocess::{
    cap_longest_side, encode_gray_png, encode_png, ocr_preprocess, verify_rgb,
    MAX_MODEL_DIMENSION,
};
use super::prompts::{declared_labels, decode_options, strategy_for, PromptSet};
use super::runtime::ModelRuntime;
use super::ExtractionError;
use crate::session::{DocumentKind, FieldMap};

/// Reserved key carrying an extraction status sentinel. Never a declared
/// field label, so it cannot collide with extracted data.
pub const STATUS_KEY: &str = "_status";

pub const STATUS_VERIFICATION_FAILED: &str = "Image verification failed";
pub const STATUS_MODEL_LOAD_FAILED: &str = "Model loading failed";
pub const STATUS_GENERATION_FAILED: &str = "Text generation failed";
pub const STATUS_IMAGE_PROCESSING_FAILED: &str = "Image processing failed";
pub const STATUS_NO_DATA: &str = "No data found";

/// One extraction strategy, bound to a document kind.
pub trait DocumentExtractor: Send + Sync {
    fn kind(&self) -> DocumentKind;

    /// Extract fields from a photo on disk. Infallible: errors surface as
    /// a status entry in the returned map.
    fn extract(&self, image_path: &Path) -> FieldMap;
}

/// Did an extraction produce usable data? True when no status sentinel is
/// present and at least one declared field was recovered.
pub fn extraction_succeeded(fields: &FieldMap, kind: DocumentKind) -> bool {
    if fields.contains_key(STATUS_KEY) {
        return false;
    }
    declared_labels(kind)
        .iter()
        .any(|l| fields.get(*l).is_some_and(|v| v != NOT_FOUND))
}

/// All declared labels as sentinels plus the status entry.
fn status_map(kind: DocumentKind, status: &str) -> FieldMap {
    let mut fields: FieldMap = declared_labels(kind)
        .iter()
        .map(|l| (l.to_string(), NOT_FOUND.to_string()))
        .collect();
    fields.insert(STATUS_KEY.to_string(), status.to_string());
    fields
}

fn status_for(err: &ExtractionError) -> &'static str {
    match err {
        ExtractionError::ModelLoad(_) => STATUS_MODEL_LOAD_FAILED,
        ExtractionError::Generation(_) => STATUS_GENERATION_FAILED,
        _ => STATUS_IMAGE_PROCESSING_FAILED,
    }
}

/// Shared model path over an already-verified image: cap its size, run one
/// inference, return the raw model text.
fn run_model(
    runtime: &ModelRuntime,
    rgb: RgbImage,
    prompt: &str,
    kind: DocumentKind,
) -> Result<String, ExtractionError> {
    let capped = cap_longest_side(rgb, MAX_MODEL_DIMENSION);
    let png = encode_png(&capped)?;
    runtime.generate(&[png], prompt, &decode_options(kind))
}

// ──────────────────────────────────────────────
// Identity card
// ──────────────────────────────────────────────

/// Identity-card extractor: model first, OCR heuristic as fallback when the
/// model cannot be loaded, fails to generate, or recovers nothing.
pub struct IdCardExtractor {
    runtime: Arc<ModelRuntime>,
    prompt: String,
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl IdCardExtractor {
    pub fn new(runtime: Arc<ModelRuntime>, prompt: String, ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        Self { runtime, prompt, ocr }
    }

    fn ocr_fallback(&self, rgb: &RgbImage) -> Option<FieldMap> {
        let engine = self.ocr.as_ref()?;
        let png = match encode_gray_png(&ocr_preprocess(rgb)) {
            Ok(png) => png,
            Err(e) => {
                warn!(error = %e, "OCR fallback preprocessing failed");
                return None;
            }
        };
        match engine.recognize_text(&png) {
            Ok(text) => {
                let fields = parse_identity_lines(&text);
                if extraction_succeeded(&fields, DocumentKind::IdCard) {
                    info!("Identity fields recovered via OCR fallback");
                    Some(fields)
                } else {
                    None
                }
            }
            Err(e) => {
                warn!(error = %e, "OCR fallback failed");
                None
            }
        }
    }
}

impl DocumentExtractor for IdCardExtractor {
    fn kind(&self) -> DocumentKind {
        DocumentKind::IdCard
    }

    fn extract(&self, image_path: &Path) -> FieldMap {
        let kind = self.kind();
        let rgb = match verify_rgb(image_path) {
            Ok(rgb) => rgb,
            Err(_) => return status_map(kind, STATUS_VERIFICATION_FAILED),
        };

        match run_model(&self.runtime, rgb.clone(), &self.prompt, kind) {
            Ok(raw) => {
                let fields =
                    parse_fields(&raw, declared_labels(kind), strategy_for(kind), &FieldDefaults::new());
                if extraction_succeeded(&fields, kind) {
                    return fields;
                }
                self.ocr_fallback(&rgb)
                    .unwrap_or_else(|| status_map(kind, STATUS_NO_DATA))
            }
            // The model being unreachable and the model generating garbage
            // are equally recoverable by classic OCR.
            Err(e @ (ExtractionError::Generation(_) | ExtractionError::ModelLoad(_))) => {
                warn!(error = %e, "Model unavailable, trying OCR fallback");
                self.ocr_fallback(&rgb)
                    .unwrap_or_else(|| status_map(kind, status_for(&e)))
            }
            Err(e) => status_map(kind, status_for(&e)),
        }
    }
}

// ──────────────────────────────────────────────
// Driver's license
// ──────────────────────────────────────────────

/// License extractor: single model pass, no fallback.
pub struct LicenseExtractor {
    runtime: Arc<ModelRuntime>,
    prompt: String,
}

impl LicenseExtractor {
    pub fn new(runtime: Arc<ModelRuntime>, prompt: String) -> Self {
        Self { runtime, prompt }
    }
}

impl DocumentExtractor for LicenseExtractor {
    fn kind(&self) -> DocumentKind {
        DocumentKind::License
    }

    fn extract(&self, image_path: &Path) -> FieldMap {
        let kind = self.kind();
        let rgb = match verify_rgb(image_path) {
            Ok(rgb) => rgb,
            Err(_) => return status_map(kind, STATUS_VERIFICATION_FAILED),
        };
        match run_model(&self.runtime, rgb, &self.prompt, kind) {
            Ok(raw) => {
                let fields =
                    parse_fields(&raw, declared_labels(kind), strategy_for(kind), &FieldDefaults::new());
                if extraction_succeeded(&fields, kind) {
                    fields
                } else {
                    status_map(kind, STATUS_NO_DATA)
                }
            }
            Err(e) => status_map(kind, status_for(&e)),
        }
    }
}

// ──────────────────────────────────────────────
// Vehicle log card
// ──────────────────────────────────────────────

/// Log-card extractor: single model pass, then configured per-field
/// defaults fill whatever the model missed.
pub struct LogCardExtractor {
    runtime: Arc<ModelRuntime>,
    prompt: String,
    defaults: FieldDefaults,
}

impl LogCardExtractor {
    pub fn new(runtime: Arc<ModelRuntime>, prompt: String, defaults: FieldDefaults) -> Self {
        Self {
            runtime,
            prompt,
            defaults,
        }
    }
}

impl DocumentExtractor for LogCardExtractor {
    fn kind(&self) -> DocumentKind {
        DocumentKind::LogCard
    }

    fn extract(&self, image_path: &Path) -> FieldMap {
        let kind = self.kind();
        let rgb = match verify_rgb(image_path) {
            Ok(rgb) => rgb,
            Err(_) => return status_map(kind, STATUS_VERIFICATION_FAILED),
        };
        match run_model(&self.runtime, rgb, &self.prompt, kind) {
            Ok(raw) => {
                // No-data is judged on what the model produced; defaults
                // only supplement an extraction that recovered something.
                let parsed =
                    parse_fields(&raw, declared_labels(kind), strategy_for(kind), &FieldDefaults::new());
                if !extraction_succeeded(&parsed, kind) {
                    return status_map(kind, STATUS_NO_DATA);
                }
                parse_fields(&raw, declared_labels(kind), strategy_for(kind), &self.defaults)
            }
            Err(e) => status_map(kind, status_for(&e)),
        }
    }
}

// ──────────────────────────────────────────────
// Factory
// ──────────────────────────────────────────────

/// Builds the extractor for a document kind from shared pipeline state.
pub struct ExtractorFactory {
    runtime: Arc<ModelRuntime>,
    prompts: PromptSet,
    log_card_defaults: FieldDefaults,
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl ExtractorFactory {
    pub fn new(
        runtime: Arc<ModelRuntime>,
        prompts: PromptSet,
        log_card_defaults: FieldDefaults,
        ocr: Option<Arc<dyn OcrEngine>>,
    ) -> Self {
        Self {
            runtime,
            prompts,
            log_card_defaults,
            ocr,
        }
    }

    /// Extractor for a photo-bearing kind. Referral is collected as text
    /// and has no extractor.
    pub fn for_kind(&self, kind: DocumentKind) -> Option<Box<dyn DocumentExtractor>> {
        let prompt = self.prompts.for_kind(kind)?.to_string();
        match kind {
            DocumentKind::IdCard => Some(Box::new(IdCardExtractor::new(
                self.runtime.clone(),
                prompt,
                self.ocr.clone(),
            ))),
            DocumentKind::License => {
                Some(Box::new(LicenseExtractor::new(self.runtime.clone(), prompt)))
            }
            DocumentKind::LogCard => Some(Box::new(LogCardExtractor::new(
                self.runtime.clone(),
                prompt,
                self.log_card_defaults.clone(),
            ))),
            DocumentKind::Referral => None,
        }
    }
}
