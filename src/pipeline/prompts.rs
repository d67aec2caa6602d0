//! Per-document-type prompt templates and declared field labels.
//!
//! Each extractor variant owns a fixed prompt describing exactly which
//! fields to extract and the expected output shape (a list of
//! `Field: value` lines). The identity and log-card prompts are tuned per
//! deployment and must be supplied through configuration — a missing
//! template is a fatal startup condition for that variant. The license
//! prompt is stable across deployments and ships built in.

use crate::config::{ConfigError, Settings};
use crate::pipeline::parse::ParseStrategy;
use crate::pipeline::runtime::DecodeOptions;
use crate::session::DocumentKind;

/// Marker phrase both configurable prompts end with. Models that echo
/// their instructions repeat it, so strict parsing anchors on it.
pub const INSTRUCTION_MARKER: &str = "Only output the extracted information";

/// Built-in driver's license prompt.
pub const LICENSE_PROMPT: &str = "\
Below is a driver's license image. <image>\n\
Extract and list the following information in exactly this format:\n\
Name: [Full name including Chinese name if present]\n\
License Number: [License number]\n\
Date of birth: [DOB in DD-MM-YYYY format]\n\
Issue Date: [Issue date in DD-MM-YYYY format]\n\n\
Only output the extracted information in the exact format above.";

/// Identity-card fields, in declared order.
pub const ID_CARD_FIELDS: &[&str] = &["Name", "Race", "Date of birth", "Sex"];

/// Driver's-license fields, in declared order.
pub const LICENSE_FIELDS: &[&str] = &["Name", "License Number", "Date of birth", "Issue Date"];

/// Vehicle log-card fields, in declared order.
pub const LOG_CARD_FIELDS: &[&str] = &[
    "Vehicle No",
    "Make/Model",
    "Vehicle Type",
    "Vehicle Attachment 1",
    "Vehicle Scheme",
    "Chassis No",
    "Propellant",
    "Engine No",
    "Motor No",
    "Engine Capacity",
    "Power Rating",
    "Maximum Power Output",
    "Maximum Laden Weight",
    "Unladen Weight",
    "Year Of Manufacture",
    "Original Registration Date",
    "Lifespan Expiry Date",
    "COE Category",
    "PQP Paid",
    "COE Expiry Date",
    "Road Tax Expiry Date",
    "PARF Eligibility Expiry Date",
    "Inspection Due Date",
    "Intended Transfer Date",
];

/// Referral fields collected as free text, in declared order.
pub const REFERRAL_FIELDS: &[&str] = &["Referrer's Name", "Contact Number", "Dealership"];

/// Declared labels for a document kind.
pub fn declared_labels(kind: DocumentKind) -> &'static [&'static str] {
    match kind {
        DocumentKind::IdCard => ID_CARD_FIELDS,
        DocumentKind::License => LICENSE_FIELDS,
        DocumentKind::LogCard => LOG_CARD_FIELDS,
        DocumentKind::Referral => REFERRAL_FIELDS,
    }
}

/// Parsing strategy per kind. The identity prompt makes the model echo its
/// instructions, so identity output is parsed strictly after the marker;
/// the other prompts yield only the answer.
pub fn strategy_for(kind: DocumentKind) -> ParseStrategy {
    match kind {
        DocumentKind::IdCard => ParseStrategy::Strict(INSTRUCTION_MARKER),
        _ => ParseStrategy::Scan,
    }
}

/// Fixed decode parameters per kind. The log card is denser and longer, so
/// it trades beams and token budget for latency.
pub fn decode_options(kind: DocumentKind) -> DecodeOptions {
    match kind {
        DocumentKind::LogCard => DecodeOptions {
            max_new_tokens: 128,
            num_beams: 2,
            temperature: 0.3,
            repetition_penalty: 1.2,
            sample: true,
        },
        _ => DecodeOptions {
            max_new_tokens: 256,
            num_beams: 3,
            temperature: 0.3,
            repetition_penalty: 1.2,
            sample: false,
        },
    }
}

/// The resolved prompt templates for all photo-bearing variants.
#[derive(Debug, Clone)]
pub struct PromptSet {
    id_card: String,
    license: String,
    log_card: String,
}

impl PromptSet {
    pub fn new(id_card: String, license: String, log_card: String) -> Self {
        Self {
            id_card,
            license,
            log_card,
        }
    }

    /// Build from settings. Missing required templates were already
    /// rejected by [`Settings::from_env`]; this re-checks for callers that
    /// construct `Settings` by hand.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        if settings.id_card_prompt.trim().is_empty() {
            return Err(ConfigError::MissingPrompt("ID_CARD_PROMPT"));
        }
        if settings.log_card_prompt.trim().is_empty() {
            return Err(ConfigError::MissingPrompt("LOG_CARD_PROMPT"));
        }
        Ok(Self::new(
            settings.id_card_prompt.clone(),
            settings.license_prompt.clone(),
            settings.log_card_prompt.clone(),
        ))
    }

    /// Prompt for a photo-bearing kind. Referral has no prompt — it is
    /// collected as text, not extracted from an image.
    pub fn for_kind(&self, kind: DocumentKind) -> Option<&str> {
        match kind {
            DocumentKind::IdCard => Some(&self.id_card),
            DocumentKind::License => Some(&self.license),
            DocumentKind::LogCard => Some(&self.log_card),
            DocumentKind::Referral => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt_set() -> PromptSet {
        PromptSet::new(
            "id prompt".into(),
            LICENSE_PROMPT.into(),
            "log prompt".into(),
        )
    }

    #[test]
    fn license_prompt_declares_every_field() {
        for field in LICENSE_FIELDS {
            assert!(
                LICENSE_PROMPT.contains(&format!("{field}:")),
                "license prompt missing {field}"
            );
        }
        assert!(LICENSE_PROMPT.contains(INSTRUCTION_MARKER));
    }

    #[test]
    fn log_card_declares_twenty_four_fields() {
        assert_eq!(LOG_CARD_FIELDS.len(), 24);
        assert!(LOG_CARD_FIELDS.contains(&"Chassis No"));
        assert!(LOG_CARD_FIELDS.contains(&"Intended Transfer Date"));
    }

    #[test]
    fn identity_uses_strict_parsing() {
        assert_eq!(
            strategy_for(DocumentKind::IdCard),
            ParseStrategy::Strict(INSTRUCTION_MARKER)
        );
        assert_eq!(strategy_for(DocumentKind::License), ParseStrategy::Scan);
        assert_eq!(strategy_for(DocumentKind::LogCard), ParseStrategy::Scan);
    }

    #[test]
    fn log_card_decode_options_are_cheaper() {
        let log = decode_options(DocumentKind::LogCard);
        let id = decode_options(DocumentKind::IdCard);
        assert_eq!(log.max_new_tokens, 128);
        assert_eq!(log.num_beams, 2);
        assert!(log.sample);
        assert_eq!(id.max_new_tokens, 256);
        assert_eq!(id.num_beams, 3);
        assert!(!id.sample);
    }

    #[test]
    fn referral_has_no_prompt() {
        let prompts = prompt_set();
        assert!(prompts.for_kind(DocumentKind::Referral).is_none());
        assert_eq!(prompts.for_kind(DocumentKind::IdCard), Some("id prompt"));
    }
}
