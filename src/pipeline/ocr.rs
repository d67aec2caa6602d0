//! Text-recognition fallback for the identity-card extractor.
//!
//! When the vision model cannot be reached or produces nothing usable, the
//! identity extractor falls back to classic OCR over the preprocessed image
//! and recovers fields with a line-proximity heuristic: identity cards print
//! each field label on one line and its value on the next.

use tracing::debug;

use super::parse::NOT_FOUND;
use super::ExtractionError;
use crate::session::FieldMap;

/// Plain text recognition over a PNG-encoded image.
pub trait OcrEngine: Send + Sync {
    fn recognize_text(&self, image_png: &[u8]) -> Result<String, ExtractionError>;
}

/// Tesseract-backed engine. Only available when compiled with the `ocr`
/// feature flag.
#[cfg(feature = "ocr")]
pub struct TesseractOcr {
    tessdata_dir: std::path::PathBuf,
    lang: String,
}

#[cfg(feature = "ocr")]
impl TesseractOcr {
    /// Initialize with a tessdata directory; English must be installed.
    pub fn new(tessdata_dir: &std::path::Path) -> Result<Self, ExtractionError> {
        if !tessdata_dir.join("eng.traineddata").exists() {
            return Err(ExtractionError::OcrInit(format!(
                "eng.traineddata not found in {}",
                tessdata_dir.display()
            )));
        }
        Ok(Self {
            tessdata_dir: tessdata_dir.to_path_buf(),
            lang: "eng".to_string(),
        })
    }

    pub fn with_language(mut self, lang: &str) -> Self {
        self.lang = lang.to_string();
        self
    }
}

#[cfg(feature = "ocr")]
impl OcrEngine for TesseractOcr {
    fn recognize_text(&self, image_png: &[u8]) -> Result<String, ExtractionError> {
        let tessdata_str = self
            .tessdata_dir
            .to_str()
            .ok_or_else(|| ExtractionError::OcrInit("Invalid tessdata path".into()))?;

        let tess = tesseract::Tesseract::new(Some(tessdata_str), Some(&self.lang))
            .map_err(|e| ExtractionError::OcrInit(format!("{e:?}")))?;

        let mut tess = tess
            .set_image_from_mem(image_png)
            .map_err(|e| ExtractionError::OcrProcessing(format!("{e:?}")))?;

        tess.get_text()
            .map_err(|e| ExtractionError::OcrProcessing(format!("{e:?}")))
    }
}

/// Mock OCR engine for unit testing without Tesseract.
pub struct MockOcrEngine {
    response: Result<String, String>,
}

impl MockOcrEngine {
    pub fn new(text: &str) -> Self {
        Self {
            response: Ok(text.to_string()),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            response: Err(error.to_string()),
        }
    }
}

impl OcrEngine for MockOcrEngine {
    fn recognize_text(&self, _image_png: &[u8]) -> Result<String, ExtractionError> {
        match &self.response {
            Ok(text) => Ok(text.clone()),
            Err(e) => Err(ExtractionError::OcrProcessing(e.clone())),
        }
    }
}

/// Recover identity-card fields from raw OCR text.
///
/// Line-proximity heuristic: a line containing a label keyword is followed
/// by its value on the next non-empty line. Fields that cannot be recovered
/// keep the `"Not found"` sentinel.
///
/// - **Name** may span two lines when a transliterated name in parentheses
///   follows on the line after the Latin one.
/// - **Date of birth** is cleaned of common misreads (`_`, `LJ`, `Mw`) and
///   only accepted when at least 8 characters remain.
/// - **Sex** is normalized to `M` or `F`.
pub fn parse_identity_lines(text: &str) -> FieldMap {
    let mut name = String::new();
    let mut race = String::new();
    let mut dob = String::new();
    let mut sex = String::new();

    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    for (i, line) in lines.iter().enumerate() {
        let Some(next) = lines.get(i + 1) else {
            continue;
        };
        let next_upper = next.to_uppercase();

        if line.contains("Name") {
            if !["RACE", "DATE", "SEX"].iter().any(|k| next_upper.contains(k)) {
                let mut parts = vec![next.trim_matches([' ', '.']).to_string()];
                // Transliterated name in parentheses on the following line.
                if let Some(after) = lines.get(i + 2) {
                    if after.contains('(') && after.contains(')') {
                        parts.push(after.to_string());
                    }
                }
                name = parts.join(" ");
            }
        } else if line.contains("Race") {
            if !["NAME", "DATE", "SEX"].iter().any(|k| next_upper.contains(k)) {
                race = next.to_string();
            }
        } else if line.contains("Date of birth") || line.contains("DOB") {
            let cleaned = next.replace(['_'], "").replace("LJ", "").replace("Mw", "");
            let cleaned = cleaned.trim();
            if cleaned.len() >= 8 {
                dob = cleaned.to_string();
            }
        } else if line.contains("Sex") {
            if next_upper.contains('M') {
                sex = "M".to_string();
            } else if next_upper.contains('F') {
                sex = "F".to_string();
            }
        }
    }

    debug!(
        name_found = !name.is_empty(),
        race_found = !race.is_empty(),
        dob_found = !dob.is_empty(),
        sex_found = !sex.is_empty(),
        "Identity OCR heuristic complete"
    );

    let mut fields = FieldMap::new();
    for (label, value) in [
        ("Name", name),
        ("Race", race),
        ("Date of birth", dob),
        ("Sex", sex),
    ] {
        let value = if value.is_empty() {
            NOT_FOUND.to_string()
        } else {
            value
        };
        fields.insert(label.to_string(), value);
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_ocr_returns_configured_text() {
        let engine = MockOcrEngine::new("Name\nTAN AH KOW");
        assert_eq!(
            engine.recognize_text(b"fake_image_bytes").unwrap(),
            "Name\nTAN AH KOW"
        );
    }

    #[test]
    fn mock_ocr_failure_maps_to_processing_error() {
        let engine = MockOcrEngine::failing("no text layer");
        assert!(matches!(
            engine.recognize_text(b"fake"),
            Err(ExtractionError::OcrProcessing(_))
        ));
    }

    #[test]
    fn identity_heuristic_recovers_all_fields() {
        let text = "IDENTITY CARD\n\
                    Name\n\
                    TAN WEI MING\n\
                    Race\n\
                    CHINESE\n\
                    Date of birth\n\
                    27-11-1988\n\
                    Sex\n\
                    M";
        let fields = parse_identity_lines(text);
        assert_eq!(fields["Name"], "TAN WEI MING");
        assert_eq!(fields["Race"], "CHINESE");
        assert_eq!(fields["Date of birth"], "27-11-1988");
        assert_eq!(fields["Sex"], "M");
    }

    #[test]
    fn identity_name_joins_transliterated_line() {
        let text = "Name\nWONG MEI LIN\n(黄美玲)\nRace\nCHINESE";
        let fields = parse_identity_lines(text);
        assert_eq!(fields["Name"], "WONG MEI LIN (黄美玲)");
    }

    #[test]
    fn identity_dob_cleaned_of_misreads() {
        let text = "Date of birth\n_27-11-1988LJ";
        let fields = parse_identity_lines(text);
        assert_eq!(fields["Date of birth"], "27-11-1988");
    }

    #[test]
    fn identity_short_dob_rejected() {
        let text = "Date of birth\n27-11";
        let fields = parse_identity_lines(text);
        assert_eq!(fields["Date of birth"], NOT_FOUND);
    }

    #[test]
    fn identity_sex_normalized() {
        let fields = parse_identity_lines("Sex\nF");
        assert_eq!(fields["Sex"], "F");
        let fields = parse_identity_lines("Sex\nm (male)");
        assert_eq!(fields["Sex"], "M");
    }

    #[test]
    fn identity_label_followed_by_another_label_is_skipped() {
        // OCR dropped the value line; the next label must not be taken as one.
        let text = "Name\nRace\nCHINESE";
        let fields = parse_identity_lines(text);
        assert_eq!(fields["Name"], NOT_FOUND);
        assert_eq!(fields["Race"], "CHINESE");
    }

    #[test]
    fn identity_empty_input_is_all_sentinels() {
        let fields = parse_identity_lines("");
        assert_eq!(fields.len(), 4);
        assert!(fields.values().all(|v| v == NOT_FOUND));
    }
}
