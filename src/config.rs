//! Deployment configuration.
//!
//! Everything tunable lives here: prompt templates, board credentials and
//! column mapping, storage directories, and conversation timing. Values are
//! read from environment variables once at startup into a [`Settings`]
//! value that the rest of the crate receives by reference.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::pipeline::parse::FieldDefaults;
use crate::pipeline::prompts::LICENSE_PROMPT;

/// Application-level constants
pub const APP_NAME: &str = "GoBingo";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Photo download attempts before giving up on a stage.
pub const FETCH_RETRIES: u32 = 3;
/// Fixed delay between photo download attempts.
pub const FETCH_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Wall-clock budget for the identity extraction step.
pub const IDENTITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required prompt template is absent. Prompts are tuned per
    /// deployment; starting without one would silently extract nothing.
    #[error("Required prompt template {0} is not configured")]
    MissingPrompt(&'static str),

    #[error("Required environment variable {0} is not set")]
    MissingVar(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Get the application data directory, `~/GoBingo/` unless overridden by
/// `INTAKE_DATA_DIR`.
pub fn app_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("INTAKE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join(APP_NAME)
}

/// CRM board endpoint, credentials, and the field-label → column-id map.
#[derive(Debug, Clone)]
pub struct BoardSettings {
    pub api_url: String,
    pub api_key: String,
    pub board_id: String,
    /// Field label → board column id. Fields without a mapping are not
    /// submitted as columns.
    pub columns: BTreeMap<String, String>,
}

/// Resolved deployment configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub id_card_prompt: String,
    pub license_prompt: String,
    pub log_card_prompt: String,
    /// Per-deployment fallbacks for log-card fields the model misses.
    pub log_card_defaults: FieldDefaults,
    pub board: BoardSettings,
    /// Holding area for downloads not yet extracted.
    pub temp_dir: PathBuf,
    /// Long-term archive, one subdirectory per document kind.
    pub archive_dir: PathBuf,
    pub identity_timeout: Duration,
    pub fetch_retries: u32,
    pub fetch_retry_delay: Duration,
}

impl Settings {
    /// Read configuration from the environment.
    ///
    /// `ID_CARD_PROMPT` and `LOG_CARD_PROMPT` are required — these two are
    /// tuned per deployment. The license prompt is stable and only
    /// overridable. Board credentials (`BOARD_API_KEY`, `BOARD_ID`) are
    /// required; everything else has defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let id_card_prompt = require_prompt("ID_CARD_PROMPT")?;
        let log_card_prompt = require_prompt("LOG_CARD_PROMPT")?;
        let license_prompt =
            std::env::var("LICENSE_PROMPT").unwrap_or_else(|_| LICENSE_PROMPT.to_string());

        let log_card_defaults = match std::env::var("LOG_CARD_DEFAULTS") {
            Ok(text) => FieldDefaults::parse(&text),
            Err(_) => FieldDefaults::new(),
        };

        let board = BoardSettings {
            api_url: std::env::var("BOARD_API_URL")
                .unwrap_or_else(|_| "https://api.monday.com/v2".to_string()),
            api_key: std::env::var("BOARD_API_KEY")
                .map_err(|_| ConfigError::MissingVar("BOARD_API_KEY"))?,
            board_id: std::env::var("BOARD_ID")
                .map_err(|_| ConfigError::MissingVar("BOARD_ID"))?,
            columns: match std::env::var("BOARD_COLUMN_MAP") {
                Ok(text) => parse_column_map(&text),
                Err(_) => {
                    warn!("BOARD_COLUMN_MAP not set; submissions will carry the name column only");
                    BTreeMap::new()
                }
            },
        };

        let data_dir = app_data_dir();
        let identity_timeout = match std::env::var("IDENTITY_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(raw.parse().map_err(|e| ConfigError::Invalid {
                name: "IDENTITY_TIMEOUT_SECS",
                reason: format!("{e}"),
            })?),
            Err(_) => IDENTITY_TIMEOUT,
        };

        Ok(Self {
            id_card_prompt,
            license_prompt,
            log_card_prompt,
            log_card_defaults,
            board,
            temp_dir: data_dir.join("temp_documents"),
            archive_dir: data_dir.join("image_documents"),
            identity_timeout,
            fetch_retries: FETCH_RETRIES,
            fetch_retry_delay: FETCH_RETRY_DELAY,
        })
    }
}

fn require_prompt(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingPrompt(name)),
    }
}

/// Parse `Label=column_id` lines; blanks and `#` comments are ignored.
fn parse_column_map(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((label, column)) = line.split_once('=') {
            let (label, column) = (label.trim(), column.trim());
            if !label.is_empty() && !column.is_empty() {
                map.insert(label.to_string(), column.to_string());
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_map_parses_labels_and_ids() {
        let map = parse_column_map(
            "# board columns\n\
             Name=text_1\n\
             Date of birth=date4\n\
             malformed line\n",
        );
        assert_eq!(map.get("Name"), Some(&"text_1".to_string()));
        assert_eq!(map.get("Date of birth"), Some(&"date4".to_string()));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn fetch_constants_match_conversation_pacing() {
        assert_eq!(FETCH_RETRIES, 3);
        assert_eq!(FETCH_RETRY_DELAY, Duration::from_secs(2));
        assert_eq!(IDENTITY_TIMEOUT, Duration::from_secs(300));
    }
}
