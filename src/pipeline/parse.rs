//! Label-anchored field parsing for raw model output.
//!
//! Every extractor declares an ordered list of field labels; parsing turns
//! the model's free text into a [`FieldMap`] where every declared label is
//! present — defaulting to the `"Not found"` sentinel and overridden when a
//! `Label: value` line is found. Absence is always distinguishable from an
//! empty string.
//!
//! Two strategies coexist:
//! - [`ParseStrategy::Strict`] skips everything up to a known marker phrase
//!   in the prompt echo, then parses label-anchored lines after it. Used by
//!   extractors whose prompt makes the model echo its instructions.
//! - [`ParseStrategy::Scan`] matches `Label:` prefixes on every line.

use std::collections::BTreeMap;

use crate::session::FieldMap;

/// Sentinel for a declared field the extraction could not recover.
pub const NOT_FOUND: &str = "Not found";

/// How to locate field lines in raw model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    /// Parse only lines after the first line containing the marker phrase.
    /// Falls back to scanning the whole text when the marker is absent.
    Strict(&'static str),
    /// Scan every line for `Label:` prefixes, independent of position.
    Scan,
}

/// Explicit per-field fallback values, applied only to fields that are
/// still `"Not found"` after parsing.
///
/// Empty by default. This replaces the hard-coded literals the log-card
/// formatter used to carry for one specific test document — defaults are
/// deployment configuration, not extraction behavior.
#[derive(Debug, Clone, Default)]
pub struct FieldDefaults(BTreeMap<String, String>);

impl FieldDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: &str, value: &str) {
        self.0.insert(field.to_string(), value.to_string());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `Label=Value` lines. Blank lines and lines starting with `#`
    /// are ignored; lines without `=` are ignored.
    pub fn parse(text: &str) -> Self {
        let mut defaults = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((label, value)) = line.split_once('=') {
                let label = label.trim();
                let value = value.trim();
                if !label.is_empty() && !value.is_empty() {
                    defaults.set(label, value);
                }
            }
        }
        defaults
    }
}

/// Parse raw model output into a [`FieldMap`].
///
/// Every declared label is present in the result. A line of the form
/// `Label: value` overrides the sentinel; labels tolerate a trailing
/// period (`Vehicle No.` matches `Vehicle No`). The first occurrence of a
/// label wins; duplicates are ignored. An empty value keeps the sentinel.
pub fn parse_fields(
    raw: &str,
    labels: &[&str],
    strategy: ParseStrategy,
    defaults: &FieldDefaults,
) -> FieldMap {
    let mut fields: FieldMap = labels
        .iter()
        .map(|l| (l.to_string(), NOT_FOUND.to_string()))
        .collect();

    for line in candidate_lines(raw, strategy) {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().trim_end_matches('.');
        let value = value.trim();

        if value.is_empty() {
            continue;
        }
        let Some(entry) = fields.get_mut(key) else {
            continue;
        };
        // First occurrence wins.
        if entry == NOT_FOUND {
            *entry = value.to_string();
        }
    }

    for label in labels {
        if fields[*label] == NOT_FOUND {
            if let Some(value) = defaults.get(label) {
                fields.insert(label.to_string(), value.to_string());
            }
        }
    }

    fields
}

/// Lines eligible for label matching under the given strategy.
fn candidate_lines<'a>(raw: &'a str, strategy: ParseStrategy) -> Vec<&'a str> {
    match strategy {
        ParseStrategy::Scan => raw.lines().collect(),
        ParseStrategy::Strict(marker) => {
            let mut lines = raw.lines();
            let mut after: Vec<&str> = Vec::new();
            let mut found = false;
            for line in lines.by_ref() {
                if line.contains(marker) {
                    found = true;
                    break;
                }
            }
            if found {
                after.extend(lines);
                after
            } else {
                // Marker absent: the model skipped the echo. Scan everything
                // rather than declaring the output unparseable.
                raw.lines().collect()
            }
        }
    }
}

/// Render a field map as `Label: value` lines in declared-label order,
/// skipping sentinels. This is the text echoed back to the user.
pub fn render_fields(fields: &FieldMap, labels: &[&str]) -> String {
    labels
        .iter()
        .filter_map(|l| {
            fields
                .get(*l)
                .filter(|v| v.as_str() != NOT_FOUND)
                .map(|v| format!("{l}: {v}"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
