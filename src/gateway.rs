//! CRM board submission.
//!
//! A completed intake becomes one item on the configured board via a
//! GraphQL `create_item` mutation. Submission is best-effort: a failure is
//! logged and reported to the caller but never blocks the conversation
//! from finishing.

use std::sync::Mutex;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::BoardSettings;
use crate::session::FieldMap;

/// Labels whose values are date columns on the board, submitted as
/// normalized `YYYY-MM-DD` values.
const DATE_FIELDS: &[&str] = &[
    "Date of birth",
    "Issue Date",
    "Original Registration Date",
    "Lifespan Expiry Date",
    "COE Expiry Date",
    "Road Tax Expiry Date",
    "PARF Eligibility Expiry Date",
    "Inspection Due Date",
    "Intended Transfer Date",
];

const CREATE_ITEM_MUTATION: &str = "\
mutation ($boardId: ID!, $itemName: String!, $columnValues: JSON!) {
    create_item (
        board_id: $boardId,
        item_name: $itemName,
        column_values: $columnValues
    ) {
        id
    }
}";

/// Final delivery seam: hand a merged record to the CRM.
pub trait SubmissionGateway: Send + Sync {
    /// Submit one record. Returns whether the board accepted it.
    fn submit(&self, record: &FieldMap) -> bool;
}

/// Normalize a card date into `YYYY-MM-DD`. Accepts `27 Nov 2003`,
/// `27/11/2003`, and already-normalized values; anything else (including
/// the `"0"` placeholder some cards carry) yields `None`.
pub fn normalize_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "0" {
        return None;
    }
    for format in ["%d %b %Y", "%d/%m/%Y", "%Y-%m-%d"] {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    warn!(%raw, "Could not parse date value");
    None
}

/// Board item name: `<Name> - <Vehicle No>`, with `New Policy` standing in
/// for a missing vehicle number.
pub fn item_name(record: &FieldMap) -> String {
    let name = record.get("Name").map(String::as_str).unwrap_or("");
    let vehicle = record
        .get("Vehicle No")
        .map(String::as_str)
        .unwrap_or("New Policy");
    format!("{name} - {vehicle}").trim().to_string()
}

/// Map record labels onto board column ids.
///
/// Labels without a configured column are skipped. `Make/Model` is split
/// on `/` into the `Vehicle Make` and `Vehicle Model` columns. Date labels
/// become `{"date": ...}` values (empty when unparseable), everything else
/// `{"text": ...}`.
pub fn build_column_values(
    record: &FieldMap,
    columns: &std::collections::BTreeMap<String, String>,
) -> Map<String, Value> {
    let mut values = Map::new();
    for (label, value) in record {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        if label == "Make/Model" {
            let mut parts = value.splitn(2, '/');
            if let (Some(make), Some(column)) = (parts.next(), columns.get("Vehicle Make")) {
                values.insert(column.clone(), json!({ "text": make.trim() }));
            }
            if let (Some(model), Some(column)) = (parts.next(), columns.get("Vehicle Model")) {
                values.insert(column.clone(), json!({ "text": model.trim() }));
            }
            continue;
        }

        let Some(column) = columns.get(label) else {
            continue;
        };
        let entry = if DATE_FIELDS.contains(&label.as_str()) {
            json!({ "date": normalize_date(value).unwrap_or_default() })
        } else {
            json!({ "text": value })
        };
        values.insert(column.clone(), entry);
    }
    values
}

/// Production gateway speaking the board's GraphQL API.
pub struct BoardGateway {
    settings: BoardSettings,
    client: reqwest::blocking::Client,
}

impl BoardGateway {
    pub fn new(settings: BoardSettings) -> Self {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { settings, client }
    }
}

impl SubmissionGateway for BoardGateway {
    fn submit(&self, record: &FieldMap) -> bool {
        let column_values = build_column_values(record, &self.settings.columns);
        debug!(columns = column_values.len(), "Prepared board submission");

        // The API expects column_values as a JSON-encoded string variable.
        let serialized = match serde_json::to_string(&column_values) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to serialize column values");
                return false;
            }
        };

        let body = json!({
            "query": CREATE_ITEM_MUTATION,
            "variables": {
                "boardId": self.settings.board_id,
                "itemName": item_name(record),
                "columnValues": serialized,
            }
        });

        let response = self
            .client
            .post(&self.settings.api_url)
            .bearer_auth(&self.settings.api_key)
            .header("API-Version", "2024-01")
            .json(&body)
            .send();

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "Board request failed");
                return false;
            }
        };
        if !response.status().is_success() {
            error!(status = %response.status(), "Board returned an error status");
            return false;
        }

        let payload: Value = match response.json() {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "Board response was not JSON");
                return false;
            }
        };
        if let Some(errors) = payload.get("errors") {
            error!(%errors, "Board rejected the mutation");
            return false;
        }
        match payload.pointer("/data/create_item/id") {
            Some(id) => {
                info!(item_id = %id, "Board item created");
                true
            }
            None => {
                error!(%payload, "Unexpected board response shape");
                false
            }
        }
    }
}

/// Recording gateway for tests: captures submitted records and returns a
/// scripted outcome.
pub struct MockGateway {
    accept: bool,
    records: Mutex<Vec<FieldMap>>,
}

impl MockGateway {
    pub fn new(accept: bool) -> Self {
        Self {
            accept,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn submissions(&self) -> Vec<FieldMap> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl SubmissionGateway for MockGateway {
    fn submit(&self, record: &FieldMap) -> bool {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record.clone());
        self.accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn columns(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn dates_normalize_to_iso() {
        assert_eq!(normalize_date("27 Nov 2003").as_deref(), Some("2003-11-27"));
        assert_eq!(normalize_date("27/11/2003").as_deref(), Some("2003-11-27"));
        assert_eq!(normalize_date("2003-11-27").as_deref(), Some("2003-11-27"));
        assert_eq!(normalize_date("0"), None);
        assert_eq!(normalize_date(""), None);
        assert_eq!(normalize_date("next tuesday"), None);
    }

    #[test]
    fn item_name_combines_name_and_vehicle() {
        assert_eq!(
            item_name(&record(&[("Name", "TAN"), ("Vehicle No", "SJX1234K")])),
            "TAN - SJX1234K"
        );
        assert_eq!(item_name(&record(&[("Name", "TAN")])), "TAN - New Policy");
        assert_eq!(item_name(&record(&[("Vehicle No", "SJX1234K")])), "- SJX1234K");
    }

    #[test]
    fn column_values_map_text_and_date_fields() {
        let record = record(&[
            ("Name", "TAN"),
            ("Date of birth", "27 Nov 2003"),
            ("Unmapped Label", "ignored"),
        ]);
        let cols = columns(&[("Name", "text9"), ("Date of birth", "date4")]);
        let values = build_column_values(&record, &cols);
        assert_eq!(values["text9"], json!({ "text": "TAN" }));
        assert_eq!(values["date4"], json!({ "date": "2003-11-27" }));
        assert_eq!(values.len(), 2, "unmapped labels are skipped");
    }

    #[test]
    fn unparseable_date_submits_empty_date() {
        let record = record(&[("Issue Date", "garbled")]);
        let cols = columns(&[("Issue Date", "date988")]);
        let values = build_column_values(&record, &cols);
        assert_eq!(values["date988"], json!({ "date": "" }));
    }

    #[test]
    fn make_model_splits_into_two_columns() {
        let record = record(&[("Make/Model", "ALFA ROMEO / GIULIA")]);
        let cols = columns(&[("Vehicle Make", "text2"), ("Vehicle Model", "text6")]);
        let values = build_column_values(&record, &cols);
        assert_eq!(values["text2"], json!({ "text": "ALFA ROMEO" }));
        assert_eq!(values["text6"], json!({ "text": "GIULIA" }));
    }

    #[test]
    fn make_without_model_fills_make_only() {
        let record = record(&[("Make/Model", "TOYOTA")]);
        let cols = columns(&[("Vehicle Make", "text2"), ("Vehicle Model", "text6")]);
        let values = build_column_values(&record, &cols);
        assert_eq!(values["text2"], json!({ "text": "TOYOTA" }));
        assert!(!values.contains_key("text6"));
    }

    #[test]
    fn mock_gateway_records_submissions() {
        let gateway = MockGateway::new(false);
        assert!(!gateway.submit(&record(&[("Name", "TAN")])));
        let seen = gateway.submissions();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["Name"], "TAN");
    }
}
