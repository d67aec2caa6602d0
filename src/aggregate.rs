//! Merging per-document extractions into one submission record.

use std::collections::BTreeMap;

use crate::pipeline::extract::STATUS_KEY;
use crate::pipeline::parse::NOT_FOUND;
use crate::session::{DocumentKind, FieldMap};

/// Merge precedence, lowest first: on label collision a later kind
/// overwrites an earlier one.
const MERGE_ORDER: [DocumentKind; 4] = [
    DocumentKind::IdCard,
    DocumentKind::License,
    DocumentKind::LogCard,
    DocumentKind::Referral,
];

/// Flatten per-document field maps into one record for submission.
///
/// Pure function of its input. Sentinel values and status entries are
/// dropped before merging, so a later document that failed to recover a
/// field never erases a value an earlier one did recover.
pub fn merge(documents: &BTreeMap<DocumentKind, FieldMap>) -> FieldMap {
    let mut record = FieldMap::new();
    for kind in MERGE_ORDER {
        let Some(fields) = documents.get(&kind) else {
            continue;
        };
        for (label, value) in fields {
            if label == STATUS_KEY || value == NOT_FOUND {
                continue;
            }
            record.insert(label.clone(), value.clone());
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn merge_flattens_all_documents() {
        let mut documents = BTreeMap::new();
        documents.insert(DocumentKind::IdCard, fields(&[("Name", "TAN"), ("Sex", "M")]));
        documents.insert(
            DocumentKind::LogCard,
            fields(&[("Vehicle No", "SJX1234K")]),
        );
        documents.insert(
            DocumentKind::Referral,
            fields(&[("Dealership", "Speed Motors")]),
        );

        let record = merge(&documents);
        assert_eq!(record["Name"], "TAN");
        assert_eq!(record["Vehicle No"], "SJX1234K");
        assert_eq!(record["Dealership"], "Speed Motors");
        assert_eq!(record.len(), 4);
    }

    #[test]
    fn later_document_wins_label_collisions() {
        let mut documents = BTreeMap::new();
        documents.insert(DocumentKind::IdCard, fields(&[("Name", "TAN WEI MING")]));
        documents.insert(
            DocumentKind::License,
            fields(&[("Name", "TAN W M"), ("License Number", "S1234567A")]),
        );

        let record = merge(&documents);
        assert_eq!(record["Name"], "TAN W M", "license overwrites identity");
        assert_eq!(record["License Number"], "S1234567A");
    }

    #[test]
    fn sentinel_never_erases_a_real_value() {
        let mut documents = BTreeMap::new();
        documents.insert(DocumentKind::IdCard, fields(&[("Name", "TAN WEI MING")]));
        documents.insert(DocumentKind::License, fields(&[("Name", NOT_FOUND)]));

        let record = merge(&documents);
        assert_eq!(record["Name"], "TAN WEI MING");
    }

    #[test]
    fn status_entries_and_sentinels_are_dropped() {
        let mut documents = BTreeMap::new();
        documents.insert(
            DocumentKind::License,
            fields(&[
                ("Name", NOT_FOUND),
                (STATUS_KEY, "Text generation failed"),
            ]),
        );

        let record = merge(&documents);
        assert!(record.is_empty());
    }

    #[test]
    fn merge_is_pure() {
        let mut documents = BTreeMap::new();
        documents.insert(DocumentKind::IdCard, fields(&[("Name", "TAN")]));
        let before = documents.clone();

        let first = merge(&documents);
        let second = merge(&documents);
        assert_eq!(first, second);
        assert_eq!(documents, before, "input must not be mutated");
    }
}
