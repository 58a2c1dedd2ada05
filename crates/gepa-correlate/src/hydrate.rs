//! Dataset hydration - read-only enrichment of records from the dataset lookup

use gepa_core::{normalize_input, DatasetLookup, DatasetRow, DerivedAttributes};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How the dataset row was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    RowId,
    Input,
}

/// Dataset row matched to a record
///
/// Record accessors prefer observed values and only fall back to this row,
/// so hydration never overwrites what the spans reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hydration {
    pub row: DatasetRow,
    pub matched_by: MatchSource,
    /// More than one row shared the normalized input; the first was used
    pub ambiguous: bool,
}

/// Match a record's fields against the lookup.
pub fn hydrate(fields: &DerivedAttributes, lookup: &DatasetLookup) -> Option<Hydration> {
    if let Some(row_id) = fields.dataset_row_id.as_deref() {
        return lookup.by_id(row_id).map(|row| Hydration {
            row: row.clone(),
            matched_by: MatchSource::RowId,
            ambiguous: false,
        });
    }

    let normalized = normalize_input(fields.first_user_message()?);
    let candidates = lookup.by_input(&normalized);
    let row = candidates.first()?;
    let ambiguous = candidates.len() > 1;
    if ambiguous {
        debug!(
            "Ambiguous dataset match: {} rows share the input, using {}",
            candidates.len(),
            row.id
        );
    }

    Some(Hydration {
        row: row.clone(),
        matched_by: MatchSource::Input,
        ambiguous,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gepa_core::PromptMessage;

    fn lookup() -> DatasetLookup {
        DatasetLookup::from_rows(vec![
            DatasetRow {
                id: "r1".into(),
                input: "What is 2+2?".into(),
                expected: Some("4".into()),
                label: None,
            },
            DatasetRow {
                id: "r2".into(),
                input: "what is   2+2?".into(),
                expected: Some("four".into()),
                label: Some("dup".into()),
            },
            DatasetRow {
                id: "r3".into(),
                input: "Capital of France?".into(),
                expected: Some("Paris".into()),
                label: None,
            },
        ])
    }

    fn asking(text: &str) -> DerivedAttributes {
        DerivedAttributes {
            prompt_messages: vec![
                PromptMessage {
                    role: "system".into(),
                    content: "Be brief.".into(),
                },
                PromptMessage {
                    role: "user".into(),
                    content: text.into(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_direct_row_id() {
        let fields = DerivedAttributes {
            dataset_row_id: Some("r3".into()),
            ..asking("What is 2+2?")
        };
        let h = hydrate(&fields, &lookup()).unwrap();
        assert_eq!(h.row.id, "r3");
        assert_eq!(h.matched_by, MatchSource::RowId);
    }

    #[test]
    fn test_unknown_row_id_does_not_fall_back_to_input() {
        let fields = DerivedAttributes {
            dataset_row_id: Some("gone".into()),
            ..asking("Capital of France?")
        };
        assert!(hydrate(&fields, &lookup()).is_none());
    }

    #[test]
    fn test_input_match_is_normalized() {
        let h = hydrate(&asking("  capital OF france? "), &lookup()).unwrap();
        assert_eq!(h.row.id, "r3");
        assert_eq!(h.matched_by, MatchSource::Input);
        assert!(!h.ambiguous);
    }

    #[test]
    fn test_ambiguous_input_picks_first_and_flags() {
        let h = hydrate(&asking("WHAT IS 2+2?"), &lookup()).unwrap();
        assert_eq!(h.row.id, "r1");
        assert!(h.ambiguous);
    }

    #[test]
    fn test_no_user_message() {
        assert!(hydrate(&DerivedAttributes::default(), &lookup()).is_none());
    }
}
