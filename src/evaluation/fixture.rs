use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;

use crate::model::{ClientScope, Record};

/// One ground-truth case. Field aliases accept the harness's original key names.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EvaluationCase {
    #[serde(alias = "test_id")]
    pub id: String,
    pub question: String,
    #[serde(rename = "client_id", alias = "scope")]
    pub scope: ClientScope,
    #[serde(default, alias = "golden_sql")]
    pub golden_query: Option<String>,
    #[serde(default, alias = "golden_output")]
    pub golden_rows: Option<Vec<Record>>,
    #[serde(default)]
    pub expected_amount: Option<f64>,
    #[serde(default)]
    pub expected_spending: Option<f64>,
    #[serde(default)]
    pub expected_income: Option<f64>,
    #[serde(default)]
    pub need_vector: bool,
    #[serde(default)]
    pub expected_search_terms: Vec<String>,
    /// Adversarial case: only the gateway's refusal is scored.
    #[serde(default)]
    pub expect_rejection: bool,
    #[serde(default)]
    pub category: Option<String>,
}

impl EvaluationCase {
    pub fn expected_amounts(&self) -> Vec<(&'static str, f64)> {
        [
            ("amount", self.expected_amount),
            ("spending", self.expected_spending),
            ("income", self.expected_income),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.map(|value| (label, value)))
        .collect()
    }
}

/// A fixture record either parses into a case or is kept as an isolated failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FixtureEntry {
    Valid(EvaluationCase),
    Invalid {
        id: String,
        question: String,
        error: String,
    },
}

impl FixtureEntry {
    pub fn id(&self) -> &str {
        match self {
            Self::Valid(case) => &case.id,
            Self::Invalid { id, .. } => id,
        }
    }
}

pub fn load_fixture(path: &Path) -> Result<Vec<FixtureEntry>> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let document: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    parse_fixture(document)
}

pub(crate) fn parse_fixture(document: Value) -> Result<Vec<FixtureEntry>> {
    let records = match document {
        Value::Array(records) => records,
        Value::Object(mut object) => match object.remove("test_cases").or_else(|| object.remove("cases")) {
            Some(Value::Array(records)) => records,
            _ => bail!("fixture object must contain a 'test_cases' array"),
        },
        _ => bail!("fixture must be a JSON array of cases"),
    };

    let mut seen_ids = HashSet::<String>::new();
    let mut entries = Vec::<FixtureEntry>::with_capacity(records.len());

    for (position, record) in records.into_iter().enumerate() {
        let fallback_id = string_field(&record, &["test_id", "id"])
            .unwrap_or_else(|| format!("case-{}", position + 1));
        let question = string_field(&record, &["question"]).unwrap_or_default();

        let entry = match serde_json::from_value::<EvaluationCase>(record) {
            Ok(case) if !seen_ids.insert(case.id.clone()) => FixtureEntry::Invalid {
                id: case.id,
                question: case.question,
                error: "duplicate case id".to_string(),
            },
            Ok(case) => FixtureEntry::Valid(case),
            Err(err) => FixtureEntry::Invalid {
                id: fallback_id,
                question,
                error: err.to_string(),
            },
        };
        entries.push(entry);
    }

    Ok(entries)
}

fn string_field(record: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| record.get(*key).and_then(Value::as_str))
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::ScalarValue;

    #[test]
    fn parses_original_key_names() {
        let entries = parse_fixture(json!([
            {
                "test_id": "T01",
                "question": "How much did I spend in August 2023?",
                "client_id": 880,
                "golden_sql": "SELECT SUM(amt) AS total_spending FROM transactions WHERE clnt_id = 880 AND amt < 0",
                "golden_output": [{"total_spending": -638532.93}],
                "expected_spending": -638532.93,
                "need_vector": false,
                "expected_search_terms": []
            }
        ]))
        .expect("fixture");

        let FixtureEntry::Valid(case) = &entries[0] else {
            panic!("expected a valid case: {entries:?}");
        };
        assert_eq!(case.id, "T01");
        assert_eq!(case.scope, ClientScope::new(880));
        assert_eq!(
            case.golden_rows.as_ref().expect("rows")[0]["total_spending"],
            ScalarValue::Real(-638532.93)
        );
        assert_eq!(case.expected_amounts(), vec![("spending", -638532.93)]);
        assert!(!case.expect_rejection);
    }

    #[test]
    fn malformed_records_are_isolated() {
        let entries = parse_fixture(json!({
            "test_cases": [
                {"test_id": "ok", "question": "q", "client_id": 1},
                {"test_id": "bad", "question": "q2"},
                {"test_id": "ok", "question": "again", "client_id": 1}
            ]
        }))
        .expect("fixture");

        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[0], FixtureEntry::Valid(_)));
        assert!(matches!(&entries[1], FixtureEntry::Invalid { id, .. } if id == "bad"));
        assert!(
            matches!(&entries[2], FixtureEntry::Invalid { error, .. } if error == "duplicate case id")
        );
    }

    #[test]
    fn non_array_fixture_is_rejected() {
        assert!(parse_fixture(json!("nope")).is_err());
    }
}
