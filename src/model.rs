use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Client identifier every relational read is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientScope(i64);

impl ClientScope {
    pub fn new(client_id: i64) -> Self {
        Self(client_id)
    }

    pub fn id(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ClientScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source column of an indexed value. Declaration order is the tie-break order used by
/// the semantic index when two entries share a distance and a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Category,
    Merchant,
    Description,
}

impl FieldKind {
    pub const ALL: [FieldKind; 3] = [Self::Category, Self::Merchant, Self::Description];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Merchant => "merchant",
            Self::Description => "description",
        }
    }

    /// Column of the `transactions` table the values are drawn from.
    pub fn column(self) -> &'static str {
        match self {
            Self::Category => "cat",
            Self::Merchant => "merchant",
            Self::Description => "desc",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "category" | "cat" => Ok(Self::Category),
            "merchant" => Ok(Self::Merchant),
            "description" | "desc" => Ok(Self::Description),
            other => bail!("unknown field kind '{other}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub value: String,
    pub field_kind: FieldKind,
    pub distance: f64,
}

/// Ranked output of one retrieval call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSet {
    pub query: String,
    pub candidates: Vec<Candidate>,
}

impl CandidateSet {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    /// Line-per-candidate listing handed back to the decision loop.
    pub fn render_for_tool(&self) -> String {
        self.candidates
            .iter()
            .map(|candidate| format!("- {}: '{}'", candidate.field_kind, candidate.value))
            .collect::<Vec<String>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ScalarValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Real(value) if value.fract() == 0.0 => Some(*value as i64),
            Self::Text(value) => value.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn is_null_or_zero(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Integer(value) => *value == 0,
            Self::Real(value) => *value == 0.0,
            Self::Text(_) => false,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "'{value}'"),
        }
    }
}

/// One result row keyed by column name.
pub type Record = BTreeMap<String, ScalarValue>;

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ScalarValue>>,
}

impl QueryRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn records(&self) -> Vec<Record> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<Record>()
            })
            .collect()
    }

    pub fn render_for_tool(&self) -> String {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let values = row.iter().map(ToString::to_string).collect::<Vec<String>>();
                format!("({})", values.join(", "))
            })
            .collect::<Vec<String>>();
        format!("[{}]", rows.join(", "))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub csv_path: String,
    pub csv_sha256: String,
    pub db_path: String,
    pub rows_read: usize,
    pub rows_inserted: usize,
    pub rows_skipped: usize,
    pub client_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub started_at: String,
    pub completed_at: String,
    pub db_path: String,
    pub model_id: String,
    pub refresh_mode: String,
    pub eligible_values: usize,
    pub updated_values: usize,
    pub stale_values_before: usize,
    pub values_by_kind: BTreeMap<String, usize>,
    pub duration_ms: f64,
}
