mod engine;
mod extract;
mod fixture;
mod observe;
mod report;
mod tier1;
mod tier2;
mod tier3;
mod transcript;

use std::collections::BTreeMap;

use serde::Serialize;

pub use engine::{EngineConfig, EvaluationEngine};
pub use fixture::{FixtureEntry, load_fixture};
pub use report::{RunMetadata, RunReport, render_text_report};
pub use transcript::TranscriptReplay;

pub const TIER1_WEIGHT: f64 = 0.5;
pub const TIER2_WEIGHT: f64 = 0.25;
pub const TIER3_WEIGHT: f64 = 0.25;
pub const PASS_THRESHOLD: f64 = 0.8;
pub const AMOUNT_TOLERANCE: f64 = 0.01;

// Absorbs float noise from the weighted sum so an exact 0.8 is not read as 0.7999999.
const SCORE_EPSILON: f64 = 1e-9;

pub fn overall_score(tier1: f64, tier2: f64, tier3: f64) -> f64 {
    TIER1_WEIGHT * tier1 + TIER2_WEIGHT * tier2 + TIER3_WEIGHT * tier3
}

pub fn is_passing(overall: f64) -> bool {
    overall + SCORE_EPSILON >= PASS_THRESHOLD
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaseError {
    #[error("case exceeded its {budget_ms} ms budget after {elapsed_ms} ms")]
    TimedOut { elapsed_ms: u64, budget_ms: u64 },

    #[error("decision loop failed: {0}")]
    Decision(String),

    #[error("invalid fixture entry: {0}")]
    Fixture(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierScore {
    pub tier: u8,
    pub value: f64,
    pub components: BTreeMap<String, f64>,
    pub details: BTreeMap<String, String>,
}

impl TierScore {
    /// Tier value is the mean of its components; a tier with no components scores 0.
    pub fn from_components(tier: u8, components: Vec<(&str, f64, String)>) -> Self {
        let mut scores = BTreeMap::<String, f64>::new();
        let mut details = BTreeMap::<String, String>::new();
        for (name, value, detail) in components {
            scores.insert(name.to_string(), value.clamp(0.0, 1.0));
            details.insert(name.to_string(), detail);
        }

        let value = if scores.is_empty() {
            0.0
        } else {
            scores.values().sum::<f64>() / scores.len() as f64
        };

        Self {
            tier,
            value,
            components: scores,
            details,
        }
    }

    /// Lowest score for every named component, used when a case could not be executed.
    pub fn failed(tier: u8, component_names: &[&str], detail: &str) -> Self {
        Self::from_components(
            tier,
            component_names
                .iter()
                .map(|name| (*name, 0.0, detail.to_string()))
                .collect(),
        )
    }

    pub fn failing_components(&self) -> impl Iterator<Item = (&str, &str)> {
        self.components
            .iter()
            .filter(|(_, value)| **value < 1.0)
            .map(|(name, _)| {
                let detail = self.details.get(name).map(String::as_str).unwrap_or("");
                (name.as_str(), detail)
            })
    }
}

pub(crate) const TIER1_COMPONENTS: [&str; 3] = ["execution_accuracy", "validity", "security"];
pub(crate) const TIER2_COMPONENTS: [&str; 2] = ["vector_search_usage", "retrieval_relevance"];
pub(crate) const TIER3_COMPONENTS: [&str; 2] = ["faithfulness", "amount_accuracy"];
