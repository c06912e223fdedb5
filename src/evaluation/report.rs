use serde::Serialize;

use super::TierScore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaseOutcome {
    Completed,
    Errored { stage: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseResult {
    pub case_id: String,
    pub question: String,
    pub client_id: Option<i64>,
    pub tier_scores: Vec<TierScore>,
    pub overall: f64,
    pub passed: bool,
    pub latency_ms: f64,
    pub tool_calls: usize,
    pub generated_query: Option<String>,
    pub answer_excerpt: String,
    pub outcome: CaseOutcome,
}

impl CaseResult {
    pub fn tier_value(&self, tier: u8) -> f64 {
        self.tier_scores
            .iter()
            .find(|score| score.tier == tier)
            .map(|score| score.value)
            .unwrap_or(0.0)
    }

    pub fn is_errored(&self) -> bool {
        matches!(self.outcome, CaseOutcome::Errored { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total_cases: usize,
    pub passed_cases: usize,
    pub failed_cases: usize,
    pub errored_cases: usize,
    pub pass_rate: f64,
    pub mean_overall: f64,
    pub mean_tier1: f64,
    pub mean_tier2: f64,
    pub mean_tier3: f64,
    pub mean_latency_ms: f64,
}

impl RunSummary {
    pub fn from_results(results: &[CaseResult]) -> Self {
        let total_cases = results.len();
        let passed_cases = results.iter().filter(|result| result.passed).count();
        Self {
            total_cases,
            passed_cases,
            failed_cases: total_cases - passed_cases,
            errored_cases: results.iter().filter(|result| result.is_errored()).count(),
            pass_rate: if total_cases == 0 {
                0.0
            } else {
                passed_cases as f64 / total_cases as f64
            },
            mean_overall: mean(results, |result| result.overall),
            mean_tier1: mean(results, |result| result.tier_value(1)),
            mean_tier2: mean(results, |result| result.tier_value(2)),
            mean_tier3: mean(results, |result| result.tier_value(3)),
            mean_latency_ms: mean(results, |result| result.latency_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub model_label: String,
    pub started_at: String,
    pub completed_at: String,
    pub workers: usize,
    pub case_timeout_ms: u64,
    pub fixture_path: String,
    pub transcripts_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub metadata: RunMetadata,
    pub summary: RunSummary,
    pub cases: Vec<CaseResult>,
}

impl RunReport {
    pub fn new(metadata: RunMetadata, cases: Vec<CaseResult>) -> Self {
        Self {
            summary: RunSummary::from_results(&cases),
            metadata,
            cases,
        }
    }
}

fn mean(results: &[CaseResult], value: impl Fn(&CaseResult) -> f64) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(value).sum::<f64>() / results.len() as f64
}

fn percent(value: f64) -> String {
    format!("{:.1}%", value * 100.0)
}

pub fn render_text_report(report: &RunReport) -> String {
    let mut lines = Vec::<String>::new();
    let header = format!("EVALUATION REPORT - Model: {}", report.metadata.model_label);
    lines.push(header.clone());
    lines.push("=".repeat(header.chars().count()));

    let summary = &report.summary;
    lines.push(String::new());
    lines.push("Summary:".to_string());
    lines.push(format!(
        "  Tests Passed: {}/{} ({})",
        summary.passed_cases,
        summary.total_cases,
        percent(summary.pass_rate)
    ));
    if summary.errored_cases > 0 {
        lines.push(format!("  Errored Cases: {}", summary.errored_cases));
    }
    lines.push(format!("  Average Overall Score: {}", percent(summary.mean_overall)));
    lines.push(format!(
        "  Average Latency: {:.2}s",
        summary.mean_latency_ms / 1000.0
    ));
    lines.push(format!("  Average Tier 1 (Functional): {}", percent(summary.mean_tier1)));
    lines.push(format!("  Average Tier 2 (Retrieval): {}", percent(summary.mean_tier2)));
    lines.push(format!("  Average Tier 3 (Response): {}", percent(summary.mean_tier3)));

    lines.push(String::new());
    lines.push("Individual Test Results:".to_string());

    for result in &report.cases {
        let status = if result.passed { "PASS" } else { "FAIL" };
        lines.push(String::new());
        lines.push(format!("{}: {}", result.case_id, result.question));
        lines.push(format!(
            "  Status: {status} (Latency: {:.2}s)",
            result.latency_ms / 1000.0
        ));
        lines.push(format!(
            "  Overall: {} | T1: {} | T2: {} | T3: {}",
            percent(result.overall),
            percent(result.tier_value(1)),
            percent(result.tier_value(2)),
            percent(result.tier_value(3))
        ));

        if result.passed {
            continue;
        }

        lines.push("  Issues:".to_string());
        if let CaseOutcome::Errored { stage, error } = &result.outcome {
            lines.push(format!("    - {stage}: {error}"));
        }
        for tier in &result.tier_scores {
            for (name, detail) in tier.failing_components() {
                lines.push(format!("    - {name}: {detail}"));
            }
        }
    }

    lines.join("\n")
}
