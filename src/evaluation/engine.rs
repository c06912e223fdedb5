use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::model::Record;
use crate::store::RelationalStore;
use crate::tools::TransactionTools;
use crate::util::truncate_chars;

use super::extract::ResponseScanner;
use super::fixture::{EvaluationCase, FixtureEntry};
use super::observe::{CaseBudget, ObservedTools, ToolCallRecord};
use super::report::{CaseOutcome, CaseResult};
use super::transcript::DecisionLoop;
use super::{
    CaseError, TIER1_COMPONENTS, TIER2_COMPONENTS, TIER3_COMPONENTS, TierScore, is_passing,
    overall_score, tier1, tier2, tier3,
};

const ANSWER_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub workers: usize,
    /// Per-case wall-clock budget; `0` disables it.
    pub case_timeout_ms: u64,
}

/// Drives every fixture case through the decision loop and scores what it observed.
pub struct EvaluationEngine {
    tools: Arc<dyn TransactionTools>,
    store: Arc<dyn RelationalStore>,
    decision_loop: Arc<dyn DecisionLoop>,
    scanner: ResponseScanner,
    config: EngineConfig,
}

impl EvaluationEngine {
    pub fn new(
        tools: Arc<dyn TransactionTools>,
        store: Arc<dyn RelationalStore>,
        decision_loop: Arc<dyn DecisionLoop>,
        config: EngineConfig,
    ) -> Result<Self> {
        let scanner = ResponseScanner::new().context("failed to build response scanner")?;
        Ok(Self {
            tools,
            store,
            decision_loop,
            scanner,
            config,
        })
    }

    /// Results come back in fixture order regardless of which worker finished first.
    pub fn run(&self, entries: &[FixtureEntry]) -> Result<Vec<CaseResult>> {
        let workers = self.config.workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("txnscope-eval-{index}"))
            .build()
            .context("failed to build evaluation worker pool")?;

        info!(
            cases = entries.len(),
            workers,
            case_timeout_ms = self.config.case_timeout_ms,
            "evaluation started"
        );

        let results = pool.install(|| {
            entries
                .par_iter()
                .map(|entry| self.evaluate_entry(entry))
                .collect::<Vec<CaseResult>>()
        });

        Ok(results)
    }

    fn evaluate_entry(&self, entry: &FixtureEntry) -> CaseResult {
        let case = match entry {
            FixtureEntry::Valid(case) => case,
            FixtureEntry::Invalid {
                id,
                question,
                error,
            } => {
                warn!(case_id = %id, error = %error, "fixture entry is invalid; scoring as zero");
                let err = CaseError::Fixture(error.clone());
                return zeroed_result(id, question, None, "loaded", &err);
            }
        };

        let loaded = match LoadedCase::load(case, self.store.as_ref()) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(case_id = %case.id, error = %err, "failed to resolve golden rows");
                return zeroed_result(
                    &case.id,
                    &case.question,
                    Some(case.scope.id()),
                    "loaded",
                    &err,
                );
            }
        };

        loaded
            .execute(
                self.tools.as_ref(),
                self.store.as_ref(),
                self.decision_loop.as_ref(),
                &self.scanner,
                self.config.case_timeout_ms,
            )
            .score(&self.scanner)
            .report()
    }
}

/// Case with its ground truth resolved, ready to run.
struct LoadedCase<'c> {
    case: &'c EvaluationCase,
    golden_rows: Vec<Record>,
}

impl<'c> LoadedCase<'c> {
    fn load(case: &'c EvaluationCase, store: &dyn RelationalStore) -> Result<Self, CaseError> {
        let golden_rows = resolve_golden_rows(case, store)?;
        Ok(Self { case, golden_rows })
    }

    fn execute(
        self,
        tools: &dyn TransactionTools,
        store: &dyn RelationalStore,
        decision_loop: &dyn DecisionLoop,
        scanner: &ResponseScanner,
        case_timeout_ms: u64,
    ) -> ExecutedCase<'c> {
        let budget = CaseBudget::new(case_timeout_ms);
        let observed = ObservedTools::new(tools, store, self.case.scope, &budget);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            decision_loop.run(self.case, &observed)
        }))
        .unwrap_or_else(|payload| Err(CaseError::Decision(panic_message(payload.as_ref()))));

        let elapsed = budget.elapsed();
        let outcome = if observed.budget_exceeded() {
            Err(CaseError::TimedOut {
                elapsed_ms: elapsed.as_millis() as u64,
                budget_ms: budget.limit_ms(),
            })
        } else {
            outcome.map(|answer| scanner.strip_think(&answer))
        };

        ExecutedCase {
            case: self.case,
            golden_rows: self.golden_rows,
            calls: observed.into_calls(),
            outcome,
            latency_ms: elapsed.as_secs_f64() * 1000.0,
        }
    }
}

/// Fixture rows win; otherwise the trusted golden query runs directly against the store.
fn resolve_golden_rows(
    case: &EvaluationCase,
    store: &dyn RelationalStore,
) -> Result<Vec<Record>, CaseError> {
    if let Some(rows) = &case.golden_rows {
        return Ok(rows.clone());
    }

    if let Some(golden_query) = &case.golden_query {
        return store
            .execute(golden_query)
            .map(|rows| rows.records())
            .map_err(|err| CaseError::Fixture(format!("golden query failed: {err}")));
    }

    if case.expect_rejection {
        return Ok(Vec::new());
    }

    Err(CaseError::Fixture(format!(
        "case '{}' has neither golden rows nor a golden query",
        case.id
    )))
}

struct ExecutedCase<'c> {
    case: &'c EvaluationCase,
    golden_rows: Vec<Record>,
    calls: Vec<ToolCallRecord>,
    outcome: Result<String, CaseError>,
    latency_ms: f64,
}

impl<'c> ExecutedCase<'c> {
    fn score(self, scanner: &ResponseScanner) -> ScoredCase<'c> {
        let tier_scores = score_trace(
            scanner,
            self.case,
            &self.golden_rows,
            &self.calls,
            &self.outcome,
        );
        ScoredCase {
            executed: self,
            tier_scores,
        }
    }
}

struct ScoredCase<'c> {
    executed: ExecutedCase<'c>,
    tier_scores: Vec<TierScore>,
}

impl ScoredCase<'_> {
    fn report(self) -> CaseResult {
        let ScoredCase {
            executed,
            tier_scores,
        } = self;
        let case = executed.case;

        let overall = overall_for(&tier_scores);
        let passed = is_passing(overall);
        let generated_query = last_query_text(&executed.calls);

        let (answer_excerpt, outcome) = match &executed.outcome {
            Ok(answer) => (
                truncate_chars(answer, ANSWER_EXCERPT_CHARS),
                CaseOutcome::Completed,
            ),
            Err(err) => {
                warn!(case_id = %case.id, error = %err, "case errored during execution");
                (
                    String::new(),
                    CaseOutcome::Errored {
                        stage: "executed".to_string(),
                        error: err.to_string(),
                    },
                )
            }
        };

        info!(
            case_id = %case.id,
            passed,
            overall,
            latency_ms = executed.latency_ms,
            tool_calls = executed.calls.len(),
            generated_query = generated_query.as_deref().unwrap_or(""),
            "case evaluated"
        );

        CaseResult {
            case_id: case.id.clone(),
            question: case.question.clone(),
            client_id: Some(case.scope.id()),
            tier_scores,
            overall,
            passed,
            latency_ms: executed.latency_ms,
            tool_calls: executed.calls.len(),
            generated_query,
            answer_excerpt,
            outcome,
        }
    }
}

/// Scores a captured trace. Pure: the same trace always yields the same tiers.
pub(crate) fn score_trace(
    scanner: &ResponseScanner,
    case: &EvaluationCase,
    golden_rows: &[Record],
    calls: &[ToolCallRecord],
    outcome: &Result<String, CaseError>,
) -> Vec<TierScore> {
    match outcome {
        Ok(answer) => vec![
            tier1::score_functional(case, golden_rows, calls),
            tier2::score_retrieval(case, calls),
            tier3::score_response(scanner, case, golden_rows, answer),
        ],
        Err(err) => failed_tiers(&err.to_string()),
    }
}

fn failed_tiers(detail: &str) -> Vec<TierScore> {
    vec![
        TierScore::failed(1, &TIER1_COMPONENTS, detail),
        TierScore::failed(2, &TIER2_COMPONENTS, detail),
        TierScore::failed(3, &TIER3_COMPONENTS, detail),
    ]
}

fn overall_for(tier_scores: &[TierScore]) -> f64 {
    let tier = |number: u8| {
        tier_scores
            .iter()
            .find(|score| score.tier == number)
            .map(|score| score.value)
            .unwrap_or(0.0)
    };
    overall_score(tier(1), tier(2), tier(3))
}

fn last_query_text(calls: &[ToolCallRecord]) -> Option<String> {
    calls.iter().rev().find_map(|call| match call {
        ToolCallRecord::Query { text, .. } => Some(text.clone()),
        ToolCallRecord::Retrieve { .. } => None,
    })
}

fn zeroed_result(
    case_id: &str,
    question: &str,
    client_id: Option<i64>,
    stage: &str,
    err: &CaseError,
) -> CaseResult {
    let tier_scores = failed_tiers(&err.to_string());
    let overall = overall_for(&tier_scores);
    CaseResult {
        case_id: case_id.to_string(),
        question: question.to_string(),
        client_id,
        tier_scores,
        overall,
        passed: is_passing(overall),
        latency_ms: 0.0,
        tool_calls: 0,
        generated_query: None,
        answer_excerpt: String::new(),
        outcome: CaseOutcome::Errored {
            stage: stage.to_string(),
            error: err.to_string(),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("decision loop panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("decision loop panicked: {message}")
    } else {
        "decision loop panicked".to_string()
    }
}
