use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::gateway::{QueryVerdict, StoreFailure};
use crate::model::{CandidateSet, ClientScope};
use crate::retrieval::RetrievalError;
use crate::store::RelationalStore;
use crate::tools::TransactionTools;

/// Cooperative wall-clock budget for one case, checked before every tool call.
#[derive(Debug, Clone)]
pub(crate) struct CaseBudget {
    started: Instant,
    limit: Option<Duration>,
}

impl CaseBudget {
    /// `0` disables the limit.
    pub(crate) fn new(limit_ms: u64) -> Self {
        Self {
            started: Instant::now(),
            limit: (limit_ms > 0).then(|| Duration::from_millis(limit_ms)),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn limit_ms(&self) -> u64 {
        self.limit.map(|limit| limit.as_millis() as u64).unwrap_or(0)
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.elapsed() > limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub(crate) enum ToolCallRecord {
    Retrieve {
        query: String,
        candidates: Option<usize>,
        error: Option<String>,
    },
    Query {
        text: String,
        verdict: QueryVerdict,
        /// Whether the store could at least prepare the statement.
        syntax_ok: bool,
    },
}

/// Wraps the live tools for one case: binds the case scope, records every call with its
/// outcome and refuses further calls once the budget is spent.
pub(crate) struct ObservedTools<'a> {
    inner: &'a dyn TransactionTools,
    store: &'a dyn RelationalStore,
    scope: ClientScope,
    budget: &'a CaseBudget,
    calls: Mutex<Vec<ToolCallRecord>>,
    budget_exceeded: AtomicBool,
}

impl<'a> ObservedTools<'a> {
    pub(crate) fn new(
        inner: &'a dyn TransactionTools,
        store: &'a dyn RelationalStore,
        scope: ClientScope,
        budget: &'a CaseBudget,
    ) -> Self {
        Self {
            inner,
            store,
            scope,
            budget,
            calls: Mutex::new(Vec::new()),
            budget_exceeded: AtomicBool::new(false),
        }
    }

    pub(crate) fn budget_exceeded(&self) -> bool {
        self.budget_exceeded.load(Ordering::Relaxed) || self.budget.is_exhausted()
    }

    pub(crate) fn into_calls(self) -> Vec<ToolCallRecord> {
        self.calls
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: ToolCallRecord) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn check_budget(&self) -> bool {
        if self.budget.is_exhausted() {
            self.budget_exceeded.store(true, Ordering::Relaxed);
            return false;
        }
        true
    }
}

impl TransactionTools for ObservedTools<'_> {
    fn retrieve(&self, query_text: &str) -> Result<CandidateSet, RetrievalError> {
        if !self.check_budget() {
            return Err(RetrievalError::IndexUnavailable {
                reason: "case time budget exhausted".to_string(),
            });
        }

        let outcome = self.inner.retrieve(query_text);
        self.record(ToolCallRecord::Retrieve {
            query: query_text.to_string(),
            candidates: outcome.as_ref().ok().map(CandidateSet::len),
            error: outcome.as_ref().err().map(ToString::to_string),
        });
        outcome
    }

    fn authorize_and_run(&self, scope: ClientScope, query_text: &str) -> QueryVerdict {
        if !self.check_budget() {
            return QueryVerdict::ExecutionFailed {
                error: StoreFailure {
                    kind: "case_timeout",
                    message: "case time budget exhausted".to_string(),
                },
            };
        }

        if scope != self.scope {
            warn!(
                requested = scope.id(),
                bound = self.scope.id(),
                "decision loop asked for another scope; using the case scope"
            );
        }

        let verdict = self.inner.authorize_and_run(self.scope, query_text);
        let syntax_ok = match &verdict {
            QueryVerdict::Authorized { .. } => true,
            QueryVerdict::Rejected(_) => self.store.check_syntax(query_text).is_ok(),
            QueryVerdict::ExecutionFailed { .. } => false,
        };
        debug!(scope = self.scope.id(), authorized = verdict.is_authorized(), "query observed");

        self.record(ToolCallRecord::Query {
            text: query_text.to_string(),
            verdict: verdict.clone(),
            syntax_ok,
        });
        verdict
    }
}
