mod checks;
mod lexer;
#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::{ClientScope, QueryRows};
use crate::store::{RelationalStore, StoreError};

use self::checks::{Finding, StatementScan, forbidden_verb_pattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    MissingScopeFilter,
    ForbiddenOperation,
    InjectionPatternDetected,
}

impl RejectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingScopeFilter => "missing_scope_filter",
            Self::ForbiddenOperation => "forbidden_operation",
            Self::InjectionPatternDetected => "injection_pattern_detected",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRequest {
    pub scope: ClientScope,
    pub text: String,
}

impl QueryRequest {
    pub fn new(scope: ClientScope, text: impl Into<String>) -> Self {
        Self {
            scope,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub detail: String,
}

/// Result of one gateway call. Rejections and execution failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum QueryVerdict {
    Authorized { rows: QueryRows },
    Rejected(Rejection),
    ExecutionFailed { error: StoreFailure },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreFailure {
    pub kind: &'static str,
    pub message: String,
}

impl From<StoreError> for StoreFailure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { reason } => Self {
                kind: "store_unavailable",
                message: reason,
            },
            StoreError::Statement { message } => Self {
                kind: "statement_error",
                message,
            },
        }
    }
}

impl QueryVerdict {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized { .. })
    }

    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            Self::Rejected(rejection) => Some(rejection.reason),
            _ => None,
        }
    }

    pub fn rows(&self) -> Option<&QueryRows> {
        match self {
            Self::Authorized { rows } => Some(rows),
            _ => None,
        }
    }

    /// Text handed back to the decision loop; rejections explain how to fix the query.
    pub fn render_for_tool(&self, scope: ClientScope) -> String {
        match self {
            Self::Authorized { rows } => rows.render_for_tool(),
            Self::Rejected(rejection) => format!(
                "Error: Security violation ({}): {}. Query must be a single SELECT filtered by clnt_id = {scope}",
                rejection.reason, rejection.detail
            ),
            Self::ExecutionFailed { error } => format!("Error: {}", error.message),
        }
    }
}

/// Authorizes query text against a bound client scope, then hands it to the store verbatim.
/// Holds no per-call state, so identical requests get identical verdicts.
pub struct QueryGateway {
    store: Arc<dyn RelationalStore>,
    verb_pattern: Regex,
}

impl QueryGateway {
    pub fn new(store: Arc<dyn RelationalStore>) -> Result<Self> {
        let verb_pattern =
            forbidden_verb_pattern().context("failed to compile forbidden verb regex")?;
        Ok(Self {
            store,
            verb_pattern,
        })
    }

    /// Checks the request without executing it.
    pub fn authorize(&self, request: &QueryRequest) -> Result<(), Rejection> {
        let scan = StatementScan::new(&request.text);
        match scan.first_finding(request.scope, &self.verb_pattern) {
            None => Ok(()),
            Some(Finding::MissingScope(detail)) => Err(Rejection {
                reason: RejectionReason::MissingScopeFilter,
                detail,
            }),
            Some(Finding::Forbidden(detail)) => Err(Rejection {
                reason: RejectionReason::ForbiddenOperation,
                detail,
            }),
            Some(Finding::Injection(detail)) => Err(Rejection {
                reason: RejectionReason::InjectionPatternDetected,
                detail,
            }),
        }
    }

    pub fn authorize_and_run(&self, request: &QueryRequest) -> QueryVerdict {
        if let Err(rejection) = self.authorize(request) {
            warn!(
                scope = request.scope.id(),
                reason = %rejection.reason,
                detail = %rejection.detail,
                "query rejected"
            );
            return QueryVerdict::Rejected(rejection);
        }

        match self.store.execute(&request.text) {
            Ok(rows) => {
                debug!(scope = request.scope.id(), rows = rows.len(), "query authorized");
                QueryVerdict::Authorized { rows }
            }
            Err(err) => {
                warn!(scope = request.scope.id(), error = %err, "authorized query failed");
                QueryVerdict::ExecutionFailed { error: err.into() }
            }
        }
    }
}
