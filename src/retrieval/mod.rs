mod index;
mod rerank;
#[cfg(test)]
mod tests;

use tracing::{debug, warn};

use crate::model::{Candidate, CandidateSet};

pub use index::{SqliteValueIndex, value_index_status};
use rerank::rerank_category_first;

/// Entries pulled from the index per call, before reranking.
pub const CANDIDATE_LIMIT: usize = 15;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetrievalError {
    #[error("semantic index unavailable: {reason}")]
    IndexUnavailable { reason: String },

    #[error("retrieval query must not be empty")]
    EmptyQuery,
}

/// Nearest-neighbour lookup over indexed field values.
pub trait SemanticIndex: Send + Sync {
    fn nearest(&self, text: &str, k: usize) -> Result<Vec<Candidate>, RetrievalError>;
}

/// Resolves a fuzzy term to canonical field values, categories first.
pub fn retrieve(index: &dyn SemanticIndex, query_text: &str) -> Result<CandidateSet, RetrievalError> {
    let query = query_text.trim();
    if query.is_empty() {
        return Err(RetrievalError::EmptyQuery);
    }

    let mut hits = index.nearest(query, CANDIDATE_LIMIT).inspect_err(|err| {
        warn!(query = %query, error = %err, "semantic index lookup failed");
    })?;
    hits.truncate(CANDIDATE_LIMIT);

    let candidates = rerank_category_first(hits);
    debug!(query = %query, candidates = candidates.len(), "retrieval complete");

    Ok(CandidateSet {
        query: query.to_string(),
        candidates,
    })
}
