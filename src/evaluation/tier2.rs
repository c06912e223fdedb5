use super::TierScore;
use super::fixture::EvaluationCase;
use super::observe::ToolCallRecord;

/// Whether retrieval was used when it should have been, and whether it searched for the
/// expected terms.
pub(crate) fn score_retrieval(case: &EvaluationCase, calls: &[ToolCallRecord]) -> TierScore {
    let retrievals = calls
        .iter()
        .filter_map(|call| match call {
            ToolCallRecord::Retrieve { query, error, .. } => Some((query.as_str(), error.as_deref())),
            ToolCallRecord::Query { .. } => None,
        })
        .collect::<Vec<(&str, Option<&str>)>>();

    let invoked = !retrievals.is_empty();
    let all_failed = invoked && retrievals.iter().all(|(_, error)| error.is_some());

    if case.need_vector && all_failed {
        let reason = retrievals
            .iter()
            .find_map(|(_, error)| *error)
            .unwrap_or("semantic index unavailable");
        let detail = format!("retrieval required but unavailable: {reason}");
        return TierScore::failed(2, &super::TIER2_COMPONENTS, &detail);
    }

    let (usage, usage_detail) = match (case.need_vector, invoked) {
        (true, true) => (1.0, "vector search called appropriately"),
        (false, false) => (1.0, "vector search not needed"),
        (true, false) => (0.0, "vector search should have been called"),
        (false, true) => (0.5, "vector search called but may not be necessary"),
    };

    let (relevance, relevance_detail) = score_relevance(&case.expected_search_terms, &retrievals);

    TierScore::from_components(
        2,
        vec![
            ("vector_search_usage", usage, usage_detail.to_string()),
            ("retrieval_relevance", relevance, relevance_detail),
        ],
    )
}

fn score_relevance(expected_terms: &[String], retrievals: &[(&str, Option<&str>)]) -> (f64, String) {
    if expected_terms.is_empty() {
        return (1.0, "no expected search terms defined".to_string());
    }
    if retrievals.is_empty() {
        return (
            0.0,
            "no vector search performed but expected terms required".to_string(),
        );
    }

    for (query, _) in retrievals {
        let lowered = query.to_lowercase();
        let matched = expected_terms
            .iter()
            .filter(|term| lowered.contains(&term.to_lowercase()))
            .map(String::as_str)
            .collect::<Vec<&str>>();
        if !matched.is_empty() {
            return (
                1.0,
                format!("found expected terms in query '{query}': {}", matched.join(", ")),
            );
        }
    }

    (
        0.0,
        format!(
            "missing expected terms in all queries: {}",
            expected_terms.join(", ")
        ),
    )
}
