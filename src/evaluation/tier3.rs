use std::collections::BTreeSet;

use crate::model::{Record, ScalarValue};

use super::extract::{ResponseScanner, sequential_run};
use super::fixture::EvaluationCase;
use super::{AMOUNT_TOLERANCE, TierScore};

/// Faithfulness to the golden rows and accuracy of the amounts quoted in the answer.
pub(crate) fn score_response(
    scanner: &ResponseScanner,
    case: &EvaluationCase,
    golden_rows: &[Record],
    answer: &str,
) -> TierScore {
    let (faithfulness, faithfulness_detail) = score_faithfulness(scanner, golden_rows, answer);
    let (accuracy, accuracy_detail) = score_amounts(scanner, case, golden_rows, answer);

    TierScore::from_components(
        3,
        vec![
            ("faithfulness", faithfulness, faithfulness_detail),
            ("amount_accuracy", accuracy, accuracy_detail),
        ],
    )
}

fn score_faithfulness(scanner: &ResponseScanner, golden_rows: &[Record], answer: &str) -> (f64, String) {
    let mut issues = Vec::<String>::new();

    for placeholder in scanner.placeholders(answer) {
        issues.push(format!("contains placeholder {placeholder}"));
    }

    let mentioned = scanner.transaction_ids(answer);
    let golden_ids = golden_transaction_ids(golden_rows);

    if let Some(run) = sequential_run(&mentioned) {
        let all_known = golden_ids
            .as_ref()
            .is_some_and(|ids| run.iter().all(|id| ids.contains(id)));
        if !all_known {
            issues.push(format!(
                "sequential fabricated ids {}, {}, {}",
                run[0], run[1], run[2]
            ));
        }
    }

    if let Some(golden_ids) = &golden_ids {
        let hallucinated = mentioned
            .iter()
            .filter(|id| !golden_ids.contains(id))
            .map(ToString::to_string)
            .collect::<Vec<String>>();
        if !hallucinated.is_empty() {
            issues.push(format!(
                "transaction ids not in the data: {}",
                hallucinated.join(", ")
            ));
        }
    }

    if issues.is_empty() {
        (1.0, "answer is faithful to the data".to_string())
    } else {
        (0.0, issues.join("; "))
    }
}

// None when the golden rows carry no `txn_id` column to check against.
fn golden_transaction_ids(golden_rows: &[Record]) -> Option<BTreeSet<i64>> {
    if !golden_rows.iter().any(|row| row.contains_key("txn_id")) {
        return None;
    }

    Some(
        golden_rows
            .iter()
            .filter_map(|row| row.get("txn_id").and_then(ScalarValue::as_i64))
            .collect(),
    )
}

fn score_amounts(
    scanner: &ResponseScanner,
    case: &EvaluationCase,
    golden_rows: &[Record],
    answer: &str,
) -> (f64, String) {
    let amounts = scanner.amounts(answer);

    if amounts.is_empty() {
        let empty_result = golden_rows.is_empty()
            || (golden_rows.len() == 1 && golden_rows[0].values().all(ScalarValue::is_null_or_zero));
        return if empty_result {
            (1.0, "correctly handled empty result".to_string())
        } else {
            (0.0, "no amounts found in answer".to_string())
        };
    }

    let expected = case.expected_amounts();
    if expected.is_empty() {
        return (1.0, "no expected amounts defined".to_string());
    }

    let mut issues = Vec::<String>::new();
    for (label, target) in expected {
        let closest = amounts
            .iter()
            .copied()
            .min_by(|left, right| (left - target).abs().total_cmp(&(right - target).abs()))
            .unwrap_or(f64::NAN);
        if !((closest - target).abs() <= AMOUNT_TOLERANCE + 1e-9) {
            issues.push(format!(
                "{label} mismatch: expected ${target:.2}, closest found ${closest:.2}"
            ));
        }
    }

    if issues.is_empty() {
        (1.0, "amounts are accurate".to_string())
    } else {
        (0.0, issues.join("; "))
    }
}
