use proptest::prelude::*;
use rusqlite::Connection;

use super::index::order_by_distance;
use super::*;
use crate::cli::EmbedRefreshMode;
use crate::commands::embed::build_value_index;
use crate::model::FieldKind;
use crate::semantic::resolve_model_config;
use crate::store::test_support::create_seeded_db;

struct FixedIndex {
    hits: Vec<Candidate>,
}

impl SemanticIndex for FixedIndex {
    fn nearest(&self, _text: &str, k: usize) -> Result<Vec<Candidate>, RetrievalError> {
        Ok(self.hits.iter().take(k).cloned().collect())
    }
}

struct OfflineIndex;

impl SemanticIndex for OfflineIndex {
    fn nearest(&self, _text: &str, _k: usize) -> Result<Vec<Candidate>, RetrievalError> {
        Err(RetrievalError::IndexUnavailable {
            reason: "connection refused".to_string(),
        })
    }
}

fn candidate(value: &str, field_kind: FieldKind, distance: f64) -> Candidate {
    Candidate {
        value: value.to_string(),
        field_kind,
        distance,
    }
}

#[test]
fn category_outranks_closer_merchant() {
    let index = FixedIndex {
        hits: vec![
            candidate("GROCERY", FieldKind::Merchant, 0.0821),
            candidate("Supermarkets and Groceries", FieldKind::Category, 0.1632),
        ],
    };

    let set = retrieve(&index, "grocery").expect("retrieval");
    assert_eq!(set.query, "grocery");
    assert_eq!(set.candidates[0].value, "Supermarkets and Groceries");
    assert_eq!(set.candidates[0].field_kind, FieldKind::Category);
    assert_eq!(set.candidates[1].value, "GROCERY");
}

#[test]
fn returns_at_most_fifteen_candidates_without_threshold() {
    let hits = (0..40)
        .map(|i| candidate(&format!("value {i}"), FieldKind::Description, 0.9 + i as f64))
        .collect::<Vec<Candidate>>();
    let index = FixedIndex { hits };

    let set = retrieve(&index, "anything").expect("retrieval");
    assert_eq!(set.len(), CANDIDATE_LIMIT);
}

#[test]
fn empty_query_is_rejected() {
    let index = FixedIndex { hits: Vec::new() };
    assert_eq!(retrieve(&index, "   "), Err(RetrievalError::EmptyQuery));
}

#[test]
fn unreachable_index_is_an_explicit_failure() {
    let err = retrieve(&OfflineIndex, "coffee").expect_err("offline index must fail");
    assert!(matches!(err, RetrievalError::IndexUnavailable { .. }));
}

#[test]
fn equidistant_entries_break_ties_by_value_then_kind() {
    let mut hits = vec![
        candidate("b", FieldKind::Category, 0.5),
        candidate("a", FieldKind::Description, 0.5),
        candidate("a", FieldKind::Category, 0.5),
        candidate("z", FieldKind::Merchant, 0.1),
    ];
    order_by_distance(&mut hits);

    let order = hits
        .iter()
        .map(|hit| (hit.value.as_str(), hit.field_kind))
        .collect::<Vec<(&str, FieldKind)>>();
    assert_eq!(
        order,
        vec![
            ("z", FieldKind::Merchant),
            ("a", FieldKind::Category),
            ("a", FieldKind::Description),
            ("b", FieldKind::Category),
        ]
    );
}

#[test]
fn sqlite_index_reports_missing_embeddings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("index.sqlite");
    create_seeded_db(&db_path);

    let index = SqliteValueIndex::open(&db_path, resolve_model_config(""));
    let err = retrieve(&index, "grocery").expect_err("no index built yet");
    assert!(matches!(err, RetrievalError::IndexUnavailable { .. }));
}

#[test]
fn sqlite_index_serves_built_values_categories_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("index.sqlite");
    create_seeded_db(&db_path);

    let model = resolve_model_config("");
    let mut connection = Connection::open(&db_path).expect("open");
    build_value_index(&mut connection, &model, EmbedRefreshMode::Full, 64).expect("build");
    drop(connection);

    let index = SqliteValueIndex::open(&db_path, model);
    let set = retrieve(&index, "grocery").expect("retrieval");

    assert_eq!(set.len(), 14);
    let first_other = set
        .iter()
        .position(|hit| hit.field_kind != FieldKind::Category)
        .expect("non-category entries present");
    assert!(set.candidates[..first_other]
        .iter()
        .all(|hit| hit.field_kind == FieldKind::Category));
    assert!(set.candidates[first_other..]
        .iter()
        .all(|hit| hit.field_kind != FieldKind::Category));
    assert_eq!(set.candidates[0].value, "Supermarkets and Groceries");
    assert_eq!(set.candidates[first_other].value, "GROCERY");
}

fn arb_field_kind() -> impl Strategy<Value = FieldKind> {
    prop_oneof![
        Just(FieldKind::Category),
        Just(FieldKind::Merchant),
        Just(FieldKind::Description),
    ]
}

proptest! {
    #[test]
    fn rerank_puts_categories_first_and_keeps_bucket_order(
        kinds in proptest::collection::vec(arb_field_kind(), 0..15)
    ) {
        let hits = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| candidate(&format!("v{i}"), *kind, i as f64 / 100.0))
            .collect::<Vec<Candidate>>();

        let reranked = rerank_category_first(hits.clone());
        prop_assert_eq!(reranked.len(), hits.len());

        let split = reranked
            .iter()
            .position(|hit| hit.field_kind != FieldKind::Category)
            .unwrap_or(reranked.len());
        prop_assert!(reranked[split..].iter().all(|hit| hit.field_kind != FieldKind::Category));

        let expected_categories = hits
            .iter()
            .filter(|hit| hit.field_kind == FieldKind::Category)
            .cloned()
            .collect::<Vec<Candidate>>();
        let expected_others = hits
            .iter()
            .filter(|hit| hit.field_kind != FieldKind::Category)
            .cloned()
            .collect::<Vec<Candidate>>();
        prop_assert_eq!(&reranked[..split], expected_categories.as_slice());
        prop_assert_eq!(&reranked[split..], expected_others.as_slice());
    }
}
