use crate::model::{Candidate, FieldKind};

/// Stable two-bucket partition: category entries first, everything else after, each bucket
/// keeping the order it arrived in. Never re-sorts, so distance order inside a bucket is
/// exactly the index's order.
pub fn rerank_category_first(hits: Vec<Candidate>) -> Vec<Candidate> {
    let (mut categories, others): (Vec<Candidate>, Vec<Candidate>) = hits
        .into_iter()
        .partition(|candidate| candidate.field_kind == FieldKind::Category);

    categories.extend(others);
    categories
}
