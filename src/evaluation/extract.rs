use std::collections::BTreeSet;

use anyhow::{Context, Result};
use regex::Regex;

const PLACEHOLDER_MARKERS: [&str; 5] = ["$X.XX", "$Y.YY", "[actual", "[transaction", "placeholder"];

/// Compiled patterns for scanning a final answer as opaque text.
pub(crate) struct ResponseScanner {
    amount: Regex,
    transaction_id: Regex,
    txn_id_field: Regex,
    transaction_list: Regex,
    field_slot: Regex,
    think_block: Regex,
    open_think: Regex,
}

impl ResponseScanner {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            amount: Regex::new(r"(-)?\$(-?[0-9][0-9,]*(?:\.[0-9]+)?)")
                .context("failed to compile amount regex")?,
            transaction_id: Regex::new(r"(?i)\btransaction\s+id\s*[:#]?\s*#?(\d+)")
                .context("failed to compile transaction id regex")?,
            txn_id_field: Regex::new(r"(?i)\btxn_id\s*[:=]\s*(\d+)")
                .context("failed to compile txn_id regex")?,
            transaction_list: Regex::new(r"(?i)\btransactions\s*:\s*(\d+(?:\s*,\s*\d+)*)")
                .context("failed to compile transaction list regex")?,
            field_slot: Regex::new(
                r"(?i)\[(?:txn_id|txn_date|amt|amount|merchant|cat|category|desc|description|date|clnt_id|client_id)\]",
            )
            .context("failed to compile field slot regex")?,
            think_block: Regex::new(r"(?s)<think>.*?</think>")
                .context("failed to compile think block regex")?,
            open_think: Regex::new(r"(?s)<think>.*$")
                .context("failed to compile open think regex")?,
        })
    }

    /// Dollar amounts such as `$-1,234.56`, `-$1,234.56` and `$1234`.
    pub(crate) fn amounts(&self, text: &str) -> Vec<f64> {
        self.amount
            .captures_iter(text)
            .filter_map(|captures| {
                let digits = captures.get(2)?.as_str().replace(',', "");
                let value = digits.parse::<f64>().ok()?;
                if captures.get(1).is_some() && value > 0.0 {
                    Some(-value)
                } else {
                    Some(value)
                }
            })
            .collect()
    }

    /// Sorted, de-duplicated transaction ids mentioned in the text.
    pub(crate) fn transaction_ids(&self, text: &str) -> Vec<i64> {
        let mut ids = BTreeSet::<i64>::new();

        for pattern in [&self.transaction_id, &self.txn_id_field] {
            for captures in pattern.captures_iter(text) {
                if let Some(id) = captures.get(1).and_then(|m| m.as_str().parse::<i64>().ok()) {
                    ids.insert(id);
                }
            }
        }

        for captures in self.transaction_list.captures_iter(text) {
            let Some(list) = captures.get(1) else {
                continue;
            };
            ids.extend(
                list.as_str()
                    .split(',')
                    .filter_map(|value| value.trim().parse::<i64>().ok()),
            );
        }

        ids.into_iter().collect()
    }

    pub(crate) fn placeholders(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut found = PLACEHOLDER_MARKERS
            .iter()
            .filter(|marker| lowered.contains(&marker.to_lowercase()))
            .map(|marker| (*marker).to_string())
            .collect::<Vec<String>>();

        found.extend(
            self.field_slot
                .find_iter(text)
                .map(|slot| slot.as_str().to_string()),
        );
        found.dedup();
        found
    }

    /// Drops `<think>` reasoning so only the user-facing answer is scored.
    pub(crate) fn strip_think(&self, text: &str) -> String {
        let closed = self.think_block.replace_all(text, "");
        self.open_think.replace(&closed, "").trim().to_string()
    }
}

/// True when three consecutive integers appear among `ids`.
pub(crate) fn sequential_run(ids: &[i64]) -> Option<[i64; 3]> {
    let unique = ids.iter().copied().collect::<BTreeSet<i64>>();
    unique
        .iter()
        .find(|id| unique.contains(&(**id + 1)) && unique.contains(&(**id + 2)))
        .map(|id| [*id, id + 1, id + 2])
}
