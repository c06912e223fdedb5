use regex::Regex;

use crate::model::ClientScope;

use super::lexer::{Token, TokenKind, tokenize};

const SCOPE_COLUMN: &str = "clnt_id";

const FORBIDDEN_VERBS: &[&str] = &[
    "insert", "update", "delete", "drop", "create", "alter", "truncate", "attach", "detach",
    "pragma", "vacuum", "reindex", "grant", "revoke", "merge", "upsert", "exec", "execute",
];

const SUSPICIOUS_IDENTIFIERS: &[&str] = &[
    "sqlite_master",
    "sqlite_schema",
    "sqlite_temp_master",
    "load_extension",
    "xp_cmdshell",
];

const CLAUSE_TERMINATORS: &[&str] = &["and", "or", "group", "order", "limit", "having", "union"];

const WHERE_TERMINATORS: &[&str] = &[
    "group", "order", "limit", "having", "window", "union", "except", "intersect",
];

/// Outcome of scanning one statement; the gateway maps each variant to a rejection reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Finding {
    MissingScope(String),
    Forbidden(String),
    Injection(String),
}

pub(super) struct StatementScan {
    tokens: Vec<Token>,
    significant: Vec<Token>,
}

/// Where the bound scope filter sits in the outer WHERE clause.
#[derive(Debug, Clone, Copy, Default)]
struct ScopePlacement {
    /// A top-level AND-conjunct is exactly the bound predicate.
    anchored: bool,
    /// A bound predicate outside any subquery shares a group with OR.
    or_combined: bool,
}

impl StatementScan {
    pub(super) fn new(sql: &str) -> Self {
        let tokens = tokenize(sql);
        let significant = tokens
            .iter()
            .filter(|token| !token.is_trivia())
            .cloned()
            .collect::<Vec<Token>>();
        Self {
            tokens,
            significant,
        }
    }

    /// Runs the checks in gateway order; the first finding wins.
    pub(super) fn first_finding(&self, scope: ClientScope, verb_pattern: &Regex) -> Option<Finding> {
        let placement = match self.scope_placement(scope) {
            Ok(placement) => placement,
            Err(finding) => return Some(finding),
        };

        if let Some(finding) = self.forbidden_operation(verb_pattern) {
            return Some(finding);
        }

        self.injection_pattern(placement)
    }

    fn scope_placement(&self, scope: ClientScope) -> Result<ScopePlacement, Finding> {
        let tokens = &self.significant;

        for (position, token) in tokens.iter().enumerate() {
            if !token.names_identifier(SCOPE_COLUMN) {
                continue;
            }
            if let ScopeUse::Foreign(detail) = classify_scope_use(tokens, position, scope) {
                return Err(Finding::MissingScope(detail));
            }
        }

        let depths = paren_depths(tokens);
        let placement = outer_where_clause(tokens, &depths)
            .map(|(start, end)| {
                let walk = ConditionWalk {
                    tokens,
                    depths: &depths,
                    in_subquery: subquery_mask(tokens),
                    scope,
                };
                walk.placement(start, end, 0)
            })
            .unwrap_or_default();

        if !placement.anchored && !placement.or_combined {
            return Err(Finding::MissingScope(format!(
                "query must filter by {SCOPE_COLUMN} = {scope} as a top-level condition of the outer WHERE clause"
            )));
        }
        Ok(placement)
    }

    fn forbidden_operation(&self, verb_pattern: &Regex) -> Option<Finding> {
        let first = self
            .significant
            .iter()
            .find(|token| !token.is_symbol("("))?;
        if !(first.is_word("select") || first.is_word("with")) {
            return Some(Finding::Forbidden(format!(
                "only SELECT statements are allowed, found '{}'",
                first.text
            )));
        }

        for token in &self.significant {
            if token.kind == TokenKind::Word && is_forbidden_verb(&token.text) {
                return Some(Finding::Forbidden(format!(
                    "statement contains '{}'",
                    token.text.to_ascii_uppercase()
                )));
            }
        }

        for word in words_glued_across_comments(&self.tokens) {
            if is_forbidden_verb(&word) {
                return Some(Finding::Forbidden(format!(
                    "'{}' assembled across a comment",
                    word.to_ascii_uppercase()
                )));
            }
        }

        for token in self.tokens.iter().filter(|token| token.kind == TokenKind::Comment) {
            if let Some(found) = verb_pattern.find(&token.text) {
                return Some(Finding::Forbidden(format!(
                    "comment hides '{}'",
                    found.as_str().to_ascii_uppercase()
                )));
            }
        }

        for assembled in concatenated_literals(&self.significant) {
            if let Some(found) = verb_pattern.find(&assembled) {
                return Some(Finding::Forbidden(format!(
                    "string concatenation assembles '{}'",
                    found.as_str().to_ascii_uppercase()
                )));
            }
        }

        None
    }

    fn injection_pattern(&self, placement: ScopePlacement) -> Option<Finding> {
        if self.tokens.iter().any(|token| token.kind == TokenKind::Comment) {
            return Some(Finding::Injection("comment sequence in query".to_string()));
        }

        if self.tokens.iter().any(|token| !token.terminated) {
            return Some(Finding::Injection("unbalanced quote".to_string()));
        }

        let tokens = &self.significant;
        let chained = tokens
            .iter()
            .position(|token| token.is_symbol(";"))
            .is_some_and(|position| position + 1 < tokens.len());
        if chained {
            return Some(Finding::Injection("statement chaining after ';'".to_string()));
        }

        for (position, token) in tokens.iter().enumerate() {
            if token.is_word("union") {
                let mut next = position + 1;
                if tokens
                    .get(next)
                    .is_some_and(|value| value.is_word("all") || value.is_word("distinct"))
                {
                    next += 1;
                }
                if tokens.get(next).is_some_and(|value| value.is_word("select")) {
                    return Some(Finding::Injection("UNION SELECT result splicing".to_string()));
                }
            }

            if token.is_word("or") {
                if let Some(detail) = tautology_after_or(tokens, position) {
                    return Some(Finding::Injection(detail));
                }
                if position > 0
                    && tokens[position - 1].kind == TokenKind::Literal
                    && tokens
                        .get(position + 1)
                        .is_some_and(|value| value.kind == TokenKind::Literal)
                {
                    return Some(Finding::Injection("quote-based OR".to_string()));
                }
            }

            if matches!(token.kind, TokenKind::Word | TokenKind::QuotedIdent)
                && SUSPICIOUS_IDENTIFIERS
                    .iter()
                    .any(|name| token.text.eq_ignore_ascii_case(name))
            {
                return Some(Finding::Injection(format!(
                    "reference to '{}'",
                    token.text.to_ascii_lowercase()
                )));
            }
        }

        if placement.or_combined {
            return Some(Finding::Injection(format!(
                "{SCOPE_COLUMN} filter is combined with OR"
            )));
        }

        None
    }
}

pub(super) fn forbidden_verb_pattern() -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"(?i)\b({})\b", FORBIDDEN_VERBS.join("|")))
}

fn is_forbidden_verb(word: &str) -> bool {
    FORBIDDEN_VERBS
        .iter()
        .any(|verb| word.eq_ignore_ascii_case(verb))
}

enum ScopeUse {
    Bound,
    Foreign(String),
    Neutral,
}

fn classify_scope_use(tokens: &[Token], position: usize, scope: ClientScope) -> ScopeUse {
    let next = tokens.get(position + 1);
    let after = tokens.get(position + 2);

    if let Some(operator) = next {
        if operator.is_symbol("=") || operator.is_symbol("==") {
            return match after.and_then(scope_literal) {
                Some(value) if value == scope.id() => ScopeUse::Bound,
                Some(value) => ScopeUse::Foreign(format!(
                    "{SCOPE_COLUMN} compared to {value}, bound scope is {scope}"
                )),
                None => ScopeUse::Neutral,
            };
        }

        if ["!=", "<>", "<", ">", "<=", ">="]
            .iter()
            .any(|symbol| operator.is_symbol(symbol))
            || ["like", "glob", "between", "not", "is", "regexp", "match"]
                .iter()
                .any(|word| operator.is_word(word))
        {
            return ScopeUse::Foreign(format!(
                "{SCOPE_COLUMN} used with '{}' instead of equality",
                operator.text
            ));
        }

        if operator.is_word("in") {
            return classify_in_list(tokens, position + 2, scope);
        }
    }

    let column_start = if position >= 2 && tokens[position - 1].is_symbol(".") {
        position - 2
    } else {
        position
    };
    if column_start >= 2
        && (tokens[column_start - 1].is_symbol("=") || tokens[column_start - 1].is_symbol("=="))
    {
        return match scope_literal(&tokens[column_start - 2]) {
            Some(value) if value == scope.id() => ScopeUse::Bound,
            Some(value) => ScopeUse::Foreign(format!(
                "{SCOPE_COLUMN} compared to {value}, bound scope is {scope}"
            )),
            None => ScopeUse::Neutral,
        };
    }

    ScopeUse::Neutral
}

fn classify_in_list(tokens: &[Token], open_position: usize, scope: ClientScope) -> ScopeUse {
    if !tokens
        .get(open_position)
        .is_some_and(|token| token.is_symbol("("))
    {
        return ScopeUse::Foreign(format!("{SCOPE_COLUMN} IN without a literal list"));
    }

    let mut values = Vec::<i64>::new();
    let mut position = open_position + 1;
    while let Some(token) = tokens.get(position) {
        if token.is_symbol(")") {
            break;
        }
        if token.is_symbol(",") {
            position += 1;
            continue;
        }
        match scope_literal(token) {
            Some(value) => values.push(value),
            None => {
                return ScopeUse::Foreign(format!(
                    "{SCOPE_COLUMN} IN list must hold literal client ids"
                ));
            }
        }
        position += 1;
    }

    if values.is_empty() {
        return ScopeUse::Foreign(format!("{SCOPE_COLUMN} IN list is empty"));
    }
    if values.iter().all(|value| *value == scope.id()) {
        ScopeUse::Bound
    } else {
        ScopeUse::Foreign(format!(
            "{SCOPE_COLUMN} IN list names clients other than {scope}"
        ))
    }
}

fn scope_literal(token: &Token) -> Option<i64> {
    if !token.is_value() {
        return None;
    }
    token.text.trim().parse::<i64>().ok()
}

fn paren_depths(tokens: &[Token]) -> Vec<usize> {
    let mut depth = 0usize;
    tokens
        .iter()
        .map(|token| {
            if token.is_symbol("(") {
                depth += 1;
                depth - 1
            } else if token.is_symbol(")") {
                depth = depth.saturating_sub(1);
                depth
            } else {
                depth
            }
        })
        .collect()
}

// Span of the first WHERE at paren depth 0, up to the clause that follows it.
fn outer_where_clause(tokens: &[Token], depths: &[usize]) -> Option<(usize, usize)> {
    let keyword = (0..tokens.len()).find(|&position| {
        depths[position] == 0 && tokens[position].is_word("where")
    })?;
    let start = keyword + 1;
    let end = (start..tokens.len())
        .find(|&position| {
            depths[position] == 0
                && (tokens[position].is_symbol(";")
                    || WHERE_TERMINATORS
                        .iter()
                        .any(|word| tokens[position].is_word(word)))
        })
        .unwrap_or(tokens.len());
    Some((start, end))
}

// True for tokens nested inside a parenthesized SELECT.
fn subquery_mask(tokens: &[Token]) -> Vec<bool> {
    let mut open = Vec::<bool>::new();
    let mut mask = Vec::with_capacity(tokens.len());

    for (position, token) in tokens.iter().enumerate() {
        if token.is_symbol("(") {
            mask.push(open.contains(&true));
            let opens_select = tokens
                .get(position + 1)
                .is_some_and(|next| next.is_word("select") || next.is_word("with"));
            open.push(opens_select);
        } else if token.is_symbol(")") {
            open.pop();
            mask.push(open.contains(&true));
        } else {
            mask.push(open.contains(&true));
        }
    }

    mask
}

struct ConditionWalk<'a> {
    tokens: &'a [Token],
    depths: &'a [usize],
    in_subquery: Vec<bool>,
    scope: ClientScope,
}

impl ConditionWalk<'_> {
    /// Walks `start..end` as a boolean condition whose operators sit at `depth`. AND binds
    /// tighter than OR, so any OR at this level makes every predicate in the span optional.
    fn placement(&self, start: usize, end: usize, depth: usize) -> ScopePlacement {
        if start >= end {
            return ScopePlacement::default();
        }

        let or_at_level = (start..end)
            .any(|position| self.depths[position] == depth && self.tokens[position].is_word("or"));
        if or_at_level {
            return ScopePlacement {
                anchored: false,
                or_combined: (start..end).any(|position| self.binds_scope(position)),
            };
        }

        let mut placement = ScopePlacement::default();
        for (conjunct_start, conjunct_end) in self.conjuncts(start, end, depth) {
            if self.is_group(conjunct_start, conjunct_end, depth) {
                let inner = self.placement(conjunct_start + 1, conjunct_end - 1, depth + 1);
                placement.anchored |= inner.anchored;
                placement.or_combined |= inner.or_combined;
            } else if self.is_scope_conjunct(conjunct_start, conjunct_end) {
                placement.anchored = true;
            }
        }
        placement
    }

    // Splits on AND at `depth`, leaving the AND of `BETWEEN x AND y` inside its conjunct.
    fn conjuncts(&self, start: usize, end: usize, depth: usize) -> Vec<(usize, usize)> {
        let mut spans = Vec::<(usize, usize)>::new();
        let mut conjunct_start = start;
        let mut pending_between = false;

        for position in start..end {
            if self.depths[position] != depth {
                continue;
            }
            let token = &self.tokens[position];
            if token.is_word("between") {
                pending_between = true;
            } else if token.is_word("and") {
                if pending_between {
                    pending_between = false;
                } else {
                    spans.push((conjunct_start, position));
                    conjunct_start = position + 1;
                }
            }
        }

        spans.push((conjunct_start, end));
        spans
    }

    fn is_group(&self, start: usize, end: usize, depth: usize) -> bool {
        end >= start + 2
            && self.tokens[start].is_symbol("(")
            && self.tokens[end - 1].is_symbol(")")
            && (start + 1..end - 1).all(|position| self.depths[position] > depth)
            && !self.in_subquery[start + 1]
    }

    // `[t.]clnt_id = v`, `v = [t.]clnt_id` or `[t.]clnt_id IN (v, ...)` and nothing else.
    fn is_scope_conjunct(&self, start: usize, end: usize) -> bool {
        let span = &self.tokens[start..end];
        let Some(column) = span
            .iter()
            .position(|token| token.names_identifier(SCOPE_COLUMN))
        else {
            return false;
        };

        let qualified = column >= 2
            && span[column - 1].is_symbol(".")
            && matches!(span[column - 2].kind, TokenKind::Word | TokenKind::QuotedIdent);
        let column_start = if qualified { column - 2 } else { column };
        let is_equals = |token: &Token| token.is_symbol("=") || token.is_symbol("==");

        let shaped = if column_start == 0 {
            let rest = &span[column + 1..];
            match rest {
                [operator, value] => is_equals(operator) && value.is_value(),
                [keyword, open, list @ .., close] => {
                    keyword.is_word("in")
                        && open.is_symbol("(")
                        && close.is_symbol(")")
                        && list
                            .iter()
                            .all(|token| token.is_value() || token.is_symbol(","))
                }
                _ => false,
            }
        } else {
            column_start == 2
                && column == span.len() - 1
                && span[0].is_value()
                && is_equals(&span[1])
        };

        shaped
            && matches!(
                classify_scope_use(self.tokens, start + column, self.scope),
                ScopeUse::Bound
            )
    }

    fn binds_scope(&self, position: usize) -> bool {
        !self.in_subquery[position]
            && self.tokens[position].names_identifier(SCOPE_COLUMN)
            && matches!(
                classify_scope_use(self.tokens, position, self.scope),
                ScopeUse::Bound
            )
    }
}

fn tautology_after_or(tokens: &[Token], or_position: usize) -> Option<String> {
    let left = tokens.get(or_position + 1)?;

    if left.is_word("true") {
        return Some("tautological OR TRUE".to_string());
    }

    if left.is_value() {
        let operator = tokens.get(or_position + 2);
        let right = tokens.get(or_position + 3);
        let compares_equal_literals = match (operator, right) {
            (Some(operator), Some(right)) => {
                (operator.is_symbol("=") || operator.is_symbol("=="))
                    && right.is_value()
                    && normalized_value(left) == normalized_value(right)
            }
            _ => false,
        };
        if compares_equal_literals {
            return Some(format!("tautological predicate OR {0}={0}", left.text));
        }

        let stands_alone = operator.is_none_or(|token| {
            token.is_symbol(")")
                || token.is_symbol(";")
                || CLAUSE_TERMINATORS.iter().any(|word| token.is_word(word))
        });
        let truthy_number = left.kind == TokenKind::Number
            && left.text.parse::<f64>().is_ok_and(|value| value != 0.0);
        if stands_alone && truthy_number {
            return Some(format!("tautological OR {}", left.text));
        }
    }

    None
}

fn normalized_value(token: &Token) -> String {
    match token.kind {
        TokenKind::Number => token
            .text
            .parse::<f64>()
            .map(|value| value.to_string())
            .unwrap_or_else(|_| token.text.clone()),
        _ => token.text.clone(),
    }
}

// Words split by an inline comment with no whitespace around it ("DR/**/OP").
fn words_glued_across_comments(tokens: &[Token]) -> Vec<String> {
    let mut glued = Vec::<String>::new();
    let mut position = 0usize;

    while position < tokens.len() {
        if tokens[position].kind != TokenKind::Word {
            position += 1;
            continue;
        }

        let mut word = tokens[position].text.clone();
        let mut cursor = position + 1;
        let mut spliced = false;
        while cursor + 1 < tokens.len()
            && tokens[cursor].kind == TokenKind::Comment
            && tokens[cursor + 1].kind == TokenKind::Word
        {
            word.push_str(&tokens[cursor + 1].text);
            cursor += 2;
            spliced = true;
        }

        if spliced {
            glued.push(word);
        }
        position = cursor;
    }

    glued
}

// Literal runs joined with `||`, e.g. 'DR' || 'OP TABLE'.
fn concatenated_literals(tokens: &[Token]) -> Vec<String> {
    let mut assembled = Vec::<String>::new();
    let mut position = 0usize;

    while position < tokens.len() {
        if tokens[position].kind != TokenKind::Literal {
            position += 1;
            continue;
        }

        let mut text = tokens[position].text.clone();
        let mut cursor = position + 1;
        let mut joined = false;
        while cursor + 1 < tokens.len()
            && tokens[cursor].is_symbol("||")
            && tokens[cursor + 1].kind == TokenKind::Literal
        {
            text.push_str(&tokens[cursor + 1].text);
            cursor += 2;
            joined = true;
        }

        if joined {
            assembled.push(text);
        }
        position = cursor;
    }

    assembled
}
