#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TokenKind {
    Word,
    Number,
    /// Single-quoted string; `text` holds the unescaped contents.
    Literal,
    QuotedIdent,
    Symbol,
    Comment,
    Whitespace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Token {
    pub(super) kind: TokenKind,
    pub(super) text: String,
    /// False for a string, quoted identifier or block comment that runs off the end.
    pub(super) terminated: bool,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            terminated: true,
        }
    }

    pub(super) fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }

    pub(super) fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    pub(super) fn is_symbol(&self, symbol: &str) -> bool {
        self.kind == TokenKind::Symbol && self.text == symbol
    }

    pub(super) fn is_value(&self) -> bool {
        matches!(self.kind, TokenKind::Number | TokenKind::Literal)
    }

    pub(super) fn names_identifier(&self, name: &str) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
            && self.text.eq_ignore_ascii_case(name)
    }
}

const TWO_CHAR_SYMBOLS: &[&str] = &["||", "==", "!=", "<>", "<=", ">=", "<<", ">>"];

/// Splits SQL text into tokens, keeping comments and whitespace so callers can reason about
/// what was hidden between words.
pub(super) fn tokenize(sql: &str) -> Vec<Token> {
    let chars = sql.chars().collect::<Vec<char>>();
    let mut tokens = Vec::<Token>::new();
    let mut index = 0usize;

    while index < chars.len() {
        let current = chars[index];
        let next = chars.get(index + 1).copied();

        if current.is_whitespace() {
            let start = index;
            while index < chars.len() && chars[index].is_whitespace() {
                index += 1;
            }
            tokens.push(Token::new(
                TokenKind::Whitespace,
                chars[start..index].iter().collect::<String>(),
            ));
            continue;
        }

        if current == '-' && next == Some('-') {
            let start = index + 2;
            index = start;
            while index < chars.len() && chars[index] != '\n' {
                index += 1;
            }
            tokens.push(Token::new(
                TokenKind::Comment,
                chars[start..index].iter().collect::<String>(),
            ));
            continue;
        }

        if current == '/' && next == Some('*') {
            let start = index + 2;
            index = start;
            let mut terminated = false;
            while index < chars.len() {
                if chars[index] == '*' && chars.get(index + 1) == Some(&'/') {
                    terminated = true;
                    break;
                }
                index += 1;
            }
            let body = chars[start..index.min(chars.len())].iter().collect::<String>();
            index = if terminated { index + 2 } else { chars.len() };
            tokens.push(Token {
                kind: TokenKind::Comment,
                text: body,
                terminated,
            });
            continue;
        }

        if current == '\'' {
            let (text, terminated, end) = read_quoted(&chars, index, '\'');
            index = end;
            tokens.push(Token {
                kind: TokenKind::Literal,
                text,
                terminated,
            });
            continue;
        }

        if current == '"' || current == '`' || current == '[' {
            let closing = if current == '[' { ']' } else { current };
            let (text, terminated, end) = read_quoted(&chars, index, closing);
            index = end;
            tokens.push(Token {
                kind: TokenKind::QuotedIdent,
                text,
                terminated,
            });
            continue;
        }

        if current.is_ascii_digit()
            || (current == '.' && next.is_some_and(|value| value.is_ascii_digit()))
        {
            let start = index;
            while index < chars.len() && (chars[index].is_ascii_alphanumeric() || chars[index] == '.') {
                index += 1;
            }
            tokens.push(Token::new(
                TokenKind::Number,
                chars[start..index].iter().collect::<String>(),
            ));
            continue;
        }

        if current.is_alphabetic() || current == '_' {
            let start = index;
            while index < chars.len()
                && (chars[index].is_alphanumeric() || chars[index] == '_' || chars[index] == '$')
            {
                index += 1;
            }
            tokens.push(Token::new(
                TokenKind::Word,
                chars[start..index].iter().collect::<String>(),
            ));
            continue;
        }

        if let Some(next) = next {
            let pair = format!("{current}{next}");
            if TWO_CHAR_SYMBOLS.contains(&pair.as_str()) {
                tokens.push(Token::new(TokenKind::Symbol, pair));
                index += 2;
                continue;
            }
        }

        tokens.push(Token::new(TokenKind::Symbol, current.to_string()));
        index += 1;
    }

    tokens
}

// Doubled closing characters are escapes, as in SQL ('it''s').
fn read_quoted(chars: &[char], open_index: usize, closing: char) -> (String, bool, usize) {
    let mut index = open_index + 1;
    let mut text = String::new();

    while index < chars.len() {
        let current = chars[index];
        if current == closing {
            if closing != ']' && chars.get(index + 1) == Some(&closing) {
                text.push(closing);
                index += 2;
                continue;
            }
            return (text, true, index + 1);
        }
        text.push(current);
        index += 1;
    }

    (text, false, chars.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<(TokenKind, String)> {
        tokenize(sql)
            .into_iter()
            .filter(|token| token.kind != TokenKind::Whitespace)
            .map(|token| (token.kind, token.text))
            .collect()
    }

    #[test]
    fn tokenizes_literals_comments_and_operators() {
        let tokens = kinds("SELECT \"desc\" FROM t WHERE cat = 'it''s' -- note\nAND amt<=0");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Word, "SELECT".to_string()),
                (TokenKind::QuotedIdent, "desc".to_string()),
                (TokenKind::Word, "FROM".to_string()),
                (TokenKind::Word, "t".to_string()),
                (TokenKind::Word, "WHERE".to_string()),
                (TokenKind::Word, "cat".to_string()),
                (TokenKind::Symbol, "=".to_string()),
                (TokenKind::Literal, "it's".to_string()),
                (TokenKind::Comment, " note".to_string()),
                (TokenKind::Word, "AND".to_string()),
                (TokenKind::Word, "amt".to_string()),
                (TokenKind::Symbol, "<=".to_string()),
                (TokenKind::Number, "0".to_string()),
            ]
        );
    }

    #[test]
    fn marks_unterminated_strings() {
        let tokens = tokenize("SELECT * FROM t WHERE cat = 'abc");
        let last = tokens.last().expect("token");
        assert_eq!(last.kind, TokenKind::Literal);
        assert!(!last.terminated);
    }

    #[test]
    fn block_comment_splits_words() {
        let tokens = kinds("DR/**/OP TABLE x");
        assert_eq!(tokens[0], (TokenKind::Word, "DR".to_string()));
        assert_eq!(tokens[1], (TokenKind::Comment, String::new()));
        assert_eq!(tokens[2], (TokenKind::Word, "OP".to_string()));
    }
}
