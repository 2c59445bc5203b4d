//! Minimal SQL lexer used by the read-only gate
//!
//! The lexer only needs to be precise about where literals and comments
//! start and end, because everything outside them is scanned for verbs.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare identifier or keyword
    Word,
    /// `"ident"`, `` `ident` `` or `[ident]`
    QuotedIdent,
    /// `'text'`
    StringLit,
    Number,
    /// `?`, `?1`, `$1`, `$name`, `:name`, `@name`
    Param,
    LParen,
    RParen,
    Comma,
    Dot,
    Semicolon,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub offset: usize,
}

impl<'a> Token<'a> {
    /// Upper-cased keyword form of a bare word
    pub fn keyword(&self) -> Option<String> {
        match self.kind {
            TokenKind::Word => Some(self.text.to_ascii_uppercase()),
            _ => None,
        }
    }

    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    /// Identifier value: bare words are lower-cased, quoted identifiers keep
    /// their case with delimiters and doubled quotes removed.
    pub fn identifier(&self) -> Option<String> {
        match self.kind {
            TokenKind::Word => Some(self.text.to_lowercase()),
            TokenKind::QuotedIdent => {
                let inner = &self.text[1..self.text.len() - 1];
                let unescaped = match self.text.as_bytes()[0] {
                    b'"' => inner.replace("\"\"", "\""),
                    b'`' => inner.replace("``", "`"),
                    _ => inner.replace("]]", "]"),
                };
                Some(unescaped)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexError {
    UnterminatedString { offset: usize },
    UnterminatedIdentifier { offset: usize },
    UnterminatedComment { offset: usize },
    AmbiguousEscape { offset: usize },
    /// `$$` or `$tag$`: a string in Postgres, a bind parameter in SQLite
    DollarQuote { offset: usize },
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::UnterminatedString { offset } => {
                write!(f, "unterminated string literal at byte {}", offset)
            }
            LexError::UnterminatedIdentifier { offset } => {
                write!(f, "unterminated quoted identifier at byte {}", offset)
            }
            LexError::UnterminatedComment { offset } => {
                write!(f, "unterminated block comment at byte {}", offset)
            }
            LexError::AmbiguousEscape { offset } => {
                write!(f, "backslash-escaped quote at byte {} is dialect dependent", offset)
            }
            LexError::DollarQuote { offset } => {
                write!(f, "dollar-quoted delimiter at byte {} is dialect dependent", offset)
            }
        }
    }
}

/// Words that never name a table or column.
const KEYWORDS: &[&str] = &[
    "ALL", "AND", "ANY", "AS", "ASC", "BETWEEN", "BY", "CASE", "CAST", "COLLATE", "CROSS",
    "CURRENT", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "DATE", "DAY", "DESC",
    "DISTINCT", "DOW", "DOY", "ELSE", "END", "EPOCH", "ESCAPE", "EXCEPT", "EXISTS", "EXTRACT",
    "FALSE", "FETCH", "FILTER", "FIRST", "FOLLOWING", "FOR", "FROM", "FULL", "GLOB", "GROUP",
    "HAVING", "HOUR", "ILIKE", "IN", "INNER", "INTERSECT", "INTERVAL", "IS", "ISNULL", "JOIN",
    "LAST", "LATERAL", "LEFT", "LIKE", "LIMIT", "MATERIALIZED", "MINUTE", "MONTH", "NATURAL",
    "NEXT", "NOT", "NOTNULL", "NULL", "NULLS", "OFFSET", "ON", "ONLY", "OR", "ORDER", "OUTER",
    "OVER", "PARTITION", "PERCENT", "POSITION", "PRECEDING", "QUALIFY", "QUARTER", "RANGE",
    "RECURSIVE", "REGEXP", "RIGHT", "ROW", "ROWS", "SECOND", "SELECT", "SIMILAR", "SOME",
    "SUBSTRING", "THEN", "TIME", "TIMESTAMP", "TOP", "TRIM", "TRUE", "UNBOUNDED", "UNION",
    "USING", "VALUES", "WEEK", "WHEN", "WHERE", "WINDOW", "WITH", "WITHIN", "YEAR",
];

pub fn is_keyword(upper: &str) -> bool {
    KEYWORDS.contains(&upper)
}

/// Multi-character operators kept as a single token, longest first.
const COMPOUND_OPERATORS: &[&str] = &["->>", "::", "<>", "<=", ">=", "!=", "==", "||", "<<", ">>", "->", "=>"];

pub fn tokenize(sql: &str) -> Result<Vec<Token<'_>>, LexError> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while let Some(ch) = sql[pos..].chars().next() {
        let rest = &sql[pos..];
        let start = pos;

        if ch.is_whitespace() {
            pos += ch.len_utf8();
            continue;
        }
        if rest.starts_with("--") {
            pos += rest.find('\n').map_or(rest.len(), |n| n + 1);
            continue;
        }
        if rest.starts_with("/*") {
            match rest[2..].find("*/") {
                Some(end) => pos += end + 4,
                None => return Err(LexError::UnterminatedComment { offset: start }),
            }
            continue;
        }

        let (kind, len) = match ch {
            '\'' => (TokenKind::StringLit, quoted_len(rest, '\'', start)?),
            '"' => (TokenKind::QuotedIdent, quoted_len(rest, '"', start)?),
            '`' => (TokenKind::QuotedIdent, quoted_len(rest, '`', start)?),
            '[' => (TokenKind::QuotedIdent, bracket_len(rest, start)?),
            '$' => dollar_token(rest, start)?,
            '(' => (TokenKind::LParen, 1),
            ')' => (TokenKind::RParen, 1),
            ',' => (TokenKind::Comma, 1),
            ';' => (TokenKind::Semicolon, 1),
            '.' if rest[1..].starts_with(|c: char| c.is_ascii_digit()) => {
                (TokenKind::Number, number_len(rest))
            }
            '.' => (TokenKind::Dot, 1),
            '?' => (TokenKind::Param, 1 + ascii_run(&rest[1..], |c| c.is_ascii_digit())),
            ':' if rest[1..].starts_with(is_word_start) => {
                (TokenKind::Param, 1 + word_len(&rest[1..]))
            }
            '@' => {
                let sigils = ascii_run(rest, |c| c == '@');
                (TokenKind::Param, sigils + word_len(&rest[sigils..]))
            }
            c if c.is_ascii_digit() => (TokenKind::Number, number_len(rest)),
            c if is_word_start(c) => (TokenKind::Word, word_len(rest)),
            c => {
                let len = COMPOUND_OPERATORS
                    .iter()
                    .find(|op| rest.starts_with(*op))
                    .map_or(c.len_utf8(), |op| op.len());
                (TokenKind::Operator, len)
            }
        };

        tokens.push(Token {
            kind,
            text: &rest[..len],
            offset: start,
        });
        pos += len;
    }

    Ok(tokens)
}

fn is_word_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_word_char(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphanumeric()
}

fn word_len(s: &str) -> usize {
    s.char_indices()
        .find(|(_, c)| !is_word_char(*c))
        .map_or(s.len(), |(i, _)| i)
}

fn number_len(s: &str) -> usize {
    s.char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '.' || *c == '_'))
        .map_or(s.len(), |(i, _)| i)
}

fn ascii_run(s: &str, pred: impl Fn(char) -> bool) -> usize {
    s.char_indices()
        .find(|(_, c)| !pred(*c))
        .map_or(s.len(), |(i, _)| i)
}

/// Length of a literal delimited by `quote`, where a doubled quote escapes.
fn quoted_len(s: &str, quote: char, offset: usize) -> Result<usize, LexError> {
    let bytes = s.as_bytes();
    let q = quote as u8;
    let mut i = 1;
    while i < bytes.len() {
        if bytes[i] == q {
            if quote != '`' && bytes[i - 1] == b'\\' {
                return Err(LexError::AmbiguousEscape { offset: offset + i });
            }
            if bytes.get(i + 1) == Some(&q) {
                i += 2;
                continue;
            }
            return Ok(i + 1);
        }
        i += 1;
    }
    match quote {
        '\'' => Err(LexError::UnterminatedString { offset }),
        _ => Err(LexError::UnterminatedIdentifier { offset }),
    }
}

fn bracket_len(s: &str, offset: usize) -> Result<usize, LexError> {
    let bytes = s.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b']' if bytes.get(i + 1) == Some(&b']') => i += 2,
            b']' => return Ok(i + 1),
            b';' | b'\'' | b'"' => return Err(LexError::UnterminatedIdentifier { offset }),
            _ => i += 1,
        }
    }
    Err(LexError::UnterminatedIdentifier { offset })
}

/// `$1` and `$name` parameters. Dollar-quote delimiters are refused since
/// the executor dialect reads the text between them as code.
fn dollar_token(s: &str, offset: usize) -> Result<(TokenKind, usize), LexError> {
    let after = &s[1..];
    let digits = ascii_run(after, |c| c.is_ascii_digit());
    if digits > 0 {
        return Ok((TokenKind::Param, 1 + digits));
    }
    let tag_len = ascii_run(after, |c| c.is_ascii_alphanumeric() || c == '_');
    if after[tag_len..].starts_with('$') {
        return Err(LexError::DollarQuote { offset });
    }
    if after.starts_with(is_word_start) {
        return Ok((TokenKind::Param, 1 + tag_len));
    }
    Ok((TokenKind::Operator, 1))
}

/// Reassembles tokens with single spaces, dropping comments and layout.
pub fn render(tokens: &[Token<'_>]) -> String {
    let mut out = String::new();
    let mut prev: Option<&Token<'_>> = None;
    for token in tokens {
        if let Some(p) = prev {
            if needs_space(p, token) {
                out.push(' ');
            }
        }
        out.push_str(token.text);
        prev = Some(token);
    }
    out
}

fn needs_space(prev: &Token<'_>, next: &Token<'_>) -> bool {
    match (prev.kind, next.kind) {
        (TokenKind::LParen | TokenKind::Dot, _) => false,
        (_, TokenKind::RParen | TokenKind::Comma | TokenKind::Dot | TokenKind::Semicolon) => false,
        (TokenKind::Operator, _) if prev.text == "::" => false,
        (_, TokenKind::Operator) if next.text == "::" => false,
        (TokenKind::Word | TokenKind::QuotedIdent, TokenKind::LParen) => prev
            .keyword()
            .map_or(true, |kw| is_keyword(&kw)),
        _ => true,
    }
}
