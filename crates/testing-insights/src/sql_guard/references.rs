//! Best-effort table and column reference extraction.
//!
//! Results feed logging and long-term keyword indexing. They are never used
//! to decide whether a statement is safe.

use super::lexer::{is_keyword, Token, TokenKind};
use std::collections::BTreeSet;

/// Clause keywords that end a comma-separated FROM list.
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "FETCH", "UNION", "INTERSECT",
    "EXCEPT", "ON", "USING", "WINDOW", "QUALIFY", "SELECT", "JOIN",
];

/// Keywords whose parenthesis is a call, so FROM inside it is not a table list.
const CALL_KEYWORDS: &[&str] = &["EXTRACT", "SUBSTRING", "TRIM", "CAST", "POSITION", "OVERLAY"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Paren {
    Call,
    Group,
}

struct Frame {
    paren: Paren,
    in_from_list: bool,
}

fn is_identifier(token: &Token<'_>) -> bool {
    match token.kind {
        TokenKind::Word => !is_keyword(&token.text.to_ascii_uppercase()),
        TokenKind::QuotedIdent => true,
        _ => false,
    }
}

/// Returns `(tables, columns)` referenced by an already validated statement.
pub fn collect(
    tokens: &[Token<'_>],
    cte_names: &BTreeSet<String>,
) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut tables = BTreeSet::new();
    let mut columns = BTreeSet::new();
    let mut aliases = BTreeSet::new();

    let mut frames = vec![Frame {
        paren: Paren::Group,
        in_from_list: false,
    }];
    let mut expect_table = false;
    let mut idx = 0;

    while idx < tokens.len() {
        let token = &tokens[idx];
        let prev = idx.checked_sub(1).map(|i| &tokens[i]);
        let next = tokens.get(idx + 1);

        match token.kind {
            TokenKind::LParen => {
                let is_call = prev.map_or(false, |p| match p.kind {
                    TokenKind::Word => {
                        let upper = p.text.to_ascii_uppercase();
                        !is_keyword(&upper) || CALL_KEYWORDS.contains(&upper.as_str())
                    }
                    TokenKind::QuotedIdent => true,
                    _ => false,
                });
                frames.push(Frame {
                    paren: if is_call { Paren::Call } else { Paren::Group },
                    in_from_list: false,
                });
                expect_table = false;
                idx += 1;
                continue;
            }
            TokenKind::RParen => {
                if frames.len() > 1 {
                    frames.pop();
                }
                idx += 1;
                // `(subquery) alias` or `count(*) alias`
                if let Some(alias) = tokens.get(idx).filter(|t| is_identifier(t)) {
                    if let Some(name) = alias.identifier() {
                        aliases.insert(name);
                    }
                    idx += 1;
                }
                continue;
            }
            TokenKind::Comma => {
                if frames.last().map_or(false, |f| f.in_from_list) {
                    expect_table = true;
                }
                idx += 1;
                continue;
            }
            _ => {}
        }

        if let Some(upper) = token.keyword().filter(|k| is_keyword(k)) {
            let in_call = frames.last().map_or(false, |f| f.paren == Paren::Call);
            if upper == "FROM" && !in_call {
                expect_table = true;
                if let Some(frame) = frames.last_mut() {
                    frame.in_from_list = true;
                }
            } else if upper == "JOIN" {
                expect_table = true;
            }
            if CLAUSE_KEYWORDS.contains(&upper.as_str()) {
                if let Some(frame) = frames.last_mut() {
                    frame.in_from_list = false;
                }
            }
            if upper == "AS" {
                if let Some(alias) = next.filter(|t| is_identifier(t)) {
                    if let Some(name) = alias.identifier() {
                        aliases.insert(name);
                    }
                    idx += 2;
                    continue;
                }
            }
            idx += 1;
            continue;
        }

        if !is_identifier(token) {
            idx += 1;
            continue;
        }

        if expect_table {
            expect_table = false;
            let (parts, end) = qualified_name(tokens, idx);
            if tokens.get(end).map_or(false, |t| t.kind == TokenKind::LParen) {
                // table-valued function
                idx = end;
                continue;
            }
            let name = parts.join(".");
            if !(parts.len() == 1 && cte_names.contains(&name)) {
                tables.insert(name);
            }
            idx = end;
            // optional bare alias; `AS alias` is handled by the keyword branch
            if let Some(alias) = tokens.get(idx).filter(|t| is_identifier(t)) {
                if let Some(name) = alias.identifier() {
                    aliases.insert(name);
                }
                idx += 1;
            }
            continue;
        }

        let is_qualifier = next.map_or(false, |t| t.kind == TokenKind::Dot);
        let is_call = next.map_or(false, |t| t.kind == TokenKind::LParen);
        let is_cast_type = prev.map_or(false, |p| p.kind == TokenKind::Operator && p.text == "::");
        if !(is_qualifier || is_call || is_cast_type) {
            if let Some(name) = token.identifier() {
                columns.insert(name);
            }
        }
        idx += 1;
    }

    let columns = columns
        .into_iter()
        .filter(|c| !aliases.contains(c) && !cte_names.contains(c))
        .collect();
    (tables, columns)
}

/// Reads `a.b.c` starting at `start`; returns the parts and the index after it.
fn qualified_name(tokens: &[Token<'_>], start: usize) -> (Vec<String>, usize) {
    let mut parts = Vec::new();
    let mut idx = start;
    while let Some(name) = tokens.get(idx).and_then(|t| t.identifier()) {
        parts.push(name);
        idx += 1;
        let continues = tokens.get(idx).map_or(false, |t| t.kind == TokenKind::Dot)
            && tokens
                .get(idx + 1)
                .map_or(false, |t| matches!(t.kind, TokenKind::Word | TokenKind::QuotedIdent));
        if !continues {
            break;
        }
        idx += 1;
    }
    (parts, idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql_guard::lexer::tokenize;

    fn refs(sql: &str, ctes: &[&str]) -> (Vec<String>, Vec<String>) {
        let tokens = tokenize(sql).unwrap();
        let ctes: BTreeSet<String> = ctes.iter().map(|s| s.to_string()).collect();
        let (tables, columns) = collect(&tokens, &ctes);
        (tables.into_iter().collect(), columns.into_iter().collect())
    }

    #[test]
    fn test_comma_separated_from_list() {
        let (tables, columns) = refs("SELECT a.x, b.y FROM alpha a, public.beta b WHERE a.id = b.id", &[]);
        assert_eq!(tables, vec!["alpha", "public.beta"]);
        assert_eq!(columns, vec!["id", "x", "y"]);
    }

    #[test]
    fn test_extract_from_is_not_a_table() {
        let (tables, columns) = refs("SELECT extract(year FROM started_at) AS y FROM runs", &[]);
        assert_eq!(tables, vec!["runs"]);
        assert_eq!(columns, vec!["started_at"]);
    }

    #[test]
    fn test_quoted_names_keep_case() {
        let (tables, columns) = refs(r#"SELECT "Duration" FROM "TestRuns""#, &[]);
        assert_eq!(tables, vec!["TestRuns"]);
        assert_eq!(columns, vec!["Duration"]);
    }

    #[test]
    fn test_cte_names_are_not_tables() {
        let (tables, _) = refs("WITH r AS (SELECT * FROM runs) SELECT * FROM r", &["r"]);
        assert_eq!(tables, vec!["runs"]);
    }

    #[test]
    fn test_derived_table_alias_and_casts() {
        let (tables, columns) = refs(
            "SELECT sub.total::int FROM (SELECT count(*) total FROM cases) sub",
            &[],
        );
        assert_eq!(tables, vec!["cases"]);
        assert!(columns.is_empty(), "{:?}", columns);
    }
}
