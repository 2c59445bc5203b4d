//! Read-only classification of candidate SQL

use super::lexer::{self, Token, TokenKind};
use super::references;
use super::{ClassificationResult, SafeStatement, UnsafeReason};
use std::collections::BTreeSet;
use tracing::debug;

/// Data manipulation verbs
const MUTATING_VERBS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT"];

/// Schema definition verbs
const DDL_VERBS: &[&str] = &["CREATE", "ALTER", "DROP", "TRUNCATE", "RENAME"];

/// Privilege, procedural, session and maintenance verbs
const DISALLOWED_VERBS: &[&str] = &[
    "GRANT", "REVOKE", "EXEC", "EXECUTE", "CALL", "ATTACH", "DETACH", "PRAGMA", "VACUUM",
    "REINDEX", "COPY", "LOAD", "SET", "RESET", "LOCK", "BEGIN", "COMMIT", "ROLLBACK",
    "SAVEPOINT", "RELEASE",
];

/// Functions with side effects outside the result set
const SIDE_EFFECT_FUNCTIONS: &[&str] = &[
    "pg_sleep", "sleep", "benchmark", "load_extension", "pg_read_file", "pg_read_binary_file",
    "pg_ls_dir", "lo_import", "lo_export", "dblink", "dblink_exec", "xp_cmdshell", "nextval",
    "setval", "set_config", "pg_terminate_backend", "pg_cancel_backend", "load_file",
    "writefile", "readfile",
];

const SET_OPERATORS: &[&str] = &["UNION", "INTERSECT", "EXCEPT", "MINUS"];

/// Classify a candidate statement. Never panics; malformed input is refused.
pub fn classify(sql: &str) -> ClassificationResult {
    match analyze(sql) {
        Ok(statement) => {
            debug!(
                "SQL gate accepted statement referencing tables {:?}",
                statement.referenced_tables()
            );
            ClassificationResult::Safe(statement)
        }
        Err(reason) => {
            debug!("SQL gate refused statement: {}", reason);
            ClassificationResult::Unsafe { reason }
        }
    }
}

fn analyze(sql: &str) -> Result<SafeStatement, UnsafeReason> {
    let mut tokens = lexer::tokenize(sql).map_err(|e| {
        debug!("SQL lexing failed: {}", e);
        UnsafeReason::UnparseableSyntax
    })?;

    while tokens.last().map_or(false, |t| t.kind == TokenKind::Semicolon) {
        tokens.pop();
    }
    if tokens.is_empty() {
        return Err(UnsafeReason::UnparseableSyntax);
    }
    if tokens.iter().any(|t| t.kind == TokenKind::Semicolon) {
        return Err(UnsafeReason::MultiStatement);
    }

    check_balanced(&tokens)?;
    scan_verbs(&tokens)?;
    scan_constructs(&tokens)?;

    let mut cte_names = BTreeSet::new();
    check_query(&tokens, &mut cte_names)?;
    check_set_operators(&tokens)?;

    let (tables, columns) = references::collect(&tokens, &cte_names);
    Ok(SafeStatement::new(lexer::render(&tokens), tables, columns))
}

fn check_balanced(tokens: &[Token<'_>]) -> Result<(), UnsafeReason> {
    let mut depth = 0usize;
    for token in tokens {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth = depth
                    .checked_sub(1)
                    .ok_or(UnsafeReason::UnparseableSyntax)?;
            }
            _ => {}
        }
    }
    if depth == 0 {
        Ok(())
    } else {
        Err(UnsafeReason::UnparseableSyntax)
    }
}

/// Rejects any disallowed verb at any nesting depth.
fn scan_verbs(tokens: &[Token<'_>]) -> Result<(), UnsafeReason> {
    for (idx, token) in tokens.iter().enumerate() {
        let Some(word) = token.keyword() else {
            continue;
        };
        let word = word.as_str();
        let prev = idx.checked_sub(1).and_then(|i| tokens[i].keyword());
        let next = tokens.get(idx + 1);

        if word == "UPDATE" && matches!(prev.as_deref(), Some("FOR") | Some("KEY")) {
            return Err(UnsafeReason::DisallowedConstruct);
        }
        if word == "REPLACE" {
            if next.map_or(false, |t| t.kind == TokenKind::LParen) {
                continue;
            }
            return Err(UnsafeReason::MutatingVerb);
        }
        if MUTATING_VERBS.contains(&word) {
            return Err(UnsafeReason::MutatingVerb);
        }
        if DDL_VERBS.contains(&word) {
            return Err(UnsafeReason::DdlVerb);
        }
        if DISALLOWED_VERBS.contains(&word) {
            return Err(UnsafeReason::DisallowedConstruct);
        }
    }
    Ok(())
}

/// Rejects `SELECT ... INTO`, row locking and side-effecting function calls.
fn scan_constructs(tokens: &[Token<'_>]) -> Result<(), UnsafeReason> {
    for (idx, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Word {
            continue;
        }
        if token.is_keyword("INTO") {
            return Err(UnsafeReason::DisallowedConstruct);
        }
        if token.is_keyword("FOR")
            && tokens
                .get(idx + 1)
                .map_or(false, |t| t.is_keyword("SHARE") || t.is_keyword("NO"))
        {
            return Err(UnsafeReason::DisallowedConstruct);
        }
        let is_call = tokens
            .get(idx + 1)
            .map_or(false, |t| t.kind == TokenKind::LParen);
        if is_call && SIDE_EFFECT_FUNCTIONS.contains(&token.text.to_lowercase().as_str()) {
            return Err(UnsafeReason::DisallowedConstruct);
        }
    }
    Ok(())
}

/// Index of the parenthesis closing the one at `open`.
fn matching_paren(tokens: &[Token<'_>], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// A query must start (after optional parentheses) with SELECT, or with a
/// WITH chain whose bodies and main statement satisfy the same rule.
fn check_query(tokens: &[Token<'_>], cte_names: &mut BTreeSet<String>) -> Result<(), UnsafeReason> {
    let start = tokens
        .iter()
        .position(|t| t.kind != TokenKind::LParen)
        .ok_or(UnsafeReason::UnparseableSyntax)?;
    let lead = &tokens[start];

    match lead.keyword().as_deref() {
        Some("SELECT") => Ok(()),
        Some("WITH") => check_with_chain(&tokens[start + 1..], cte_names),
        Some(_) => Err(UnsafeReason::DisallowedConstruct),
        None => Err(UnsafeReason::UnparseableSyntax),
    }
}

fn check_with_chain(
    tokens: &[Token<'_>],
    cte_names: &mut BTreeSet<String>,
) -> Result<(), UnsafeReason> {
    let mut pos = 0;
    if tokens.first().map_or(false, |t| t.is_keyword("RECURSIVE")) {
        pos += 1;
    }

    loop {
        let name = tokens.get(pos).ok_or(UnsafeReason::UnparseableSyntax)?;
        let is_name = match name.kind {
            TokenKind::Word => !lexer::is_keyword(&name.text.to_ascii_uppercase()),
            TokenKind::QuotedIdent => true,
            _ => false,
        };
        if !is_name {
            return Err(UnsafeReason::UnparseableSyntax);
        }
        if let Some(ident) = name.identifier() {
            cte_names.insert(ident);
        }
        pos += 1;

        if tokens.get(pos).map_or(false, |t| t.kind == TokenKind::LParen) {
            pos = matching_paren(tokens, pos).ok_or(UnsafeReason::UnparseableSyntax)? + 1;
        }
        if !tokens.get(pos).map_or(false, |t| t.is_keyword("AS")) {
            return Err(UnsafeReason::UnparseableSyntax);
        }
        pos += 1;
        if tokens.get(pos).map_or(false, |t| t.is_keyword("NOT")) {
            pos += 1;
        }
        if tokens.get(pos).map_or(false, |t| t.is_keyword("MATERIALIZED")) {
            pos += 1;
        }
        if !tokens.get(pos).map_or(false, |t| t.kind == TokenKind::LParen) {
            return Err(UnsafeReason::UnparseableSyntax);
        }
        let close = matching_paren(tokens, pos).ok_or(UnsafeReason::UnparseableSyntax)?;
        let body = &tokens[pos + 1..close];
        if body.is_empty() {
            return Err(UnsafeReason::UnparseableSyntax);
        }
        check_query(body, cte_names)?;
        pos = close + 1;

        if tokens.get(pos).map_or(false, |t| t.kind == TokenKind::Comma) {
            pos += 1;
            continue;
        }
        break;
    }

    let main = &tokens[pos.min(tokens.len())..];
    if main.is_empty() {
        return Err(UnsafeReason::UnparseableSyntax);
    }
    check_query(main, cte_names)
}

/// Every set operator must combine with another SELECT.
fn check_set_operators(tokens: &[Token<'_>]) -> Result<(), UnsafeReason> {
    for (idx, token) in tokens.iter().enumerate() {
        let Some(word) = token.keyword() else {
            continue;
        };
        if !SET_OPERATORS.contains(&word.as_str()) {
            continue;
        }
        let mut next = idx + 1;
        if tokens
            .get(next)
            .map_or(false, |t| t.is_keyword("ALL") || t.is_keyword("DISTINCT"))
        {
            next += 1;
        }
        let follows_select = tokens.get(next).map_or(false, |t| {
            t.is_keyword("SELECT") || t.kind == TokenKind::LParen
        });
        if !follows_select {
            return Err(UnsafeReason::DisallowedConstruct);
        }
    }
    Ok(())
}
