//! Forbidden-token detection and the single-SELECT guard.

use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::ast::Statement;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::warn;

/// Comment markers: never allowed anywhere in generated SQL.
pub const COMMENT_MARKERS: &[&str] = &["--", "/*", "*/"];

/// MySQL line comment. Only a comment outside quoted literals.
pub const HASH_COMMENT: &str = "#";

/// Statements that change data, schema or privileges.
pub const MUTATING_KEYWORDS: &[&str] = &[
    "drop", "truncate", "insert", "update", "delete", "alter", "create", "grant", "revoke",
];

lazy_static! {
    static ref MUTATING_RE: Regex = Regex::new(&format!(
        r"(?i)\b(?:{})\b",
        MUTATING_KEYWORDS.join("|")
    ))
    .unwrap();
    /// A `;` followed by anything but whitespace: a second statement.
    static ref STACKED_RE: Regex = Regex::new(r";\s*\S").unwrap();
}

/// The first forbidden token found in `sql`, if any.
pub fn find_forbidden_token(sql: &str) -> Option<String> {
    if let Some(marker) = COMMENT_MARKERS.iter().find(|m| sql.contains(*m)) {
        return Some(marker.to_string());
    }
    if has_hash_comment(sql) {
        return Some(HASH_COMMENT.to_string());
    }
    if let Some(m) = MUTATING_RE.find(sql) {
        return Some(m.as_str().to_lowercase());
    }
    if STACKED_RE.is_match(sql) {
        return Some(";".to_string());
    }
    None
}

/// True when `sql` has a `#` outside '...', "..." and `...` literals.
fn has_hash_comment(sql: &str) -> bool {
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if matches!(c, '\'' | '"' | '`') => quote = Some(c),
            None if c == '#' => return true,
            None => {}
        }
    }
    false
}

/// True when `sql` is exactly one read-only query.
///
/// Uses the MySQL grammar; when the parser rejects the text the check falls
/// back to "starts with SELECT or WITH" so dialect gaps do not block valid
/// queries. Forbidden tokens are checked separately.
pub fn is_single_select(sql: &str) -> bool {
    let dialect = MySqlDialect {};
    match Parser::parse_sql(&dialect, sql) {
        Ok(statements) => {
            statements.len() == 1 && matches!(statements.first(), Some(Statement::Query(_)))
        }
        Err(e) => {
            warn!("SQL parsing failed: {}, using heuristic fallback", e);
            let lower = sql.trim_start().to_lowercase();
            (lower.starts_with("select") || lower.starts_with("with"))
                && !STACKED_RE.is_match(sql)
        }
    }
}
