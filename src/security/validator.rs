//! Access Validator
//!
//! Static check of the SQL text about to run for a restricted caller. It
//! looks for a recognized isolation filter on the caller's ids, refuses any
//! identity literal outside those ids, and refuses forbidden tokens. It is a
//! pure function of its inputs and fails closed.
//!
//! Unrestricted callers skip the isolation filter but still need a single
//! read-only statement free of forbidden tokens.

use super::guards::{find_forbidden_token, is_single_select};
use super::shapes::{find_isolation_shape, IsolationShape};
use super::AuthorizedIds;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, error, warn};

lazy_static! {
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
    static ref IDENTITY_EQ_RE: Regex =
        Regex::new(r"\b(?:\w+\.)?(?:idpersonne|id_personne)\s*=\s*'?(\d+)'?").unwrap();
    static ref IDENTITY_IN_RE: Regex =
        Regex::new(r"\b(?:\w+\.)?(?:idpersonne|id_personne)\s+in\s*\(\s*('?\d+'?(?:\s*,\s*'?\d+'?)*)\s*\)")
            .unwrap();
}

/// Why a query was accepted or refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed(IsolationShape),
    /// Accepted for an unrestricted caller.
    Unrestricted,
    NoAuthorizedIds,
    NotSingleSelect,
    ForbiddenToken(String),
    MissingIsolationFilter,
    ForeignIdentity(u64),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed(_) | Verdict::Unrestricted)
    }

    pub fn reason(&self) -> String {
        match self {
            Verdict::Allowed(shape) => format!("isolation filter {:?} present", shape),
            Verdict::Unrestricted => "read-only query".to_string(),
            Verdict::NoAuthorizedIds => "caller has no authorized ids".to_string(),
            Verdict::NotSingleSelect => "only a single SELECT statement is allowed".to_string(),
            Verdict::ForbiddenToken(token) => format!("forbidden token '{}'", token),
            Verdict::MissingIsolationFilter => {
                "no isolation filter on the caller's ids".to_string()
            }
            Verdict::ForeignIdentity(id) => format!("query references unauthorized id {}", id),
        }
    }
}

/// Lowercase and collapse whitespace runs to single spaces.
pub fn normalize_sql(sql: &str) -> String {
    WHITESPACE_RE
        .replace_all(sql.trim(), " ")
        .to_lowercase()
}

/// `true` only when the SQL is safe to run for `ids`.
pub fn validate(sql: &str, ids: &AuthorizedIds) -> bool {
    check(sql, ids).is_allowed()
}

/// Full verdict for `sql` against `ids`.
pub fn check(sql: &str, ids: &AuthorizedIds) -> Verdict {
    if ids.is_empty() {
        warn!("Refusing query: caller has no authorized ids");
        return Verdict::NoAuthorizedIds;
    }

    let normalized = normalize_sql(sql);
    debug!("Validating SQL for {}: {}", ids, normalized);

    if let Some(token) = find_forbidden_token(&normalized) {
        error!("Rejected query containing forbidden token '{}': {}", token, sql);
        return Verdict::ForbiddenToken(token);
    }

    if let Some(id) = foreign_identity(&normalized, ids) {
        warn!("Rejected query filtering on unauthorized id {}", id);
        return Verdict::ForeignIdentity(id);
    }

    match find_isolation_shape(&normalized, ids) {
        Some(shape) => Verdict::Allowed(shape),
        None => {
            warn!("Rejected query without a filter on the caller's ids: {}", sql);
            Verdict::MissingIsolationFilter
        }
    }
}

/// Verdict for an unrestricted caller: forbidden tokens, then single SELECT.
pub fn check_unrestricted(sql: &str) -> Verdict {
    let normalized = normalize_sql(sql);
    if let Some(token) = find_forbidden_token(&normalized) {
        error!("Rejected admin query containing forbidden token '{}': {}", token, sql);
        return Verdict::ForbiddenToken(token);
    }
    if !is_single_select(sql) {
        error!("Rejected admin query: only SELECT statements are allowed: {}", sql);
        return Verdict::NotSingleSelect;
    }
    Verdict::Unrestricted
}

/// First literal identity value in an identity filter that is not authorized.
fn foreign_identity(normalized_sql: &str, ids: &AuthorizedIds) -> Option<u64> {
    let equality = IDENTITY_EQ_RE
        .captures_iter(normalized_sql)
        .filter_map(|caps| caps[1].parse::<u64>().ok());
    let lists = IDENTITY_IN_RE.captures_iter(normalized_sql).flat_map(|caps| {
        caps[1]
            .split(',')
            .filter_map(|part| part.trim().trim_matches('\'').parse::<u64>().ok())
            .collect::<Vec<_>>()
    });
    equality.chain(lists).find(|id| !ids.contains(*id))
}
