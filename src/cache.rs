//! Role-scoped template cache
//!
//! One cache per privilege tier, each with its own store and threshold.
//! This is the surface the request handler talks to:
//! - `lookup` before deciding to call the translator
//! - `record` after a translated query ran successfully
//! - `AccessScope::authorize` right before any execution, hit or miss

use crate::config::{AssistantConfig, BackendKind};
use crate::error::{CacheError, Result};
use crate::extract::{params, ParameterMap};
use crate::rehydrate::{rehydrate, unresolved_placeholders};
use crate::security::{self, AuthorizedIds, Role, Verdict};
use crate::store::{
    parameterize_sql, placeholder_names, CacheEntry, JsonFileBackend, SqliteBackend, StoreStats,
    TemplateBackend, TemplateStore,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

lazy_static! {
    static ref NUMBER_RE: Regex = Regex::new(r"\b\d+\b").unwrap();
}

/// Privilege tier a cache serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Tier {
    /// Administrators: every successful query is cached, no row isolation.
    Unrestricted,
    /// Parents: only queries about their own children, isolated by id.
    Tenant,
}

impl Tier {
    pub fn for_role(role: Role) -> Tier {
        match role {
            Role::SuperAdmin => Tier::Unrestricted,
            Role::Parent => Tier::Tenant,
        }
    }

    pub fn default_threshold(&self) -> f64 {
        match self {
            Tier::Unrestricted => 0.90,
            Tier::Tenant => 0.85,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Unrestricted => write!(f, "admin"),
            Tier::Tenant => write!(f, "parent"),
        }
    }
}

/// What the current request may see. Built fresh for every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessScope {
    Unrestricted,
    Tenant(AuthorizedIds),
}

impl AccessScope {
    pub fn tier(&self) -> Tier {
        match self {
            AccessScope::Unrestricted => Tier::Unrestricted,
            AccessScope::Tenant(_) => Tier::Tenant,
        }
    }

    /// Verdict on `sql` for this scope. Must be allowed before execution.
    pub fn authorize(&self, sql: &str) -> Verdict {
        match self {
            AccessScope::Unrestricted => security::check_unrestricted(sql),
            AccessScope::Tenant(ids) => security::check(sql, ids),
        }
    }

    /// `authorize` as a `Result`, mapping refusals to security errors.
    pub fn ensure_authorized(&self, sql: &str) -> Result<()> {
        match self.authorize(sql) {
            verdict if verdict.is_allowed() => Ok(()),
            Verdict::ForbiddenToken(token) => Err(CacheError::ForbiddenSql(format!(
                "query contains forbidden token '{}'",
                token
            ))),
            verdict => Err(CacheError::AccessDenied(verdict.reason())),
        }
    }

    fn ids(&self) -> AuthorizedIds {
        match self {
            AccessScope::Unrestricted => AuthorizedIds::default(),
            AccessScope::Tenant(ids) => ids.clone(),
        }
    }
}

/// How a hit was found.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum MatchKind {
    Exact,
    Similar { score: f64 },
}

/// Executable SQL produced from a cached template.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub sql: String,
    /// Values of this question that the template used.
    pub variables: ParameterMap,
    pub key: String,
    pub match_kind: MatchKind,
}

/// Why `record` declined to cache a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoFamilyReference,
    NoIdentityPlaceholder,
    FailedValidation(String),
    LeaksIdentifier(u64),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoFamilyReference => write!(f, "question has no family reference"),
            SkipReason::NoIdentityPlaceholder => {
                write!(f, "SQL has no identity filter that can be parameterized")
            }
            SkipReason::FailedValidation(reason) => write!(f, "SQL failed validation: {}", reason),
            SkipReason::LeaksIdentifier(id) => {
                write!(f, "template would still contain identifier {}", id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Stored { key: String },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub tier: Tier,
    pub threshold: f64,
    pub store: StoreStats,
}

pub struct RoleScopedCache {
    tier: Tier,
    threshold: f64,
    store: TemplateStore,
}

impl RoleScopedCache {
    pub fn new(tier: Tier, store: TemplateStore) -> Self {
        Self::with_threshold(tier, store, tier.default_threshold())
    }

    pub fn with_threshold(tier: Tier, store: TemplateStore, threshold: f64) -> Self {
        Self {
            tier,
            threshold,
            store,
        }
    }

    /// Open the store configured for `tier` and load it.
    pub fn from_config(config: &AssistantConfig, tier: Tier) -> Result<Self> {
        let (path, threshold) = match tier {
            Tier::Unrestricted => (&config.admin_cache_path, config.admin_similarity_threshold),
            Tier::Tenant => (&config.parent_cache_path, config.parent_similarity_threshold),
        };
        let backend = open_backend(config.backend, path)?;
        let store = TemplateStore::open(tier.to_string(), backend);
        Ok(Self::with_threshold(tier, store, threshold))
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    /// Find a cached template for `question` and rehydrate it for `scope`.
    ///
    /// Returns `Ok(None)` on a miss, including when the template cannot be
    /// fully resolved for this request. The returned SQL has not been
    /// authorized yet.
    pub fn lookup(&self, question: &str, scope: &AccessScope) -> Result<Option<CacheHit>> {
        self.ensure_scope(scope)?;

        let (extraction, _, key) = self.store.prepare(question);
        let (stored_key, entry, match_kind) = match self.store.get_by_key(&key) {
            Some(stored) => (stored.key, stored.entry, MatchKind::Exact),
            None => match self.store.find_similar(question, self.threshold) {
                Some(similar) => {
                    info!(
                        "[{}] Similar template found (score: {:.2})",
                        self.tier, similar.score
                    );
                    (
                        similar.key,
                        similar.entry,
                        MatchKind::Similar {
                            score: similar.score,
                        },
                    )
                }
                None => {
                    debug!("[{}] Cache miss for: {}", self.tier, question);
                    return Ok(None);
                }
            },
        };

        let sql = rehydrate(&entry.sql_template, &extraction.variables, &scope.ids());
        let unresolved = unresolved_placeholders(&sql);
        if !unresolved.is_empty() {
            warn!(
                "[{}] Template {} needs {:?} which this question does not provide; treating as miss",
                self.tier, stored_key, unresolved
            );
            return Ok(None);
        }

        let used = placeholder_names(&entry.sql_template);
        let variables: ParameterMap = extraction
            .variables
            .into_iter()
            .filter(|(name, _)| used.contains(name) && name != params::ID_PERSONNE)
            .collect();

        Ok(Some(CacheHit {
            sql,
            variables,
            key: stored_key,
            match_kind,
        }))
    }

    /// Cache `(question, sql)` after a successful execution for `scope`.
    ///
    /// The tenant tier only caches questions about the caller's own children
    /// whose SQL carries an identity filter on exactly those children; any
    /// other query is skipped with a logged reason.
    pub fn record(&self, question: &str, sql: &str, scope: &AccessScope) -> Result<RecordOutcome> {
        self.ensure_scope(scope)?;

        let (extraction, normalized, key) = self.store.prepare(question);
        if matches!(scope, AccessScope::Tenant(_)) && !extraction.has_family_marker() {
            return Ok(self.skip(question, SkipReason::NoFamilyReference));
        }

        let verdict = scope.authorize(sql);
        if !verdict.is_allowed() {
            return Ok(self.skip(question, SkipReason::FailedValidation(verdict.reason())));
        }

        let sql_template = parameterize_sql(sql, &extraction.variables);
        if let AccessScope::Tenant(ids) = scope {
            if !placeholder_names(&sql_template).contains(params::ID_PERSONNE) {
                return Ok(self.skip(question, SkipReason::NoIdentityPlaceholder));
            }
            if let Some(id) = leaked_identifier(&sql_template, ids) {
                return Ok(self.skip(question, SkipReason::LeaksIdentifier(id)));
            }
        }

        let stored = self.store.put_entry(
            key,
            CacheEntry {
                question_template: normalized,
                sql_template,
            },
        )?;
        Ok(RecordOutcome::Stored { key: stored.key })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            tier: self.tier,
            threshold: self.threshold,
            store: self.store.stats(),
        }
    }

    fn ensure_scope(&self, scope: &AccessScope) -> Result<()> {
        if scope.tier() != self.tier {
            return Err(CacheError::AccessDenied(format!(
                "{} cache cannot serve a {} request",
                self.tier,
                scope.tier()
            )));
        }
        Ok(())
    }

    fn skip(&self, question: &str, reason: SkipReason) -> RecordOutcome {
        info!("[{}] Not caching '{}': {}", self.tier, question, reason);
        RecordOutcome::Skipped(reason)
    }
}

/// Backend of the given kind at `path`.
pub fn open_backend(kind: BackendKind, path: &Path) -> Result<Box<dyn TemplateBackend>> {
    let backend: Box<dyn TemplateBackend> = match kind {
        BackendKind::Json => Box::new(JsonFileBackend::new(path)),
        BackendKind::Sqlite => Box::new(SqliteBackend::open(path)?),
    };
    Ok(backend)
}

/// An authorized id still present as a literal in a template.
fn leaked_identifier(sql_template: &str, ids: &AuthorizedIds) -> Option<u64> {
    NUMBER_RE
        .find_iter(sql_template)
        .filter_map(|m| m.as_str().parse::<u64>().ok())
        .find(|n| ids.contains(*n))
}
