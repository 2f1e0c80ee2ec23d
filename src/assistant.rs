//! Request orchestration
//!
//! One question from one caller:
//! role -> tier -> fresh authorized ids -> cache lookup -> authorize ->
//! execute, and on a miss translate -> clean -> authorize -> execute -> record.
//! A refused query never produces rows.

use crate::cache::{AccessScope, MatchKind, RecordOutcome, RoleScopedCache, Tier};
use crate::config::AssistantConfig;
use crate::db::{AuthorizedIdResolver, Row, SqlExecutor};
use crate::error::{CacheError, Result};
use crate::llm::{clean_sql, TranslationRequest, Translator};
use crate::security::{CallerIdentity, Role};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Where the executed SQL came from.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerSource {
    Cache(MatchKind),
    /// Fresh translation; `record` is `None` when caching failed.
    Translator { record: Option<RecordOutcome> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub sql: String,
    pub rows: Vec<Row>,
    #[serde(skip)]
    pub source: AnswerSource,
}

impl Answer {
    pub fn from_cache(&self) -> bool {
        matches!(self.source, AnswerSource::Cache(_))
    }
}

pub struct Assistant {
    admin: RoleScopedCache,
    parent: RoleScopedCache,
    translator: Arc<dyn Translator>,
    executor: Arc<dyn SqlExecutor>,
    resolver: Arc<dyn AuthorizedIdResolver>,
    schema_context: String,
    translator_timeout: Duration,
}

impl Assistant {
    pub fn new(
        admin: RoleScopedCache,
        parent: RoleScopedCache,
        translator: Arc<dyn Translator>,
        executor: Arc<dyn SqlExecutor>,
        resolver: Arc<dyn AuthorizedIdResolver>,
    ) -> Result<Self> {
        if admin.tier() != Tier::Unrestricted || parent.tier() != Tier::Tenant {
            return Err(CacheError::Config(
                "Assistant needs an admin cache and a parent cache".to_string(),
            ));
        }
        Ok(Self {
            admin,
            parent,
            translator,
            executor,
            resolver,
            schema_context: String::new(),
            translator_timeout: Duration::from_secs(100),
        })
    }

    /// Open both caches and read the schema context from `config`.
    pub fn from_config(
        config: &AssistantConfig,
        translator: Arc<dyn Translator>,
        executor: Arc<dyn SqlExecutor>,
        resolver: Arc<dyn AuthorizedIdResolver>,
    ) -> Result<Self> {
        config.validate()?;
        let admin = RoleScopedCache::from_config(config, Tier::Unrestricted)?;
        let parent = RoleScopedCache::from_config(config, Tier::Tenant)?;
        Ok(Self::new(admin, parent, translator, executor, resolver)?
            .with_schema_context(config.load_schema_context()?)
            .with_translator_timeout(config.translator_timeout))
    }

    pub fn with_schema_context(mut self, schema_context: impl Into<String>) -> Self {
        self.schema_context = schema_context.into();
        self
    }

    pub fn with_translator_timeout(mut self, translator_timeout: Duration) -> Self {
        self.translator_timeout = translator_timeout;
        self
    }

    pub fn cache(&self, tier: Tier) -> &RoleScopedCache {
        match tier {
            Tier::Unrestricted => &self.admin,
            Tier::Tenant => &self.parent,
        }
    }

    /// Scope of this request, with ids resolved now.
    pub async fn scope_for(&self, caller: &CallerIdentity) -> Result<AccessScope> {
        match caller.role()? {
            Role::SuperAdmin => Ok(AccessScope::Unrestricted),
            Role::Parent => {
                let ids = self.resolver.authorized_ids(caller.user_id).await?;
                if ids.is_empty() {
                    return Err(CacheError::AccessDenied(format!(
                        "no children found for parent {}",
                        caller.user_id
                    )));
                }
                Ok(AccessScope::Tenant(ids))
            }
        }
    }

    /// Answer `question` for `caller`.
    pub async fn ask(&self, question: &str, caller: &CallerIdentity) -> Result<Answer> {
        let scope = self.scope_for(caller).await?;
        let cache = self.cache(scope.tier());

        if let Some(hit) = cache.lookup(question, &scope)? {
            scope.ensure_authorized(&hit.sql)?;
            info!("[{}] Answering from cache ({:?})", cache.tier(), hit.match_kind);
            let rows = self.executor.execute(&hit.sql).await?;
            return Ok(Answer {
                sql: hit.sql,
                rows,
                source: AnswerSource::Cache(hit.match_kind),
            });
        }

        let sql = self.translate(question, &scope).await?;
        scope.ensure_authorized(&sql)?;
        let rows = self.executor.execute(&sql).await?;

        let record = match cache.record(question, &sql, &scope) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("[{}] Could not cache query: {}", cache.tier(), e);
                None
            }
        };

        Ok(Answer {
            sql,
            rows,
            source: AnswerSource::Translator { record },
        })
    }

    /// One bounded translator call; a timeout or empty answer is an error.
    async fn translate(&self, question: &str, scope: &AccessScope) -> Result<String> {
        let request = match scope {
            AccessScope::Unrestricted => {
                TranslationRequest::unrestricted(question, self.schema_context.as_str())
            }
            AccessScope::Tenant(ids) => {
                TranslationRequest::restricted(question, self.schema_context.as_str(), ids.clone())
            }
        };

        let raw = timeout(self.translator_timeout, self.translator.translate(&request))
            .await
            .map_err(|_| {
                CacheError::Translator(format!(
                    "no answer within {}s",
                    self.translator_timeout.as_secs()
                ))
            })??;

        let sql = clean_sql(&raw);
        if sql.is_empty() {
            return Err(CacheError::Translator("generated query is empty".to_string()));
        }
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::AuthorizedIds;
    use crate::store::{MemoryBackend, TemplateStore};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedTranslator(Mutex<Vec<String>>);

    #[async_trait]
    impl Translator for ScriptedTranslator {
        async fn translate(&self, _request: &TranslationRequest) -> Result<String> {
            self.0
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| CacheError::Llm("no scripted answer left".to_string()))
        }
    }

    struct EchoExecutor;

    #[async_trait]
    impl SqlExecutor for EchoExecutor {
        async fn execute(&self, sql: &str) -> Result<Vec<Row>> {
            let mut row = Row::new();
            row.insert("sql".to_string(), serde_json::Value::from(sql));
            Ok(vec![row])
        }
    }

    struct OneChild;

    #[async_trait]
    impl AuthorizedIdResolver for OneChild {
        async fn authorized_ids(&self, user_id: u64) -> Result<AuthorizedIds> {
            Ok(AuthorizedIds::new([user_id + 7000]))
        }
    }

    fn assistant(answers: &[&str]) -> Assistant {
        let scripted = answers.iter().rev().map(|s| s.to_string()).collect();
        Assistant::new(
            RoleScopedCache::new(Tier::Unrestricted, TemplateStore::open("admin", Box::new(MemoryBackend))),
            RoleScopedCache::new(Tier::Tenant, TemplateStore::open("parent", Box::new(MemoryBackend))),
            Arc::new(ScriptedTranslator(Mutex::new(scripted))),
            Arc::new(EchoExecutor),
            Arc::new(OneChild),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_role_is_refused() {
        let a = assistant(&[]);
        let caller = CallerIdentity::new(1, vec!["ROLE_TEACHER".to_string()]);
        assert!(matches!(
            a.ask("absences de mon fils", &caller).await,
            Err(CacheError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let a = assistant(&["```sql\nSELECT * FROM absence WHERE IdPersonne = 7012;\n```"]);
        let caller = CallerIdentity::parent(12);

        let first = a.ask("absences de mon fils", &caller).await.unwrap();
        assert!(!first.from_cache());
        assert_eq!(first.sql, "SELECT * FROM absence WHERE IdPersonne = 7012");

        let second = a.ask("absences de ma fille", &caller).await.unwrap();
        assert!(second.from_cache());
        assert_eq!(second.sql, "SELECT * FROM absence WHERE IdPersonne = 7012");
    }

    #[tokio::test]
    async fn test_unscoped_translation_is_denied() {
        let a = assistant(&["SELECT * FROM absence"]);
        let err = a
            .ask("absences de mon fils", &CallerIdentity::parent(12))
            .await
            .unwrap_err();
        assert!(err.is_security_rejection());
        assert!(a.cache(Tier::Tenant).store().is_empty());
    }

    #[tokio::test]
    async fn test_empty_translation_is_an_error() {
        let a = assistant(&["```sql\n```"]);
        assert!(matches!(
            a.ask("combien d'élèves", &CallerIdentity::super_admin(1)).await,
            Err(CacheError::Translator(_))
        ));
    }
}
