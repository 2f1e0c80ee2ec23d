//! Tenant-scoped cache of natural-language to SQL translations for a school
//! management database, with static access control on every query that runs.

pub mod assistant;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod llm;
pub mod normalize;
pub mod rehydrate;
pub mod security;
pub mod similarity;
pub mod store;
pub mod telemetry;

pub use assistant::{Answer, AnswerSource, Assistant};
pub use cache::{
    AccessScope, CacheHit, CacheStats, MatchKind, RecordOutcome, RoleScopedCache, SkipReason, Tier,
};
pub use config::{AssistantConfig, BackendKind};
pub use error::{CacheError, Result};
pub use extract::{Extraction, ParameterExtractor, ParameterMap};
pub use normalize::{normalize, template_key};
pub use rehydrate::rehydrate;
pub use security::{validate, AuthorizedIds, CallerIdentity, Role, Verdict};
pub use store::{CacheEntry, TemplateStore};
