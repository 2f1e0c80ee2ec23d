//! Database collaborators: running checked SQL and resolving who a caller
//! may see.

pub mod connection;
pub mod mysql;

pub use connection::{init_pool, DbPool};
pub use mysql::{MySqlExecutor, MySqlGuardianResolver};

use crate::error::Result;
use crate::security::AuthorizedIds;
use async_trait::async_trait;

/// One result row, column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Runs SQL that already passed the access validator.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>>;
}

/// Resolves the row identities a caller may read.
///
/// Called on every request; implementations must not cache across requests.
#[async_trait]
pub trait AuthorizedIdResolver: Send + Sync {
    async fn authorized_ids(&self, user_id: u64) -> Result<AuthorizedIds>;
}
