//! sqlx-backed MySQL adapters.

use super::{AuthorizedIdResolver, DbPool, Row, SqlExecutor};
use crate::error::{CacheError, Result};
use crate::security::AuthorizedIds;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use sqlx::mysql::MySqlRow;
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use tracing::{error, info};

/// Children of a parent account: personne -> parent -> parenteleve -> eleve -> personne.
const GUARDIAN_QUERY: &str = r#"
    SELECT DISTINCT CAST(pe.id AS SIGNED) AS id_enfant
    FROM personne p
    JOIN parent pa ON p.id = pa.Personne
    JOIN parenteleve pev ON pa.id = pev.Parent
    JOIN eleve e ON pev.Eleve = e.id
    JOIN personne pe ON e.IdPersonne = pe.id
    WHERE p.id = ?
    ORDER BY id_enfant
"#;

pub struct MySqlExecutor {
    pool: DbPool,
}

impl MySqlExecutor {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SqlExecutor for MySqlExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>> {
        info!("Executing SQL:\n{}", sql);
        let rows = sqlx::query(sql).fetch_all(&self.pool).await.map_err(|e| {
            error!("SQL execution failed: {}", e);
            CacheError::Database(format!("SQL execution failed: {}", e))
        })?;
        info!("{} row(s) returned", rows.len());
        rows.iter().map(row_to_json).collect()
    }
}

pub struct MySqlGuardianResolver {
    pool: DbPool,
}

impl MySqlGuardianResolver {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuthorizedIdResolver for MySqlGuardianResolver {
    async fn authorized_ids(&self, user_id: u64) -> Result<AuthorizedIds> {
        let rows: Vec<(i64,)> = sqlx::query_as(GUARDIAN_QUERY)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        let ids = AuthorizedIds::new(
            rows.into_iter()
                .filter_map(|(id,)| u64::try_from(id).ok()),
        );
        info!("Found {} children for parent {}", ids.len(), user_id);
        Ok(ids)
    }
}

fn row_to_json(row: &MySqlRow) -> Result<Row> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = column.type_info().name().to_uppercase();
            column_value(row, i, &type_name)?
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn column_value(row: &MySqlRow, i: usize, type_name: &str) -> Result<Value> {
    let value = match type_name {
        "BOOLEAN" => Value::from(row.try_get::<bool, _>(i)?),
        t if t.ends_with("UNSIGNED") => Value::from(row.try_get::<u64, _>(i)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            Value::from(row.try_get::<i64, _>(i)?)
        }
        "FLOAT" | "DOUBLE" => Value::from(row.try_get::<f64, _>(i)?),
        "DATE" => Value::from(row.try_get::<NaiveDate, _>(i)?.to_string()),
        "DATETIME" | "TIMESTAMP" => {
            Value::from(row.try_get::<NaiveDateTime, _>(i)?.to_string())
        }
        "TIME" => Value::from(row.try_get::<NaiveTime, _>(i)?.to_string()),
        "JSON" => row.try_get::<Value, _>(i)?,
        // DECIMAL and the text types arrive as strings on the wire.
        _ => match row.try_get_unchecked::<String, _>(i) {
            Ok(s) => Value::from(s),
            Err(_) => Value::from(String::from_utf8_lossy(&row.try_get_unchecked::<Vec<u8>, _>(i)?).into_owned()),
        },
    };
    Ok(value)
}
