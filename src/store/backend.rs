//! Durable storage behind a template store.
//!
//! The store owns all in-memory state; a backend only reads the full mapping
//! at load time and writes after each mutation.

use super::CacheEntry;
use crate::error::{CacheError, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

pub type EntryMap = BTreeMap<String, CacheEntry>;

pub trait TemplateBackend: Send + Sync {
    /// Read every stored entry. A missing store is an empty mapping.
    fn load(&self) -> Result<EntryMap>;

    /// Persist the entry stored under `key`. `all` is the full mapping after
    /// the mutation, for backends that rewrite everything.
    fn upsert(&self, key: &str, entry: &CacheEntry, all: &EntryMap) -> Result<()>;

    /// Overwrite the durable state with `entries`.
    fn replace_all(&self, entries: &EntryMap) -> Result<()>;

    /// Human-readable location for logs.
    fn location(&self) -> String;
}

/// One pretty-printed JSON object per store: `{key: {question_template, sql_template}}`.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, entries: &EntryMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(entries)?;

        // Write-then-rename so a crash never leaves a truncated file behind.
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!("Wrote {} cache entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

impl TemplateBackend for JsonFileBackend {
    fn load(&self) -> Result<EntryMap> {
        if !self.path.exists() {
            return Ok(EntryMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(EntryMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn upsert(&self, _key: &str, _entry: &CacheEntry, all: &EntryMap) -> Result<()> {
        self.write(all)
    }

    fn replace_all(&self, entries: &EntryMap) -> Result<()> {
        self.write(entries)
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Embedded SQLite table, one row per entry.
pub struct SqliteBackend {
    path: PathBuf,
    db: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Connection::open(&path)
            .map_err(|e| CacheError::Store(format!("Failed to open database: {}", e)))?;
        Self::with_connection(path, db)
    }

    /// In-memory database, mostly for tests.
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()
            .map_err(|e| CacheError::Store(format!("Failed to open database: {}", e)))?;
        Self::with_connection(PathBuf::from(":memory:"), db)
    }

    fn with_connection(path: PathBuf, db: Connection) -> Result<Self> {
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS template_cache (
                cache_key TEXT PRIMARY KEY,
                question_template TEXT NOT NULL,
                sql_template TEXT NOT NULL,
                stored_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| CacheError::Store(format!("Failed to create table: {}", e)))?;

        Ok(Self {
            path,
            db: Mutex::new(db),
        })
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| CacheError::Store(format!("Failed to acquire database lock: {}", e)))
    }
}

impl TemplateBackend for SqliteBackend {
    fn load(&self) -> Result<EntryMap> {
        let db = self.connection()?;
        let mut stmt = db.prepare(
            "SELECT cache_key, question_template, sql_template FROM template_cache ORDER BY cache_key",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                CacheEntry {
                    question_template: row.get(1)?,
                    sql_template: row.get(2)?,
                },
            ))
        })?;

        let mut entries = EntryMap::new();
        for row in rows {
            let (key, entry) = row?;
            entries.insert(key, entry);
        }
        Ok(entries)
    }

    fn upsert(&self, key: &str, entry: &CacheEntry, _all: &EntryMap) -> Result<()> {
        let db = self.connection()?;
        db.execute(
            r#"
            INSERT INTO template_cache (cache_key, question_template, sql_template, stored_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(cache_key) DO UPDATE SET
                question_template = excluded.question_template,
                sql_template = excluded.sql_template,
                stored_at = excluded.stored_at
            "#,
            params![
                key,
                entry.question_template,
                entry.sql_template,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| CacheError::Store(format!("Failed to store template: {}", e)))?;
        Ok(())
    }

    fn replace_all(&self, entries: &EntryMap) -> Result<()> {
        let mut db = self.connection()?;
        let tx = db
            .transaction()
            .map_err(|e| CacheError::Store(format!("Failed to start transaction: {}", e)))?;
        tx.execute("DELETE FROM template_cache", [])?;
        let stored_at = Utc::now().to_rfc3339();
        for (key, entry) in entries {
            tx.execute(
                "INSERT INTO template_cache (cache_key, question_template, sql_template, stored_at) VALUES (?1, ?2, ?3, ?4)",
                params![key, entry.question_template, entry.sql_template, stored_at],
            )?;
        }
        tx.commit()
            .map_err(|e| CacheError::Store(format!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }

    fn location(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

/// Keeps nothing; every load is empty.
#[derive(Debug, Default)]
pub struct MemoryBackend;

impl TemplateBackend for MemoryBackend {
    fn load(&self) -> Result<EntryMap> {
        Ok(EntryMap::new())
    }

    fn upsert(&self, _key: &str, _entry: &CacheEntry, _all: &EntryMap) -> Result<()> {
        Ok(())
    }

    fn replace_all(&self, _entries: &EntryMap) -> Result<()> {
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> EntryMap {
        let mut entries = EntryMap::new();
        entries.insert(
            "k1".to_string(),
            CacheEntry {
                question_template: "notes de {matiere} de {family_relation}".to_string(),
                sql_template: "SELECT * FROM note WHERE IdPersonne = {id_personne} AND m = 'é'"
                    .to_string(),
            },
        );
        entries
    }

    #[test]
    fn test_json_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("nested").join("cache.json"));
        assert!(backend.load().unwrap().is_empty());

        let entries = sample();
        backend.replace_all(&entries).unwrap();
        assert_eq!(backend.load().unwrap(), entries);

        let raw = std::fs::read_to_string(backend.path()).unwrap();
        assert!(raw.contains("\"question_template\""));
        assert!(raw.contains('é'));
    }

    #[test]
    fn test_json_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{\"k1\": {\"question_template\": ").unwrap();
        assert!(JsonFileBackend::new(&path).load().is_err());
    }

    #[test]
    fn test_sqlite_upsert_and_load() {
        let backend = SqliteBackend::in_memory().unwrap();
        let entries = sample();
        let entry = entries.get("k1").unwrap();
        backend.upsert("k1", entry, &entries).unwrap();
        backend.upsert("k1", entry, &entries).unwrap();
        assert_eq!(backend.load().unwrap(), entries);

        backend.replace_all(&EntryMap::new()).unwrap();
        assert!(backend.load().unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_file_persists_across_opens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let entries = sample();
        SqliteBackend::open(&path).unwrap().replace_all(&entries).unwrap();
        assert_eq!(SqliteBackend::open(&path).unwrap().load().unwrap(), entries);
    }
}
