//! Template Store
//!
//! Durable mapping from the hash of a normalized question template to its
//! cached entry. The store is the single owner of its entries and of the
//! similarity index derived from them: every mutation, the synchronous write
//! to the backend and the index rebuild happen under one write lock, so a
//! reader never sees an index that lags behind the entries.

pub mod backend;
pub mod migrate;
pub mod sql_template;

pub use backend::{EntryMap, JsonFileBackend, MemoryBackend, SqliteBackend, TemplateBackend};
pub use migrate::{canonicalize_braces, MigrationReport};
pub use sql_template::{parameterize_identity, parameterize_sql, placeholder_names};

use crate::error::{CacheError, Result};
use crate::extract::{Extraction, ParameterExtractor};
use crate::normalize::{collapse_whitespace, key_of_normalized, normalize_with};
use crate::similarity::TfIdfIndex;
use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub question_template: String,
    pub sql_template: String,
}

/// A stored entry together with its key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTemplate {
    pub key: String,
    pub entry: CacheEntry,
}

/// Result of a similarity lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarTemplate {
    pub key: String,
    pub entry: CacheEntry,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub vocabulary: usize,
    pub location: String,
}

struct StoreState {
    entries: EntryMap,
    index: TfIdfIndex,
}

impl StoreState {
    fn rebuild_index(&mut self) {
        self.index = TfIdfIndex::rebuild(
            self.entries
                .iter()
                .map(|(key, entry)| (key.as_str(), entry.question_template.as_str())),
        );
    }
}

pub struct TemplateStore {
    name: String,
    backend: Box<dyn TemplateBackend>,
    extractor: ParameterExtractor,
    state: RwLock<StoreState>,
}

impl TemplateStore {
    /// Open a store and load its entries. Never fails: an unreadable backend
    /// is logged and the store starts empty.
    pub fn open(name: impl Into<String>, backend: Box<dyn TemplateBackend>) -> Self {
        let store = Self {
            name: name.into(),
            backend,
            extractor: ParameterExtractor::new(),
            state: RwLock::new(StoreState {
                entries: EntryMap::new(),
                index: TfIdfIndex::new(),
            }),
        };
        store.load();
        store
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reload everything from the backend, replacing the in-memory state.
    ///
    /// Legacy entries are migrated and written back once. The write lock is
    /// held from the backend read to the index rebuild, so no `put` can land
    /// in between. Returns the number of entries now held.
    pub fn load(&self) -> usize {
        let mut state = match self.write_state() {
            Ok(state) => state,
            Err(e) => {
                warn!("[{}] {}", self.name, e);
                return 0;
            }
        };

        let loaded = match self.backend.load() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "[{}] Could not load template cache from {}: {}. Starting empty.",
                    self.name,
                    self.backend.location(),
                    e
                );
                EntryMap::new()
            }
        };

        let (entries, report) = migrate::migrate_entries(loaded);
        if report.changed() {
            info!(
                "[{}] Migrated cache: {} placeholder rewrites, {} re-keyed, {} duplicates dropped",
                self.name, report.braces_rewritten, report.rekeyed, report.dropped_duplicates
            );
            if let Err(e) = self.backend.replace_all(&entries) {
                warn!("[{}] Could not persist migrated cache: {}", self.name, e);
            }
        }

        state.entries = entries;
        state.rebuild_index();
        let count = state.entries.len();

        info!(
            "[{}] Loaded {} cached templates from {}",
            self.name,
            count,
            self.backend.location()
        );
        count
    }

    /// Extract, normalize and key a question.
    pub fn prepare(&self, question: &str) -> (Extraction, String, String) {
        let extraction = self.extractor.extract(&collapse_whitespace(question));
        let normalized = normalize_with(&self.extractor, question);
        let key = key_of_normalized(&normalized);
        (extraction, normalized, key)
    }

    /// Store the template of `(question, sql)` and persist it.
    ///
    /// The entry, the durable write and the index rebuild are one critical
    /// section. If the write fails the in-memory entry is rolled back.
    pub fn put(&self, question: &str, sql: &str) -> Result<StoredTemplate> {
        let (extraction, normalized, key) = self.prepare(question);
        let entry = CacheEntry {
            question_template: normalized,
            sql_template: parameterize_sql(sql, &extraction.variables),
        };
        self.put_entry(key, entry)
    }

    /// Store a pre-built entry under `key`.
    pub fn put_entry(&self, key: String, entry: CacheEntry) -> Result<StoredTemplate> {
        let mut state = self.write_state()?;

        let previous = state.entries.insert(key.clone(), entry.clone());
        if let Err(e) = self.backend.upsert(&key, &entry, &state.entries) {
            match previous {
                Some(previous) => state.entries.insert(key.clone(), previous),
                None => state.entries.remove(&key),
            };
            return Err(CacheError::Store(format!(
                "Failed to persist template {} to {}: {}",
                key,
                self.backend.location(),
                e
            )));
        }
        state.rebuild_index();

        info!(
            "[{}] Cached template {} ({} entries)",
            self.name,
            key,
            state.entries.len()
        );
        Ok(StoredTemplate { key, entry })
    }

    /// Exact lookup by normalized-template hash.
    pub fn get_exact(&self, question: &str) -> Option<StoredTemplate> {
        let normalized = normalize_with(&self.extractor, question);
        self.get_by_key(&key_of_normalized(&normalized))
    }

    pub fn get_by_key(&self, key: &str) -> Option<StoredTemplate> {
        let state = self.read_state();
        state.entries.get(key).map(|entry| StoredTemplate {
            key: key.to_string(),
            entry: entry.clone(),
        })
    }

    /// Nearest stored template at or above `threshold`.
    pub fn find_similar(&self, question: &str, threshold: f64) -> Option<SimilarTemplate> {
        let normalized = normalize_with(&self.extractor, question);
        let state = self.read_state();
        let nearest = state.index.nearest(&normalized, threshold)?;
        let entry = state.entries.get(&nearest.key)?.clone();
        Some(SimilarTemplate {
            key: nearest.key,
            entry,
            score: nearest.score,
        })
    }

    pub fn len(&self) -> usize {
        self.read_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry, in key order.
    pub fn entries(&self) -> Vec<StoredTemplate> {
        self.read_state()
            .entries
            .iter()
            .map(|(key, entry)| StoredTemplate {
                key: key.clone(),
                entry: entry.clone(),
            })
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.read_state();
        let (entries, vocabulary) = (state.entries.len(), state.index.vocabulary_size());
        StoreStats {
            entries,
            vocabulary,
            location: self.backend.location(),
        }
    }

    /// Readers recover a poisoned lock instead of reporting a miss.
    fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|e| {
            warn!("[{}] Recovering poisoned template store lock", self.name);
            e.into_inner()
        })
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|e| CacheError::Store(format!("Failed to acquire write lock: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::{channel, Sender};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    const SCENARIO_SQL: &str = "SELECT n.dc1 FROM noteeval n JOIN eleve e ON n.IdEleve = e.id \
                                JOIN matiere m ON n.IdMatiere = m.id \
                                WHERE e.IdPersonne IN (7012) AND m.NomMatiereFr = 'Maths'";

    struct FlakyBackend {
        fail: Arc<AtomicBool>,
    }

    impl TemplateBackend for FlakyBackend {
        fn load(&self) -> Result<EntryMap> {
            Ok(EntryMap::new())
        }
        fn upsert(&self, _key: &str, _entry: &CacheEntry, _all: &EntryMap) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                Err(CacheError::Store("disk full".to_string()))
            } else {
                Ok(())
            }
        }
        fn replace_all(&self, _entries: &EntryMap) -> Result<()> {
            Ok(())
        }
        fn location(&self) -> String {
            "flaky".to_string()
        }
    }

    /// Serves a legacy file; once armed, a reload signals and stalls while reading.
    struct SlowLegacyBackend {
        armed: AtomicBool,
        reading: Mutex<Option<Sender<()>>>,
        persisted: Mutex<EntryMap>,
    }

    impl TemplateBackend for SlowLegacyBackend {
        fn load(&self) -> Result<EntryMap> {
            if self.armed.load(Ordering::SeqCst) {
                if let Some(tx) = self.reading.lock().unwrap().take() {
                    tx.send(()).unwrap();
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            let mut legacy = EntryMap::new();
            legacy.insert(
                "5d41402abc4b2a76b9719d911017c592".to_string(),
                CacheEntry {
                    question_template: "absences de {{family_relation}}".to_string(),
                    sql_template: "SELECT * FROM absence WHERE IdPersonne = {{id_personne}}"
                        .to_string(),
                },
            );
            Ok(legacy)
        }
        fn upsert(&self, _key: &str, _entry: &CacheEntry, all: &EntryMap) -> Result<()> {
            *self.persisted.lock().unwrap() = all.clone();
            Ok(())
        }
        fn replace_all(&self, entries: &EntryMap) -> Result<()> {
            *self.persisted.lock().unwrap() = entries.clone();
            Ok(())
        }
        fn location(&self) -> String {
            "slow".to_string()
        }
    }

    #[test]
    fn test_put_during_reload_is_kept() {
        let (tx, rx) = channel();
        let backend = Arc::new(SlowLegacyBackend {
            armed: AtomicBool::new(false),
            reading: Mutex::new(Some(tx)),
            persisted: Mutex::new(EntryMap::new()),
        });

        struct Shared(Arc<SlowLegacyBackend>);
        impl TemplateBackend for Shared {
            fn load(&self) -> Result<EntryMap> {
                self.0.load()
            }
            fn upsert(&self, key: &str, entry: &CacheEntry, all: &EntryMap) -> Result<()> {
                self.0.upsert(key, entry, all)
            }
            fn replace_all(&self, entries: &EntryMap) -> Result<()> {
                self.0.replace_all(entries)
            }
            fn location(&self) -> String {
                self.0.location()
            }
        }

        let store = TemplateStore::open("test", Box::new(Shared(backend.clone())));
        backend.armed.store(true, Ordering::SeqCst);

        std::thread::scope(|scope| {
            let reload = scope.spawn(|| store.load());
            rx.recv().unwrap();
            store
                .put("notes de maths de mon fils", "SELECT * FROM note WHERE IdPersonne = 7012")
                .unwrap();
            assert_eq!(reload.join().unwrap(), 1);
        });

        assert_eq!(store.len(), 2);
        assert!(store.get_exact("notes de maths de ma fille").is_some());
        assert_eq!(backend.persisted.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_reads_survive_a_poisoned_lock() {
        let store = TemplateStore::open("test", Box::new(MemoryBackend));
        store
            .put("absences de mon fils", "SELECT * FROM absence WHERE IdPersonne = 7012")
            .unwrap();

        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = store.state.write().unwrap();
            panic!("writer died");
        }));
        assert!(store.state.is_poisoned());

        assert_eq!(store.len(), 1);
        assert!(store.get_exact("absences de ma fille").is_some());
        assert!(store.find_similar("les absences de ma fille", 0.5).is_some());
        assert_eq!(store.stats().entries, 1);
    }

    #[test]
    fn test_put_and_get_exact() {
        let store = TemplateStore::open("test", Box::new(MemoryBackend));
        let stored = store
            .put("devoir de contrôle de maths de mon fils", SCENARIO_SQL)
            .unwrap();
        assert_eq!(
            stored.entry.question_template,
            "{type_evaluation} de {matiere} de {family_relation}"
        );
        assert!(stored.entry.sql_template.contains("e.IdPersonne IN ({id_personne})"));
        assert!(stored.entry.sql_template.contains("'{matiere}'"));

        let hit = store.get_exact("Devoir de controle de physique de ma fille").unwrap();
        assert_eq!(hit.key, stored.key);
        assert!(store.get_exact("emploi du temps de ma fille").is_none());
    }

    #[test]
    fn test_find_similar_respects_threshold() {
        let store = TemplateStore::open("test", Box::new(MemoryBackend));
        assert!(store.find_similar("notes de maths de mon fils", 0.0).is_none());

        store
            .put(
                "quelles sont les notes de maths de mon fils",
                "SELECT * FROM note WHERE IdPersonne = 7012",
            )
            .unwrap();
        store
            .put(
                "emploi du temps de ma fille lundi",
                "SELECT * FROM emploi WHERE IdPersonne = 7012 AND jour = 'Lundi'",
            )
            .unwrap();

        let similar = store.find_similar("les notes de physique de ma fille", 0.5).unwrap();
        assert!(similar.entry.question_template.starts_with("quelles sont les notes"));
        assert!(similar.score < 1.0);
        assert!(store.find_similar("les notes de physique de ma fille", 0.99).is_none());
    }

    #[test]
    fn test_json_store_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let key = {
            let store = TemplateStore::open("test", Box::new(JsonFileBackend::new(&path)));
            store
                .put("absences de mon fils", "SELECT * FROM absence WHERE IdPersonne = 7012")
                .unwrap()
                .key
        };

        let reopened = TemplateStore::open("test", Box::new(JsonFileBackend::new(&path)));
        assert_eq!(reopened.len(), 1);
        let stored = reopened.get_by_key(&key).unwrap();
        assert_eq!(
            stored.entry.sql_template,
            "SELECT * FROM absence WHERE IdPersonne = {id_personne}"
        );
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = TemplateStore::open("test", Box::new(JsonFileBackend::new(&path)));
        assert!(store.is_empty());
        // Still writable afterwards.
        store
            .put("absences de mon fils", "SELECT * FROM absence WHERE IdPersonne = 1")
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_legacy_file_is_migrated_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(
            &path,
            r#"{
  "5d41402abc4b2a76b9719d911017c592": {
    "question_template": "absences de {family_relation}",
    "sql_template": "SELECT * FROM absence WHERE IdPersonne = {{id_personne}}"
  }
}"#,
        )
        .unwrap();

        let store = TemplateStore::open("test", Box::new(JsonFileBackend::new(&path)));
        let hit = store.get_exact("absences de ma fille").unwrap();
        assert_eq!(
            hit.entry.sql_template,
            "SELECT * FROM absence WHERE IdPersonne = {id_personne}"
        );

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("{{id_personne}}"));
        assert!(!raw.contains("5d41402abc4b2a76b9719d911017c592"));
    }

    #[test]
    fn test_failed_persist_rolls_back() {
        let fail = Arc::new(AtomicBool::new(false));
        let store = TemplateStore::open(
            "test",
            Box::new(FlakyBackend { fail: fail.clone() }),
        );
        store
            .put("absences de mon fils", "SELECT 1 FROM eleve WHERE IdPersonne = 1")
            .unwrap();

        fail.store(true, Ordering::SeqCst);
        let result = store.put("notes de maths de mon fils", "SELECT 2 FROM eleve WHERE IdPersonne = 1");
        assert!(matches!(result, Err(CacheError::Store(_))));
        assert_eq!(store.len(), 1);
        assert!(store.get_exact("notes de maths de mon fils").is_none());
        assert!(store.find_similar("notes de maths de mon fils", 0.99).is_none());
    }

    #[test]
    fn test_sqlite_backed_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        {
            let store = TemplateStore::open("test", Box::new(SqliteBackend::open(&path).unwrap()));
            store
                .put("emploi du temps de mon fils mardi", "SELECT * FROM emploi WHERE IdPersonne = 7012 AND libelleJourFr = 'Mardi'")
                .unwrap();
        }
        let store = TemplateStore::open("test", Box::new(SqliteBackend::open(&path).unwrap()));
        let hit = store.get_exact("emploi du temps de ma fille jeudi").unwrap();
        assert_eq!(
            hit.entry.sql_template,
            "SELECT * FROM emploi WHERE IdPersonne = {id_personne} AND libelleJourFr = {jour}"
        );
        assert_eq!(store.stats().entries, 1);
    }
}
