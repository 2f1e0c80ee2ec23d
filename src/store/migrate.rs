//! Load-time migration of stored entries.
//!
//! Older cache files carry double-braced placeholders (`{{id_personne}}`) and
//! keys computed from un-normalized templates. Both are rewritten to the
//! canonical form once, at load, so nothing downstream has to special-case
//! them.

use super::CacheEntry;
use crate::extract::PLACEHOLDER_RE;
use crate::normalize::{key_of_normalized, normalize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// `{{name}}` -> `{name}`; single-braced placeholders are left as they are.
pub fn canonicalize_braces(template: &str) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| format!("{{{}}}", &caps[1]))
        .into_owned()
}

/// What a migration pass changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub braces_rewritten: usize,
    pub rekeyed: usize,
    pub dropped_duplicates: usize,
}

impl MigrationReport {
    pub fn changed(&self) -> bool {
        self.braces_rewritten + self.rekeyed + self.dropped_duplicates > 0
    }
}

/// Canonicalize every entry and key. Entries whose canonical key collides
/// with an earlier one (in key order) are dropped.
pub fn migrate_entries(
    entries: BTreeMap<String, CacheEntry>,
) -> (BTreeMap<String, CacheEntry>, MigrationReport) {
    let mut report = MigrationReport::default();
    let mut migrated = BTreeMap::new();

    for (key, entry) in entries {
        let sql_template = canonicalize_braces(&entry.sql_template);
        let question_template = normalize(&canonicalize_braces(&entry.question_template));
        if sql_template != entry.sql_template {
            report.braces_rewritten += 1;
            info!("Normalized legacy placeholders in template {}", key);
        }

        let canonical_key = key_of_normalized(&question_template);
        if canonical_key != key {
            report.rekeyed += 1;
        }

        if migrated.contains_key(&canonical_key) {
            warn!(
                "Dropping cache entry {}: its template duplicates {}",
                key, canonical_key
            );
            report.dropped_duplicates += 1;
            continue;
        }

        migrated.insert(
            canonical_key,
            CacheEntry {
                question_template,
                sql_template,
            },
        );
    }

    (migrated, report)
}
