//! SQL Rehydrator
//!
//! Fills a stored SQL template with the current request's values. The
//! identity placeholder is always resolved from the caller's authorized ids
//! of this request; no identifier is ever read back from the cache.

use crate::extract::{lexicon, params, ParameterMap, PLACEHOLDER_RE};
use crate::security::AuthorizedIds;
use crate::store::canonicalize_braces;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::BTreeSet;

lazy_static! {
    static ref IDENTITY_EQ_RE: Regex =
        Regex::new(r"(?i)\b((?:\w+\.)?idpersonne)\s*=\s*\{id_personne\}").unwrap();
    static ref IDENTITY_IN_RE: Regex =
        Regex::new(r"(?i)\b((?:\w+\.)?idpersonne)\s+in\s*\(\s*\{id_personne\}\s*\)").unwrap();
    static ref VALUE_RE: Regex = Regex::new(r#"'\{(\w+)\}'|"\{(\w+)\}"|\{(\w+)\}"#).unwrap();
}

/// Substitute identity and parameter placeholders in `sql_template`.
///
/// - `col = {id_personne}` becomes `col = 7012` for a single id and
///   `col IN (7012,7716)` for several.
/// - `col IN ({id_personne})` becomes `col IN (7012)` / `col IN (7012,7716)`.
/// - Any other `{id_personne}` gets the comma-joined ids.
/// - `'{p}'` gets the value with quotes escaped; a bare `{p}` gets the raw
///   value, except weekday names which are quoted.
///
/// Placeholders with no value (or `{id_personne}` with no ids) are left as
/// they are; the result must still go through the access validator.
pub fn rehydrate(sql_template: &str, variables: &ParameterMap, ids: &AuthorizedIds) -> String {
    let canonical = canonicalize_braces(sql_template);
    let with_identity = resolve_identity(&canonical, ids);
    resolve_values(&with_identity, variables)
}

fn resolve_identity(sql: &str, ids: &AuthorizedIds) -> String {
    if ids.is_empty() {
        return sql.to_string();
    }
    let joined = ids.joined();

    let out = IDENTITY_IN_RE.replace_all(sql, |caps: &Captures| {
        format!("{} IN ({})", &caps[1], joined)
    });
    let out = IDENTITY_EQ_RE.replace_all(&out, |caps: &Captures| {
        if ids.len() == 1 {
            format!("{} = {}", &caps[1], joined)
        } else {
            format!("{} IN ({})", &caps[1], joined)
        }
    });
    out.replace(&format!("{{{}}}", params::ID_PERSONNE), &joined)
}

fn resolve_values(sql: &str, variables: &ParameterMap) -> String {
    VALUE_RE
        .replace_all(sql, |caps: &Captures| {
            let (name, quote) = match (caps.get(1), caps.get(2), caps.get(3)) {
                (Some(name), _, _) => (name.as_str(), Some('\'')),
                (_, Some(name), _) => (name.as_str(), Some('"')),
                (_, _, Some(name)) => (name.as_str(), None),
                _ => return caps[0].to_string(),
            };
            let value = match variables.get(name) {
                Some(value) if name != params::ID_PERSONNE => value,
                _ => return caps[0].to_string(),
            };

            if name == params::JOUR {
                return render_day(value, quote);
            }
            match quote {
                Some(q) => quote_literal(value, q),
                None => value.clone(),
            }
        })
        .into_owned()
}

/// Weekday names are always quoted; relative days are SQL expressions and
/// never are, even when a legacy template put quotes around the slot.
fn render_day(value: &str, quote: Option<char>) -> String {
    if is_weekday(value) {
        quote_literal(value, quote.unwrap_or('\''))
    } else {
        value.to_string()
    }
}

fn is_weekday(value: &str) -> bool {
    let lower = value.to_lowercase();
    lexicon::WEEKDAYS.contains(&lower.as_str())
}

fn quote_literal(value: &str, quote: char) -> String {
    let doubled = format!("{q}{q}", q = quote);
    format!("{q}{v}{q}", q = quote, v = value.replace(quote, &doubled))
}

/// Placeholder names still present after rehydration.
pub fn unresolved_placeholders(sql: &str) -> BTreeSet<String> {
    PLACEHOLDER_RE
        .captures_iter(sql)
        .map(|caps| caps[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> ParameterMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ids(values: &[u64]) -> AuthorizedIds {
        AuthorizedIds::new(values.iter().copied())
    }

    #[test]
    fn test_equality_shape_single_and_multi() {
        let template = "SELECT * FROM absence a WHERE a.IdPersonne = {id_personne}";
        assert_eq!(
            rehydrate(template, &vars(&[]), &ids(&[7012])),
            "SELECT * FROM absence a WHERE a.IdPersonne = 7012"
        );
        assert_eq!(
            rehydrate(template, &vars(&[]), &ids(&[7012, 7716])),
            "SELECT * FROM absence a WHERE a.IdPersonne IN (7012,7716)"
        );
    }

    #[test]
    fn test_in_shape_keeps_in_list() {
        let template = "WHERE e.IdPersonne IN ({id_personne})";
        assert_eq!(
            rehydrate(template, &vars(&[]), &ids(&[7716])),
            "WHERE e.IdPersonne IN (7716)"
        );
        assert_eq!(
            rehydrate(template, &vars(&[]), &ids(&[7012, 7716])),
            "WHERE e.IdPersonne IN (7012,7716)"
        );
    }

    #[test]
    fn test_legacy_double_braces() {
        assert_eq!(
            rehydrate("WHERE IdPersonne = {{id_personne}}", &vars(&[]), &ids(&[42])),
            "WHERE IdPersonne = 42"
        );
    }

    #[test]
    fn test_cached_identity_value_is_ignored() {
        // Even if a variable map carries an id, only the authorized set counts.
        let out = rehydrate(
            "WHERE IdPersonne = {id_personne}",
            &vars(&[("id_personne", "7012")]),
            &ids(&[7716]),
        );
        assert_eq!(out, "WHERE IdPersonne = 7716");
    }

    #[test]
    fn test_empty_ids_leave_placeholder() {
        let out = rehydrate("WHERE IdPersonne = {id_personne}", &vars(&[]), &ids(&[]));
        assert_eq!(out, "WHERE IdPersonne = {id_personne}");
        assert!(unresolved_placeholders(&out).contains("id_personne"));
    }

    #[test]
    fn test_values_and_quoting() {
        let out = rehydrate(
            "WHERE m.NomMatiereFr = '{matiere}' AND p.NomFr = '{NomFr}' AND n.codeperiexam = {codeperiexam}",
            &vars(&[("matiere", "physique"), ("NomFr", "O'NEIL"), ("codeperiexam", "32")]),
            &ids(&[1]),
        );
        assert_eq!(
            out,
            "WHERE m.NomMatiereFr = 'physique' AND p.NomFr = 'O''NEIL' AND n.codeperiexam = 32"
        );
    }

    #[test]
    fn test_day_values() {
        let template = "WHERE j.libelleJourFr = {jour}";
        assert_eq!(
            rehydrate(template, &vars(&[("jour", "Mardi")]), &ids(&[1])),
            "WHERE j.libelleJourFr = 'Mardi'"
        );
        assert_eq!(
            rehydrate("WHERE s.date = {jour}", &vars(&[("jour", "CURRENT_DATE")]), &ids(&[1])),
            "WHERE s.date = CURRENT_DATE"
        );
        // Legacy quoted slot.
        assert_eq!(
            rehydrate("WHERE j.libelleJourFr = '{jour}'", &vars(&[("jour", "Jeudi")]), &ids(&[1])),
            "WHERE j.libelleJourFr = 'Jeudi'"
        );
        assert_eq!(
            rehydrate(
                "WHERE s.date = '{jour}'",
                &vars(&[("jour", "DATE_ADD(CURRENT_DATE, INTERVAL 1 DAY)")]),
                &ids(&[1])
            ),
            "WHERE s.date = DATE_ADD(CURRENT_DATE, INTERVAL 1 DAY)"
        );
    }

    #[test]
    fn test_unresolved_placeholders_are_kept() {
        let out = rehydrate("WHERE c.CODECLASSEFR = '{CODECLASSEFR}'", &vars(&[]), &ids(&[1]));
        assert_eq!(out, "WHERE c.CODECLASSEFR = '{CODECLASSEFR}'");
        assert_eq!(
            unresolved_placeholders(&out).into_iter().collect::<Vec<_>>(),
            vec!["CODECLASSEFR"]
        );
    }
}
