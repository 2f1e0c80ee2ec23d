//! Turn executed SQL into a reusable template.
//!
//! Literal values that came from the question are replaced by placeholders so
//! a later question of the same shape can fill in its own values. Identity
//! filters are replaced by `{id_personne}` when the question was about the
//! caller's own children, so no cached entry ever carries an identifier.

use crate::extract::{params, ParameterMap, IDENTITY_SENTINEL, PLACEHOLDER_RE};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::BTreeSet;

lazy_static! {
    static ref IDENTITY_EQ_RE: Regex =
        Regex::new(r"(?i)\b((?:\w+\.)?idpersonne)\s*=\s*'?\d+'?").unwrap();
    static ref IDENTITY_IN_RE: Regex =
        Regex::new(r"(?i)\b((?:\w+\.)?idpersonne)\s+in\s*\(\s*\d+(?:\s*,\s*\d+)*\s*\)").unwrap();
    static ref RESERVED_RE: Regex = Regex::new(&format!(
        r"(?i)\b(?:{})\b",
        RESERVED_WORDS.join("|")
    ))
    .unwrap();
    static ref MASK_RE: Regex = Regex::new(r"__KW_(\d+)__").unwrap();
}

/// SQL words that must survive value substitution untouched.
const RESERVED_WORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "ON", "AND", "OR", "NOT", "IN",
    "AS", "LIKE", "BETWEEN", "IS", "NULL", "EXISTS", "GROUP", "ORDER", "BY", "HAVING", "LIMIT",
    "DISTINCT", "UNION", "CASE", "WHEN", "THEN", "ELSE", "END", "ASC", "DESC",
];

/// Parameters whose values are free text matched inside quoted literals.
const TEXT_PARAMS: &[&str] = &[params::MATIERE, params::TYPE_EVALUATION];

/// Parameters handled before the generic pass.
const SPECIAL_PARAMS: &[&str] = &[
    params::ID_PERSONNE,
    params::ANNEE_SCOLAIRE,
    params::CODE_PERI_EXAM,
    params::MATIERE,
    params::TYPE_EVALUATION,
];

/// Build the stored SQL template for `sql` given the question's variables.
pub fn parameterize_sql(sql: &str, variables: &ParameterMap) -> String {
    let mut out = sql.to_string();

    if variables
        .get(params::ID_PERSONNE)
        .map(|v| v == IDENTITY_SENTINEL)
        .unwrap_or(false)
    {
        out = parameterize_identity(&out);
    }

    if let Some(year) = variables.get(params::ANNEE_SCOLAIRE) {
        out = out
            .replace(&format!("'{}'", year), &quoted(params::ANNEE_SCOLAIRE, '\''))
            .replace(&format!("\"{}\"", year), &quoted(params::ANNEE_SCOLAIRE, '"'))
            .replace(year.as_str(), &bare(params::ANNEE_SCOLAIRE));
    }

    if let Some(code) = variables.get(params::CODE_PERI_EXAM) {
        out = parameterize_term_code(&out, code);
    }

    for name in TEXT_PARAMS {
        if let Some(value) = variables.get(*name) {
            out = replace_inside_literals(&out, name, value);
        }
    }

    let generic: Vec<(&String, &String)> = variables
        .iter()
        .filter(|(name, value)| !SPECIAL_PARAMS.contains(&name.as_str()) && !value.is_empty())
        .collect();

    for (name, value) in &generic {
        out = replace_quoted(&out, name, value);
    }

    // Bare values only ever replace whole words outside reserved SQL words.
    let (masked, masks) = mask_reserved(&out);
    out = masked;
    for (name, value) in &generic {
        if value.chars().count() > 2 {
            out = replace_bare(&out, name, value);
        }
    }
    unmask_reserved(&out, &masks)
}

/// Replace literal identity filters by the identity placeholder.
///
/// `IdPersonne = 7012` becomes `IdPersonne = {id_personne}` and
/// `IdPersonne IN (7012, 7716)` becomes `IdPersonne IN ({id_personne})`,
/// for any table alias.
pub fn parameterize_identity(sql: &str) -> String {
    let placeholder = bare(params::ID_PERSONNE);
    let out = IDENTITY_IN_RE.replace_all(sql, |caps: &Captures| {
        format!("{} IN ({})", &caps[1], placeholder)
    });
    IDENTITY_EQ_RE
        .replace_all(&out, |caps: &Captures| format!("{} = {}", &caps[1], placeholder))
        .into_owned()
}

fn parameterize_term_code(sql: &str, code: &str) -> String {
    let escaped = regex::escape(code);
    let column_first = Regex::new(&format!(
        r#"(?i)\b((?:\w+\.)?codeperiexam)\s*=\s*(['"]?)\b{}\b(['"]?)"#,
        escaped
    ));
    let value_first = Regex::new(&format!(
        r#"(?i)(['"]?)\b{}\b(['"]?)\s*=\s*((?:\w+\.)?codeperiexam)\b"#,
        escaped
    ));
    let (column_first, value_first) = match (column_first, value_first) {
        (Ok(a), Ok(b)) => (a, b),
        _ => return sql.to_string(),
    };

    let placeholder = bare(params::CODE_PERI_EXAM);
    let out = column_first.replace_all(sql, |caps: &Captures| {
        format!("{} = {}{}{}", &caps[1], &caps[2], placeholder, &caps[3])
    });
    value_first
        .replace_all(&out, |caps: &Captures| {
            format!("{}{}{} = {}", &caps[1], placeholder, &caps[2], &caps[3])
        })
        .into_owned()
}

/// Case-insensitive, word-bounded replacement of `value` inside single- or
/// double-quoted literals, keeping the quotes and any surrounding text.
fn replace_inside_literals(sql: &str, name: &str, value: &str) -> String {
    let needle = match Regex::new(&format!(r"(?i){}", regex::escape(value))) {
        Ok(re) => re,
        Err(_) => return sql.to_string(),
    };
    let literal = match Regex::new(r#"'[^']*'|"[^"]*""#) {
        Ok(re) => re,
        Err(_) => return sql.to_string(),
    };
    let placeholder = bare(name);

    literal
        .replace_all(sql, |caps: &Captures| {
            let text = &caps[0];
            let mut result = String::with_capacity(text.len());
            let mut cursor = 0;
            for m in needle.find_iter(text) {
                if !is_word_bounded(text, m.start(), m.end()) {
                    continue;
                }
                result.push_str(&text[cursor..m.start()]);
                result.push_str(&placeholder);
                cursor = m.end();
            }
            result.push_str(&text[cursor..]);
            result
        })
        .into_owned()
}

/// Case-insensitive replacement of the single- and double-quoted value.
fn replace_quoted(sql: &str, name: &str, value: &str) -> String {
    let weekday = name == params::JOUR;
    let mut out = sql.to_string();

    for quote in ['\'', '"'] {
        let pattern = format!(
            "(?i){q}{v}{q}",
            q = regex::escape(&quote.to_string()),
            v = regex::escape(value)
        );
        if let Ok(re) = Regex::new(&pattern) {
            // Day names are re-quoted at rehydration time.
            let replacement = if weekday {
                bare(name)
            } else {
                quoted(name, quote)
            };
            out = re.replace_all(&out, regex::NoExpand(&replacement)).into_owned();
        }
    }
    out
}

fn replace_bare(sql: &str, name: &str, value: &str) -> String {
    let protected: Vec<(usize, usize)> = PLACEHOLDER_RE
        .find_iter(sql)
        .map(|m| (m.start(), m.end()))
        .collect();
    let placeholder = bare(name);

    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0;
    for (start, matched) in sql.match_indices(value) {
        let end = start + matched.len();
        if start < cursor
            || !is_word_bounded(sql, start, end)
            || protected.iter().any(|&(s, e)| start < e && s < end)
        {
            continue;
        }
        out.push_str(&sql[cursor..start]);
        out.push_str(&placeholder);
        cursor = end;
    }
    out.push_str(&sql[cursor..]);
    out
}

fn mask_reserved(sql: &str) -> (String, Vec<String>) {
    let mut masks = Vec::new();
    let masked = RESERVED_RE
        .replace_all(sql, |caps: &Captures| {
            masks.push(caps[0].to_string());
            format!("__KW_{}__", masks.len() - 1)
        })
        .into_owned();
    (masked, masks)
}

fn unmask_reserved(sql: &str, masks: &[String]) -> String {
    MASK_RE
        .replace_all(sql, |caps: &Captures| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|i| masks.get(i))
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_word_bounded(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    before.map_or(true, |c| !is_word_char(c)) && after.map_or(true, |c| !is_word_char(c))
}

fn bare(name: &str) -> String {
    format!("{{{}}}", name)
}

fn quoted(name: &str, quote: char) -> String {
    format!("{q}{{{n}}}{q}", q = quote, n = name)
}

/// Placeholder names referenced by a template, braces canonicalized.
pub fn placeholder_names(template: &str) -> BTreeSet<String> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}
