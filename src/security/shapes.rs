//! Recognized isolation-filter shapes.
//!
//! A shape is a SQL fragment that restricts rows to a given student identity.
//! Shapes are rendered in lowercase with single spaces, the form the validator
//! reduces SQL text to before matching.

use super::AuthorizedIds;

/// Identity columns, with the table aliases the generator uses for them.
pub const IDENTITY_COLUMNS: &[&str] = &["idpersonne", "e.idpersonne", "eleve.idpersonne", "id_personne"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationShape {
    /// `col = 7012`
    Equality,
    /// `col in (7012,7716)`
    InList,
    /// `exists (select 1 from eleve where idpersonne = 7012`
    ExistsSubquery,
    /// `eleve in (select id from eleve where idpersonne = 7012`
    EleveInSubquery,
}

impl IsolationShape {
    pub const ALL: [IsolationShape; 4] = [
        IsolationShape::Equality,
        IsolationShape::InList,
        IsolationShape::ExistsSubquery,
        IsolationShape::EleveInSubquery,
    ];

    /// Every textual rendering of this shape for `ids`.
    ///
    /// A single-id shape is rendered for each id; the IN-list shape is
    /// rendered for the whole set (and for each id alone).
    pub fn render(&self, ids: &AuthorizedIds) -> Vec<String> {
        let mut out = Vec::new();
        match self {
            IsolationShape::Equality => {
                for column in IDENTITY_COLUMNS {
                    for id in ids.as_slice() {
                        out.push(format!("{} = {}", column, id));
                        out.push(format!("{}={}", column, id));
                    }
                }
            }
            IsolationShape::InList => {
                let mut lists = vec![ids.joined_with(","), ids.joined_with(", ")];
                if ids.len() > 1 {
                    lists.extend(ids.as_slice().iter().map(|id| id.to_string()));
                }
                for column in IDENTITY_COLUMNS {
                    for list in &lists {
                        out.push(format!("{} in ({})", column, list));
                        out.push(format!("{} in({})", column, list));
                    }
                }
            }
            IsolationShape::ExistsSubquery => {
                for id in ids.as_slice() {
                    for open in ["exists (", "exists("] {
                        out.push(format!("{}select 1 from eleve where idpersonne = {}", open, id));
                        out.push(format!("{}select 1 from eleve where idpersonne={}", open, id));
                    }
                }
            }
            IsolationShape::EleveInSubquery => {
                for id in ids.as_slice() {
                    out.push(format!("eleve in (select id from eleve where idpersonne = {}", id));
                    out.push(format!("eleve in (select id from eleve where idpersonne={}", id));
                }
            }
        }
        out
    }

    /// True when `normalized_sql` contains this shape for `ids`.
    pub fn matches(&self, normalized_sql: &str, ids: &AuthorizedIds) -> bool {
        self.render(ids)
            .iter()
            .any(|fragment| contains_bounded(normalized_sql, fragment))
    }
}

/// First shape found in `normalized_sql`, if any.
pub fn find_isolation_shape(normalized_sql: &str, ids: &AuthorizedIds) -> Option<IsolationShape> {
    if ids.is_empty() {
        return None;
    }
    IsolationShape::ALL
        .iter()
        .copied()
        .find(|shape| shape.matches(normalized_sql, ids))
}

/// Substring match that will not accept `idpersonne = 70` inside
/// `idpersonne = 7012` or `idpersonne` inside `parentidpersonne`.
pub fn contains_bounded(haystack: &str, fragment: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let starts_with_word = fragment.chars().next().map_or(false, is_word);
    let ends_with_word = fragment.chars().next_back().map_or(false, is_word);

    haystack.match_indices(fragment).any(|(start, matched)| {
        let end = start + matched.len();
        let before_ok = !starts_with_word
            || haystack[..start].chars().next_back().map_or(true, |c| !is_word(c));
        let after_ok =
            !ends_with_word || haystack[end..].chars().next().map_or(true, |c| !is_word(c));
        before_ok && after_ok
    })
}
