//! Parameter Extractor
//!
//! Turns a natural-language question into a placeholder-bearing template plus
//! the map of values it extracted. All matchers read the untouched question;
//! a single resolution pass then accepts candidates in priority order,
//! leftmost first, rejecting anything that overlaps an accepted span or an
//! existing placeholder. No substitution ever shifts another match's offsets.

pub mod lexicon;
pub mod matchers;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use lexicon::{params, IDENTITY_SENTINEL};
pub use matchers::{classify_number, Candidate, EntityKind, Matcher, NumberRole};

/// Placeholder name -> extracted value.
pub type ParameterMap = BTreeMap<String, String>;

lazy_static! {
    /// `{name}` or legacy `{{name}}`.
    pub(crate) static ref PLACEHOLDER_RE: Regex = Regex::new(r"\{\{?(\w+)\}?\}").unwrap();
}

/// One accepted entity occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSpan {
    pub kind: EntityKind,
    /// Text of the question that was replaced.
    pub surface: String,
    /// Template text that replaced it.
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub template: String,
    pub variables: ParameterMap,
    /// Accepted spans in left-to-right order.
    pub spans: Vec<ExtractedSpan>,
}

impl Extraction {
    /// True when the question referred to the caller's own children.
    pub fn has_family_marker(&self) -> bool {
        self.variables
            .get(params::ID_PERSONNE)
            .map(|v| v == IDENTITY_SENTINEL)
            .unwrap_or(false)
    }

    /// Put the original surface text back in place of every replacement.
    pub fn restore(&self) -> String {
        let mut restored = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        for span in &self.spans {
            match rest.find(&span.replacement) {
                Some(pos) => {
                    restored.push_str(&rest[..pos]);
                    restored.push_str(&span.surface);
                    rest = &rest[pos + span.replacement.len()..];
                }
                None => break,
            }
        }
        restored.push_str(rest);
        restored
    }

    /// Substitute the extracted values into the template.
    pub fn fill(&self) -> String {
        fill_placeholders(&self.template, &self.variables)
    }
}

/// Replace every `{name}` whose name is in `variables`; leave the rest alone.
pub fn fill_placeholders(template: &str, variables: &ParameterMap) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| {
            match variables.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

pub struct ParameterExtractor {
    matchers: Vec<Box<dyn Matcher>>,
}

impl Default for ParameterExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterExtractor {
    pub fn new() -> Self {
        Self {
            matchers: matchers::default_matchers(),
        }
    }

    /// Use a custom matcher chain. Order is priority order.
    pub fn with_matchers(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }

    /// Detect entities in `question` and build its template.
    pub fn extract(&self, question: &str) -> Extraction {
        let protected: Vec<(usize, usize)> = PLACEHOLDER_RE
            .find_iter(question)
            .map(|m| (m.start(), m.end()))
            .collect();

        let mut accepted: Vec<Candidate> = Vec::new();
        let mut variables = ParameterMap::new();

        for matcher in &self.matchers {
            let mut candidates = matcher.candidates(question);
            candidates.sort_by(|a, b| {
                a.start
                    .cmp(&b.start)
                    .then_with(|| (b.end - b.start).cmp(&(a.end - a.start)))
            });

            for mut candidate in candidates {
                if protected
                    .iter()
                    .any(|&(s, e)| candidate.overlaps(s, e))
                {
                    continue;
                }
                if accepted
                    .iter()
                    .any(|a| a.overlaps(candidate.start, candidate.end))
                {
                    continue;
                }
                if candidate.kind == EntityKind::QuotedValue
                    && !settle_quoted_value(&mut candidate, &variables)
                {
                    continue;
                }
                // First value per parameter wins; a later occurrence is only
                // templated when it carries the same value.
                let conflicting = candidate.bindings.iter().any(|(name, value)| {
                    variables.get(name).map(|v| v != value).unwrap_or(false)
                });
                if conflicting {
                    continue;
                }

                for (name, value) in &candidate.bindings {
                    variables.insert(name.clone(), value.clone());
                }
                accepted.push(candidate);
            }
        }

        accepted.sort_by_key(|c| c.start);

        let mut template = String::with_capacity(question.len());
        let mut spans = Vec::with_capacity(accepted.len());
        let mut cursor = 0;
        for candidate in accepted {
            template.push_str(&question[cursor..candidate.start]);
            template.push_str(&candidate.replacement);
            spans.push(ExtractedSpan {
                kind: candidate.kind,
                surface: question[candidate.start..candidate.end].to_string(),
                replacement: candidate.replacement,
            });
            cursor = candidate.end;
        }
        template.push_str(&question[cursor..]);

        Extraction {
            template,
            variables,
            spans,
        }
    }
}

/// Quoted values are only templated when not already extracted; a name slot
/// that is taken falls back to the generic `Valeur` slot.
fn settle_quoted_value(candidate: &mut Candidate, variables: &ParameterMap) -> bool {
    let (name, value) = match candidate.bindings.first() {
        Some(binding) => binding.clone(),
        None => return false,
    };
    if variables.values().any(|v| *v == value) {
        return false;
    }
    if name == params::NOM_FR && variables.contains_key(params::NOM_FR) {
        if variables.contains_key(params::VALEUR) {
            return false;
        }
        candidate.replacement = candidate
            .replacement
            .replace(params::NOM_FR, params::VALEUR);
        candidate.bindings = vec![(params::VALEUR.to_string(), value)];
    }
    true
}
