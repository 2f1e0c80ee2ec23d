//! Template Normalizer
//!
//! Canonical form of a question shape: extracted, whitespace-collapsed and
//! lowercased. It is the similarity-index document and the hash input for the
//! store key; it never feeds executable SQL.

use crate::extract::ParameterExtractor;
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

lazy_static! {
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
    static ref DEFAULT_EXTRACTOR: ParameterExtractor = ParameterExtractor::new();
}

/// Normalize with the default matcher chain.
pub fn normalize(question: &str) -> String {
    normalize_with(&DEFAULT_EXTRACTOR, question)
}

pub fn normalize_with(extractor: &ParameterExtractor, question: &str) -> String {
    let collapsed = collapse_whitespace(question);
    let extraction = extractor.extract(&collapsed);
    collapse_whitespace(&extraction.template).to_lowercase()
}

/// Store key of a question: hex SHA-256 of its normalized template.
pub fn template_key(question: &str) -> String {
    key_of_normalized(&normalize(question))
}

/// Store key of an already-normalized template.
pub fn key_of_normalized(normalized: &str) -> String {
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RE.replace_all(text.trim(), " ").into_owned()
}
