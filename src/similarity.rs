//! Similarity Index
//!
//! Bag-of-words TF-IDF over the normalized templates of one store. The index
//! is disposable: the store rebuilds it in full after every mutation and it
//! is never persisted.
//!
//! Weighting follows the usual smoothed scheme:
//! - tokens are runs of two or more word characters
//! - tf is the raw count in the document
//! - idf = ln((1 + n) / (1 + df)) + 1
//! - each vector is L2-normalized, so cosine similarity is a dot product

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(r"\w\w+").unwrap();
}

/// Sparse vector: (term id, weight), sorted by term id.
type SparseVector = Vec<(usize, f64)>;

/// Best match of a query against the index.
#[derive(Debug, Clone, PartialEq)]
pub struct Nearest {
    /// Store key of the matched template.
    pub key: String,
    pub score: f64,
}

#[derive(Debug, Default, Clone)]
pub struct TfIdfIndex {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    keys: Vec<String>,
    vectors: Vec<SparseVector>,
}

impl TfIdfIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fit the vocabulary and document vectors from `(key, normalized template)`.
    pub fn rebuild<'a, I>(documents: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let documents: Vec<(&str, Vec<String>)> = documents
            .into_iter()
            .map(|(key, text)| (key, tokenize(text)))
            .collect();

        // Sorted vocabulary gives stable term ids regardless of insertion order.
        let mut document_frequency: BTreeMap<&str, usize> = BTreeMap::new();
        for (_, tokens) in &documents {
            let mut seen: Vec<&str> = tokens.iter().map(String::as_str).collect();
            seen.sort_unstable();
            seen.dedup();
            for token in seen {
                *document_frequency.entry(token).or_insert(0) += 1;
            }
        }

        let n = documents.len() as f64;
        let mut vocabulary = HashMap::with_capacity(document_frequency.len());
        let mut idf = Vec::with_capacity(document_frequency.len());
        for (id, (term, df)) in document_frequency.iter().enumerate() {
            vocabulary.insert(term.to_string(), id);
            idf.push(((1.0 + n) / (1.0 + *df as f64)).ln() + 1.0);
        }

        let mut index = Self {
            vocabulary,
            idf,
            keys: Vec::with_capacity(documents.len()),
            vectors: Vec::with_capacity(documents.len()),
        };
        for (key, tokens) in &documents {
            let vector = index.vectorize_tokens(tokens);
            index.keys.push(key.to_string());
            index.vectors.push(vector);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary.len()
    }

    /// Highest-scoring document at or above `threshold`.
    ///
    /// An empty index, an empty vocabulary or a query sharing no term with the
    /// vocabulary all yield `None`. Ties keep the earliest document.
    pub fn nearest(&self, query: &str, threshold: f64) -> Option<Nearest> {
        self.best(query).filter(|m| m.score >= threshold)
    }

    /// Highest-scoring document regardless of threshold.
    pub fn best(&self, query: &str) -> Option<Nearest> {
        if self.is_empty() || self.vocabulary.is_empty() {
            return None;
        }

        let query = self.vectorize_tokens(&tokenize(query));
        if query.is_empty() {
            return None;
        }

        let mut best: Option<(usize, f64)> = None;
        for (i, vector) in self.vectors.iter().enumerate() {
            let score = cosine_similarity(&query, vector);
            if !score.is_finite() {
                continue;
            }
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((i, score)),
            }
        }

        best.map(|(i, score)| Nearest {
            key: self.keys[i].clone(),
            score,
        })
    }

    fn vectorize_tokens(&self, tokens: &[String]) -> SparseVector {
        let mut counts: BTreeMap<usize, f64> = BTreeMap::new();
        for token in tokens {
            if let Some(&id) = self.vocabulary.get(token) {
                *counts.entry(id).or_insert(0.0) += 1.0;
            }
        }

        let mut vector: SparseVector = counts
            .into_iter()
            .map(|(id, tf)| (id, tf * self.idf[id]))
            .collect();

        let norm = vector.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
        if norm == 0.0 {
            return Vec::new();
        }
        for (_, w) in vector.iter_mut() {
            *w /= norm;
        }
        vector
    }
}

fn tokenize(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Cosine similarity of two L2-normalized sparse vectors.
fn cosine_similarity(a: &[(usize, f64)], b: &[(usize, f64)]) -> f64 {
    let (mut i, mut j) = (0, 0);
    let mut dot = 0.0;
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                dot += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
        }
    }
    dot
}
