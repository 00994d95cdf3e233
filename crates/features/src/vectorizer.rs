//! Character n-gram TF-IDF vectorization.
//!
//! N-grams are generated per word with one space of padding on each side
//! (`char_wb` analysis), so features never straddle a word boundary.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural inconsistency in a persisted vectorizer.
#[derive(Debug, Error, PartialEq)]
pub enum VectorizerError {
    #[error("Vocabulary has {terms} terms but {idf} idf weights")]
    IdfLength { terms: usize, idf: usize },

    #[error("Invalid n-gram range {min}..={max}")]
    NgramRange { min: usize, max: usize },

    #[error("Duplicate vocabulary term {0:?}")]
    DuplicateTerm(String),

    #[error("Non-finite idf weight for term {0:?}")]
    NonFiniteIdf(String),
}

/// Settings for [`CharNgramVectorizer`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VectorizerConfig {
    /// Shortest n-gram length
    pub ngram_min: usize,
    /// Longest n-gram length
    pub ngram_max: usize,
    /// Minimum number of training documents an n-gram must occur in
    pub min_df: usize,
}

impl Default for VectorizerConfig {
    fn default() -> Self {
        Self {
            ngram_min: 3,
            ngram_max: 5,
            min_df: 2,
        }
    }
}

/// Sparse feature vector, entries sorted by feature index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseVector {
    entries: Vec<(usize, f64)>,
}

impl SparseVector {
    /// Build from entries; sorts by index and drops explicit zeros.
    pub fn from_entries(mut entries: Vec<(usize, f64)>) -> Self {
        entries.retain(|(_, v)| *v != 0.0);
        entries.sort_by_key(|(i, _)| *i);
        Self { entries }
    }

    pub fn entries(&self) -> &[(usize, f64)] {
        &self.entries
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: usize) -> f64 {
        self.entries
            .binary_search_by_key(&index, |(i, _)| *i)
            .map(|pos| self.entries[pos].1)
            .unwrap_or(0.0)
    }

    /// Append `other` with its indices shifted by `offset`.
    ///
    /// `offset` must be past every index already in `self`.
    pub fn concat(mut self, other: &SparseVector, offset: usize) -> Self {
        self.entries
            .extend(other.entries.iter().map(|(i, v)| (i + offset, *v)));
        self
    }
}

/// Generate `char_wb` n-grams of lengths `min_n..=max_n`.
///
/// A padded word shorter than or equal to `n` is emitted once, whole, and
/// longer lengths are skipped for that word.
pub fn char_wb_ngrams(text: &str, min_n: usize, max_n: usize) -> Vec<String> {
    let mut ngrams = Vec::new();

    for word in text.split_whitespace() {
        let padded: Vec<char> = std::iter::once(' ')
            .chain(word.chars())
            .chain(std::iter::once(' '))
            .collect();
        let len = padded.len();

        for n in min_n..=max_n {
            if len <= n {
                ngrams.push(padded.iter().collect());
                break;
            }
            for start in 0..=len - n {
                ngrams.push(padded[start..start + n].iter().collect());
            }
        }
    }

    ngrams
}

/// Fitted TF-IDF vectorizer over character n-grams of one text field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "VectorizerParts", into = "VectorizerParts")]
pub struct CharNgramVectorizer {
    config: VectorizerConfig,
    terms: Vec<String>,
    idf: Vec<f64>,
    index: HashMap<String, usize>,
}

/// Persisted form: the lookup table is rebuilt on load.
#[derive(Serialize, Deserialize)]
struct VectorizerParts {
    config: VectorizerConfig,
    terms: Vec<String>,
    idf: Vec<f64>,
}

impl From<VectorizerParts> for CharNgramVectorizer {
    fn from(parts: VectorizerParts) -> Self {
        Self::from_terms(parts.config, parts.terms, parts.idf)
    }
}

impl From<CharNgramVectorizer> for VectorizerParts {
    fn from(v: CharNgramVectorizer) -> Self {
        Self {
            config: v.config,
            terms: v.terms,
            idf: v.idf,
        }
    }
}

impl CharNgramVectorizer {
    fn from_terms(config: VectorizerConfig, terms: Vec<String>, idf: Vec<f64>) -> Self {
        let index = terms
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        Self {
            config,
            terms,
            idf,
            index,
        }
    }

    /// Learn the vocabulary and document frequencies from training documents.
    pub fn fit<S: AsRef<str>>(config: VectorizerConfig, documents: &[S]) -> Self {
        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        for doc in documents {
            let unique: HashSet<String> =
                char_wb_ngrams(doc.as_ref(), config.ngram_min, config.ngram_max)
                    .into_iter()
                    .collect();
            for ngram in unique {
                *document_frequency.entry(ngram).or_insert(0) += 1;
            }
        }

        let n_docs = documents.len() as f64;
        let mut kept: Vec<(String, usize)> = document_frequency
            .into_iter()
            .filter(|(_, df)| *df >= config.min_df)
            .collect();
        kept.sort();

        let idf = kept
            .iter()
            .map(|(_, df)| ((1.0 + n_docs) / (1.0 + *df as f64)).ln() + 1.0)
            .collect();
        let terms = kept.into_iter().map(|(t, _)| t).collect();

        Self::from_terms(config, terms, idf)
    }

    /// Check that a deserialized vectorizer can be used for `transform`.
    pub fn validate(&self) -> Result<(), VectorizerError> {
        let VectorizerConfig {
            ngram_min,
            ngram_max,
            ..
        } = self.config;
        if ngram_min == 0 || ngram_min > ngram_max {
            return Err(VectorizerError::NgramRange {
                min: ngram_min,
                max: ngram_max,
            });
        }
        if self.terms.len() != self.idf.len() {
            return Err(VectorizerError::IdfLength {
                terms: self.terms.len(),
                idf: self.idf.len(),
            });
        }
        if self.index.len() != self.terms.len() {
            let mut seen = HashSet::new();
            if let Some(term) = self.terms.iter().find(|t| !seen.insert(t.as_str())) {
                return Err(VectorizerError::DuplicateTerm(term.clone()));
            }
        }
        if let Some((term, _)) = self.terms.iter().zip(&self.idf).find(|(_, w)| !w.is_finite()) {
            return Err(VectorizerError::NonFiniteIdf(term.clone()));
        }
        Ok(())
    }

    /// Number of features (vocabulary size).
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn config(&self) -> VectorizerConfig {
        self.config
    }

    /// Vocabulary term for a feature index.
    pub fn term(&self, index: usize) -> Option<&str> {
        self.terms.get(index).map(String::as_str)
    }

    /// L2-normalized TF-IDF vector. Out-of-vocabulary n-grams are ignored.
    pub fn transform(&self, text: &str) -> SparseVector {
        let mut counts: BTreeMap<usize, f64> = BTreeMap::new();
        for ngram in char_wb_ngrams(text, self.config.ngram_min, self.config.ngram_max) {
            if let Some(&i) = self.index.get(&ngram) {
                *counts.entry(i).or_insert(0.0) += 1.0;
            }
        }

        let mut entries: Vec<(usize, f64)> = counts
            .into_iter()
            .map(|(i, tf)| (i, tf * self.idf[i]))
            .collect();

        let norm = entries.iter().map(|(_, v)| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, v) in &mut entries {
                *v /= norm;
            }
        }

        SparseVector::from_entries(entries)
    }
}
