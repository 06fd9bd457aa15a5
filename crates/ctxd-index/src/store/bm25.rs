//! BM25 keyword index over chunk rows.

use std::collections::{HashMap, HashSet};

/// Term frequency saturation
const K1: f64 = 1.2;
/// Length normalization
const B: f64 = 0.75;

#[derive(Debug, Clone)]
struct Document {
    term_freqs: HashMap<String, usize>,
    length: usize,
}

/// In-memory BM25 index keyed by row id.
#[derive(Debug, Clone, Default)]
pub struct BM25Index {
    documents: HashMap<u64, Document>,
    /// Number of documents containing each term
    doc_freq: HashMap<String, usize>,
    total_length: usize,
}

impl BM25Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowercased alphanumeric terms (underscores kept), single characters dropped.
    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|s| s.chars().count() > 1)
            .map(String::from)
            .collect()
    }

    /// Index `text` under `id`, replacing any previous document with that id.
    pub fn add_document(&mut self, id: u64, text: &str) {
        self.remove_document(id);

        let tokens = Self::tokenize(text);
        let mut term_freqs: HashMap<String, usize> = HashMap::new();
        for token in tokens.iter() {
            *term_freqs.entry(token.clone()).or_insert(0) += 1;
        }
        for term in term_freqs.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }

        self.total_length += tokens.len();
        self.documents.insert(
            id,
            Document {
                term_freqs,
                length: tokens.len(),
            },
        );
    }

    pub fn remove_document(&mut self, id: u64) -> bool {
        let Some(doc) = self.documents.remove(&id) else {
            return false;
        };

        self.total_length -= doc.length;
        for term in doc.term_freqs.keys() {
            if let Some(count) = self.doc_freq.get_mut(term) {
                *count -= 1;
                if *count == 0 {
                    self.doc_freq.remove(term);
                }
            }
        }
        true
    }

    fn avg_doc_length(&self) -> f64 {
        if self.documents.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.documents.len() as f64
        }
    }

    fn idf(&self, term: &str) -> f64 {
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        if df == 0.0 {
            return 0.0;
        }
        let n = self.documents.len() as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn score_document(&self, doc: &Document, query_terms: &[String], avg_len: f64) -> f64 {
        let mut score = 0.0;
        for term in query_terms {
            let tf = doc.term_freqs.get(term).copied().unwrap_or(0) as f64;
            if tf > 0.0 {
                let numerator = tf * (K1 + 1.0);
                let denominator = tf + K1 * (1.0 - B + B * (doc.length as f64 / avg_len));
                score += self.idf(term) * (numerator / denominator);
            }
        }
        score
    }

    /// Rank documents for `query`, best first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(u64, f64)> {
        self.search_filtered(query, limit, |_| true)
    }

    /// Rank only the documents accepted by `keep`. Corpus statistics still
    /// cover the whole index.
    pub fn search_filtered<F>(&self, query: &str, limit: usize, keep: F) -> Vec<(u64, f64)>
    where
        F: Fn(u64) -> bool,
    {
        // Repeated query terms count once.
        let mut seen = HashSet::new();
        let query_terms: Vec<String> = Self::tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();

        if query_terms.is_empty() || self.documents.is_empty() {
            return Vec::new();
        }

        let avg_len = self.avg_doc_length();
        let mut scores: Vec<(u64, f64)> = self
            .documents
            .iter()
            .filter(|(id, _)| keep(**id))
            .map(|(id, doc)| (*id, self.score_document(doc, &query_terms, avg_len)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        // Ties fall back to insertion order so results are deterministic.
        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scores.truncate(limit);
        scores
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn clear(&mut self) {
        self.documents.clear();
        self.doc_freq.clear();
        self.total_length = 0;
    }
}
