// Copyright 2025 Memoria Contributors (https://github.com/memoria-db/memoria)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Similarity metrics for the fuzzy and semantic strategies.
//!
//! TF-IDF vectors are sparse maps over the candidate corpus; embeddings are
//! dense f32 vectors produced by an external collaborator and consumed
//! opaquely.

use std::collections::{HashMap, HashSet};

/// Lowercased alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// A TF-IDF model fitted over one candidate corpus.
#[derive(Debug, Default)]
pub struct TfIdf {
    idf: HashMap<String, f64>,
    doc_count: usize,
}

impl TfIdf {
    /// Fit inverse document frequencies over the tokenized corpus.
    pub fn fit(documents: &[Vec<String>]) -> Self {
        let doc_count = documents.len();
        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        for tokens in documents {
            let unique: HashSet<&String> = tokens.iter().collect();
            for token in unique {
                *document_frequency.entry(token.clone()).or_insert(0) += 1;
            }
        }
        let idf = document_frequency
            .into_iter()
            .map(|(token, df)| {
                let idf = ((doc_count as f64 + 1.0) / (df as f64 + 1.0)).ln() + 1.0;
                (token, idf)
            })
            .collect();
        Self { idf, doc_count }
    }

    pub fn corpus_size(&self) -> usize {
        self.doc_count
    }

    /// Sparse TF-IDF vector for one document.
    pub fn vector(&self, tokens: &[String]) -> HashMap<String, f64> {
        if tokens.is_empty() {
            return HashMap::new();
        }
        let mut term_frequency: HashMap<&String, f64> = HashMap::new();
        for token in tokens {
            *term_frequency.entry(token).or_insert(0.0) += 1.0;
        }
        let total = tokens.len() as f64;
        term_frequency
            .into_iter()
            .filter_map(|(token, count)| {
                self.idf
                    .get(token)
                    .map(|idf| (token.clone(), (count / total) * idf))
            })
            .collect()
    }

    /// Cosine similarity between two sparse vectors.
    pub fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        let dot: f64 = small
            .iter()
            .filter_map(|(token, weight)| large.get(token).map(|other| weight * other))
            .sum();
        let norm_a: f64 = a.values().map(|w| w * w).sum::<f64>().sqrt();
        let norm_b: f64 = b.values().map(|w| w * w).sum::<f64>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

/// Jaccard similarity over token sets.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let set_a: HashSet<&String> = a.iter().collect();
    let set_b: HashSet<&String> = b.iter().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Levenshtein distance normalized to a [0, 1] similarity.
pub fn normalized_levenshtein(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    1.0 - previous[b.len()] as f64 / max_len as f64
}

/// Cosine similarity over dense vectors. Returns 0 for mismatched or empty
/// dimensions.
pub fn cosine_f32(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

/// Decode an opaque embedding blob: little-endian f32s. A trailing partial
/// float is ignored.
pub fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Hello, World! 42"),
            vec!["hello".to_string(), "world".to_string(), "42".to_string()]
        );
        assert!(tokenize("...").is_empty());
    }

    #[test]
    fn identical_documents_have_cosine_one() {
        let docs = vec![tokenize("the cat sat on the mat"), tokenize("dogs bark loudly")];
        let model = TfIdf::fit(&docs);
        let a = model.vector(&docs[0]);
        let b = model.vector(&docs[0]);
        assert!((TfIdf::cosine(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unrelated_documents_have_low_cosine() {
        let docs = vec![
            tokenize("the cat sat on the mat"),
            tokenize("quarterly revenue grew nine percent"),
        ];
        let model = TfIdf::fit(&docs);
        let a = model.vector(&docs[0]);
        let b = model.vector(&docs[1]);
        assert!(TfIdf::cosine(&a, &b) < 0.1);
    }

    #[test]
    fn jaccard_bounds() {
        let a = tokenize("one two three");
        let b = tokenize("two three four");
        let sim = jaccard(&a, &b);
        assert!(sim > 0.4 && sim < 0.6);
        assert_eq!(jaccard(&a, &a), 1.0);
        assert_eq!(jaccard(&[], &[]), 1.0);
    }

    #[test]
    fn levenshtein_similarity() {
        assert_eq!(normalized_levenshtein("kitten", "kitten"), 1.0);
        assert!(normalized_levenshtein("kitten", "sitting") > 0.5);
        assert_eq!(normalized_levenshtein("", ""), 1.0);
        assert_eq!(normalized_levenshtein("abc", ""), 0.0);
    }

    #[test]
    fn dense_cosine_and_embedding_decode() {
        let a = [1.0f32, 0.0, 0.0];
        let b = [1.0f32, 0.0, 0.0];
        let c = [0.0f32, 1.0, 0.0];
        assert!((cosine_f32(&a, &b) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_f32(&a, &c), 0.0);
        assert_eq!(cosine_f32(&a, &[1.0]), 0.0);

        let blob: Vec<u8> = [0.5f32, -2.0].iter().flat_map(|f| f.to_le_bytes()).collect();
        assert_eq!(decode_embedding(&blob), vec![0.5, -2.0]);
    }
}
