//! Identity catalog and closest-match search.

use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Result of matching one embedding against the catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityMatch {
    Known { identity: String, score: f32 },
    Unknown { score: f32 },
}

impl IdentityMatch {
    pub fn identity(&self) -> Option<&str> {
        match self {
            IdentityMatch::Known { identity, .. } => Some(identity),
            IdentityMatch::Unknown { .. } => None,
        }
    }

    pub fn score(&self) -> f32 {
        match self {
            IdentityMatch::Known { score, .. } | IdentityMatch::Unknown { score } => *score,
        }
    }
}

/// Known identities with their reference embeddings.
///
/// Immutable after load and shared read-only across feeds.
#[derive(Debug, Clone, Default)]
pub struct IdentityCatalog {
    keys: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    norms: Vec<f32>,
    names: HashMap<String, String>,
}

impl IdentityCatalog {
    /// Build a catalog from `(identity, embedding)` pairs.
    ///
    /// The catalog dimension is the most common non-empty embedding length,
    /// earliest first on ties. Entries of any other length are dropped.
    pub fn new(entries: impl IntoIterator<Item = (String, Vec<f32>)>) -> Self {
        let entries: Vec<(String, Vec<f32>)> = entries.into_iter().collect();
        let dimension = dominant_length(entries.iter().map(|(_, embedding)| embedding.len()));

        let mut catalog = Self::default();
        for (identity, embedding) in entries {
            if Some(embedding.len()) != dimension {
                warn!(
                    identity = %identity,
                    len = embedding.len(),
                    expected = dimension.unwrap_or(0),
                    "Dropping catalog entry with mismatched embedding length"
                );
                continue;
            }
            catalog.norms.push(l2_norm(&embedding));
            catalog.keys.push(identity);
            catalog.embeddings.push(embedding);
        }

        catalog
    }

    /// Build a catalog from the JSON features document.
    ///
    /// Values may be nested arrays; they are flattened in row-major order.
    pub fn from_features_json(features: &serde_json::Map<String, Value>) -> Self {
        Self::new(features.iter().map(|(identity, value)| {
            let mut flat = Vec::new();
            flatten_numbers(value, &mut flat);
            (identity.clone(), flat)
        }))
    }

    /// Attach display names used in log output.
    pub fn with_names(mut self, names: HashMap<String, String>) -> Self {
        self.names = names;
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn display_name(&self, identity: &str) -> Option<&str> {
        self.names.get(identity).map(String::as_str)
    }

    /// Find the most similar identity by cosine similarity.
    ///
    /// Returns `Unknown` when the catalog is empty or the best score is below
    /// `threshold`. Ties resolve to the earliest entry.
    pub fn best_match(&self, embedding: &[f32], threshold: f32) -> IdentityMatch {
        let query_norm = l2_norm(embedding);
        if query_norm == 0.0 {
            return IdentityMatch::Unknown { score: 0.0 };
        }

        let mut best: Option<(usize, f32)> = None;
        for (index, reference) in self.embeddings.iter().enumerate() {
            if reference.len() != embedding.len() || self.norms[index] == 0.0 {
                continue;
            }
            let dot: f32 = reference.iter().zip(embedding).map(|(a, b)| a * b).sum();
            let score = dot / (self.norms[index] * query_norm);
            if best.map_or(true, |(_, current)| score > current) {
                best = Some((index, score));
            }
        }

        match best {
            Some((index, score)) if score >= threshold => IdentityMatch::Known {
                identity: self.keys[index].clone(),
                score,
            },
            Some((_, score)) => IdentityMatch::Unknown { score },
            None => IdentityMatch::Unknown { score: 0.0 },
        }
    }
}

fn dominant_length(lengths: impl Iterator<Item = usize>) -> Option<usize> {
    let mut counts: Vec<(usize, usize)> = Vec::new();
    for len in lengths.filter(|&len| len > 0) {
        match counts.iter_mut().find(|(seen, _)| *seen == len) {
            Some((_, count)) => *count += 1,
            None => counts.push((len, 1)),
        }
    }

    let mut best: Option<(usize, usize)> = None;
    for (len, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((len, count));
        }
    }
    best.map(|(len, _)| len)
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn flatten_numbers(value: &Value, out: &mut Vec<f32>) {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                out.push(f as f32);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| flatten_numbers(item, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> IdentityCatalog {
        IdentityCatalog::new(vec![
            ("U1".to_string(), vec![1.0, 0.0, 0.0]),
            ("U2".to_string(), vec![0.0, 1.0, 0.0]),
        ])
    }

    #[test]
    fn test_best_match_above_threshold() {
        let result = catalog().best_match(&[0.9, 0.1, 0.0], 0.5);
        assert_eq!(result.identity(), Some("U1"));
        assert!(result.score() > 0.9);
    }

    #[test]
    fn test_best_match_below_threshold_is_unknown() {
        let result = catalog().best_match(&[0.0, 0.0, 1.0], 0.5);
        assert_eq!(result.identity(), None);
        assert_eq!(result.score(), 0.0);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let result = catalog().best_match(&[1.0, 0.0, 0.0], 1.0);
        assert_eq!(result.identity(), Some("U1"));
    }

    #[test]
    fn test_empty_catalog_never_matches() {
        let result = IdentityCatalog::default().best_match(&[1.0, 0.0], 0.0);
        assert_eq!(result, IdentityMatch::Unknown { score: 0.0 });
    }

    #[test]
    fn test_nested_features_are_flattened() {
        let features: serde_json::Map<String, Value> =
            serde_json::from_str(r#"{"U1": [[1.0, 0.0], [0.0, 0.0]], "U2": [[0, 1], [0, 0]]}"#)
                .unwrap();
        let catalog = IdentityCatalog::from_features_json(&features);
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.best_match(&[0.0, 2.0, 0.0, 0.0], 0.5).identity(),
            Some("U2")
        );
    }

    #[test]
    fn test_mismatched_dimension_dropped() {
        let catalog = IdentityCatalog::new(vec![
            ("U1".to_string(), vec![1.0, 0.0]),
            ("U2".to_string(), vec![1.0, 0.0, 0.0]),
        ]);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_empty_entry_does_not_fix_dimension() {
        let features: serde_json::Map<String, Value> =
            serde_json::from_str(r#"{"A0": [], "U1": [1.0, 0.0], "U2": [0.0, 1.0]}"#).unwrap();
        let catalog = IdentityCatalog::from_features_json(&features);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.best_match(&[0.0, 1.0], 0.5).identity(), Some("U2"));
    }

    #[test]
    fn test_short_first_entry_is_outvoted() {
        let catalog = IdentityCatalog::new(vec![
            ("A0".to_string(), vec![1.0]),
            ("U1".to_string(), vec![1.0, 0.0]),
            ("U2".to_string(), vec![0.0, 1.0]),
        ]);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.best_match(&[1.0], 0.0).identity(), None);
    }

    #[test]
    fn test_display_names() {
        let catalog = catalog().with_names(HashMap::from([(
            "U1".to_string(),
            "Ada".to_string(),
        )]));
        assert_eq!(catalog.display_name("U1"), Some("Ada"));
        assert_eq!(catalog.display_name("U2"), None);
    }
}
