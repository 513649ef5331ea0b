//! Flat cosine vector index.
//!
//! Exact nearest-neighbor scan over unit-normalized embeddings, updated
//! synchronously on every insert so reads always reflect prior writes.
//! `ann_kind` admits future approximate backends; only `flat` exists.

use serde::{Deserialize, Serialize};

use super::StoreError;

/// Supported vector index kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnKind {
    Flat,
}

impl std::str::FromStr for AnnKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flat" => Ok(Self::Flat),
            other => Err(format!("unknown ann_kind '{other}' (supported: flat)")),
        }
    }
}

/// In-memory exact cosine index.
#[derive(Debug)]
pub struct VectorIndex {
    dim: usize,
    /// (id, unit-normalized embedding); zero vectors stay zero.
    entries: Vec<(String, Vec<f32>)>,
}

impl VectorIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace an entry. Rejects dimension mismatches.
    pub fn insert(&mut self, id: &str, embedding: &[f32]) -> Result<(), StoreError> {
        if embedding.len() != self.dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim,
                found: embedding.len(),
            });
        }
        let normalized = normalize(embedding);
        match self.entries.iter_mut().find(|(eid, _)| eid == id) {
            Some(entry) => entry.1 = normalized,
            None => self.entries.push((id.to_string(), normalized)),
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &str) {
        self.entries.retain(|(eid, _)| eid != id);
    }

    /// Cosine similarity of every entry against `query`, clamped to [0,1].
    ///
    /// Unsorted; callers apply their own ranking (e.g. similarity × quality).
    pub fn similarities(&self, query: &[f32]) -> Vec<(String, f32)> {
        let q = normalize(query);
        self.entries
            .iter()
            .map(|(id, v)| (id.clone(), cosine_unit(&q, v)))
            .collect()
    }

    /// Similarity of one entry against `query`, if present.
    pub fn similarity_of(&self, id: &str, query: &[f32]) -> Option<f32> {
        let q = normalize(query);
        self.entries
            .iter()
            .find(|(eid, _)| eid == id)
            .map(|(_, v)| cosine_unit(&q, v))
    }

    /// Export entries for persistence.
    pub fn entries(&self) -> &[(String, Vec<f32>)] {
        &self.entries
    }
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// Dot product of unit vectors, clamped to [0,1]. Negative cosine means
/// "unrelated" for ranking purposes and clamps to zero.
fn cosine_unit(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ann_kind_parse() {
        assert_eq!("flat".parse::<AnnKind>().unwrap(), AnnKind::Flat);
        assert!("hnsw".parse::<AnnKind>().is_err());
    }

    #[test]
    fn test_insert_and_search() {
        let mut idx = VectorIndex::new(2);
        idx.insert("a", &[1.0, 0.0]).unwrap();
        idx.insert("b", &[0.0, 1.0]).unwrap();

        let sims = idx.similarities(&[1.0, 0.0]);
        let a = sims.iter().find(|(id, _)| id == "a").unwrap().1;
        let b = sims.iter().find(|(id, _)| id == "b").unwrap().1;
        assert!((a - 1.0).abs() < 1e-6);
        assert!(b.abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut idx = VectorIndex::new(3);
        let err = idx.insert("a", &[1.0]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch {
                expected: 3,
                found: 1
            }
        ));
    }

    #[test]
    fn test_insert_replaces_existing() {
        let mut idx = VectorIndex::new(2);
        idx.insert("a", &[1.0, 0.0]).unwrap();
        idx.insert("a", &[0.0, 1.0]).unwrap();
        assert_eq!(idx.len(), 1);
        let sim = idx.similarity_of("a", &[0.0, 1.0]).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_negative_cosine_clamps_to_zero() {
        let mut idx = VectorIndex::new(2);
        idx.insert("a", &[1.0, 0.0]).unwrap();
        let sim = idx.similarity_of("a", &[-1.0, 0.0]).unwrap();
        assert_eq!(sim, 0.0);
    }

    #[test]
    fn test_scale_invariance() {
        let mut idx = VectorIndex::new(2);
        idx.insert("a", &[2.0, 2.0]).unwrap();
        let sim = idx.similarity_of("a", &[0.5, 0.5]).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_remove() {
        let mut idx = VectorIndex::new(2);
        idx.insert("a", &[1.0, 0.0]).unwrap();
        idx.remove("a");
        assert!(idx.is_empty());
        assert!(idx.similarity_of("a", &[1.0, 0.0]).is_none());
    }
}
