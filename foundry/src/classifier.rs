//! Task classifier — SAME / RELATED / DIFFERENT against the store.
//!
//! Purely a retrieval decision: the classifier embeds nothing itself and
//! never executes artifacts. Given fixed thresholds and fixed embeddings
//! the decision is deterministic.

use serde::{Deserialize, Serialize};

use crate::store::{ArtifactStore, SimilarityQuery};
use crate::artifact::ArtifactKind;

/// Reuse decision for an incoming task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReuseDecision {
    /// Run the stored reference directly.
    Same,
    /// Plan as a diff from the reference.
    Related,
    /// Generate from scratch.
    Different,
}

impl std::fmt::Display for ReuseDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Same => write!(f, "same"),
            Self::Related => write!(f, "related"),
            Self::Different => write!(f, "different"),
        }
    }
}

/// Classifier thresholds, surfaced in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierThresholds {
    /// Similarity at or above which a hit can be SAME.
    pub same: f32,
    /// Similarity at or above which a hit is RELATED.
    pub related: f32,
    /// Minimum quality for a SAME hit; poorer references only relate.
    pub min_same_quality: f64,
    /// How many nearest artifacts to inspect.
    pub top_k: usize,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            same: 0.92,
            related: 0.75,
            min_same_quality: 0.70,
            top_k: 5,
        }
    }
}

/// Classification result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub decision: ReuseDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    pub similarity: f32,
}

impl Classification {
    fn different(similarity: f32) -> Self {
        Self {
            decision: ReuseDecision::Different,
            reference_id: None,
            similarity,
        }
    }
}

/// The classifier.
#[derive(Debug, Clone, Default)]
pub struct TaskClassifier {
    thresholds: ClassifierThresholds,
}

impl TaskClassifier {
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self { thresholds }
    }

    /// Classify a task embedding against stored function and workflow
    /// artifacts.
    ///
    /// A missing embedding (backend unavailable) is DIFFERENT with zero
    /// similarity; downstream proceeds without reuse.
    pub fn classify(
        &self,
        task_embedding: Option<&[f32]>,
        store: &ArtifactStore,
    ) -> Classification {
        let Some(embedding) = task_embedding else {
            return Classification::different(0.0);
        };

        let hits = store.find_similar(
            &SimilarityQuery::new(embedding.to_vec(), self.thresholds.top_k)
                .with_kinds(&[ArtifactKind::Function, ArtifactKind::Workflow]),
        );
        if hits.is_empty() {
            return Classification::different(0.0);
        }

        // Best raw similarity and best quality are taken independently
        // over the top-k; ties on similarity break by quality then
        // recency (the store's ordering already encodes the tail).
        let best_similarity = hits.iter().map(|(_, s)| *s).fold(f32::MIN, f32::max);
        let best_quality = hits
            .iter()
            .map(|(a, _)| a.quality_score)
            .fold(f64::MIN, f64::max);
        let reference = hits
            .iter()
            .filter(|(_, s)| (*s - best_similarity).abs() < f32::EPSILON)
            .max_by(|(a, _), (b, _)| {
                a.quality_score
                    .partial_cmp(&b.quality_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.last_used_at.cmp(&b.last_used_at))
            })
            .map(|(a, _)| a.id.clone());

        if best_similarity >= self.thresholds.same
            && best_quality >= self.thresholds.min_same_quality
        {
            return Classification {
                decision: ReuseDecision::Same,
                reference_id: reference,
                similarity: best_similarity,
            };
        }
        if best_similarity >= self.thresholds.related {
            return Classification {
                decision: ReuseDecision::Related,
                reference_id: reference,
                similarity: best_similarity,
            };
        }
        Classification::different(best_similarity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{
        ArtifactCandidate, ArtifactInterface, ArtifactKind, Lineage, TestResults,
    };
    use std::collections::BTreeSet;

    fn store_with(quality: f64, embedding: Vec<f32>) -> ArtifactStore {
        let store = ArtifactStore::in_memory(2);
        store
            .put(ArtifactCandidate {
                kind: ArtifactKind::Function,
                namespace: "add_integers".into(),
                source: "print(2)\n".into(),
                interface: ArtifactInterface::default(),
                tool_refs: vec![],
                tags: BTreeSet::new(),
                embedding,
                lineage: Lineage::default(),
                test_results: Some(TestResults::passing(1.0)),
                quality_score: quality,
            })
            .unwrap();
        store
    }

    #[test]
    fn test_no_embedding_is_different() {
        let store = ArtifactStore::in_memory(2);
        let result = TaskClassifier::default().classify(None, &store);
        assert_eq!(result.decision, ReuseDecision::Different);
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn test_empty_store_is_different() {
        let store = ArtifactStore::in_memory(2);
        let result = TaskClassifier::default().classify(Some(&[1.0, 0.0]), &store);
        assert_eq!(result.decision, ReuseDecision::Different);
    }

    #[test]
    fn test_near_identical_high_quality_is_same() {
        let store = store_with(0.8, vec![1.0, 0.0]);
        let result = TaskClassifier::default().classify(Some(&[1.0, 0.02]), &store);
        assert_eq!(result.decision, ReuseDecision::Same);
        assert!(result.reference_id.is_some());
        assert!(result.similarity >= 0.92);
    }

    #[test]
    fn test_same_similarity_poor_quality_is_not_same() {
        let store = store_with(0.3, vec![1.0, 0.0]);
        let result = TaskClassifier::default().classify(Some(&[1.0, 0.0]), &store);
        // Quality gate fails; similarity band keeps it RELATED.
        assert_eq!(result.decision, ReuseDecision::Related);
    }

    #[test]
    fn test_moderate_similarity_is_related() {
        // cos([1,0],[0.77, 0.638]) ≈ 0.77.
        let store = store_with(0.8, vec![0.77, 0.638]);
        let result = TaskClassifier::default().classify(Some(&[1.0, 0.0]), &store);
        assert_eq!(result.decision, ReuseDecision::Related);
        assert!(result.reference_id.is_some());
        assert!(result.similarity >= 0.75 && result.similarity < 0.92);
    }

    #[test]
    fn test_low_similarity_is_different() {
        let store = store_with(0.9, vec![0.0, 1.0]);
        let result = TaskClassifier::default().classify(Some(&[1.0, 0.0]), &store);
        assert_eq!(result.decision, ReuseDecision::Different);
        assert!(result.reference_id.is_none());
    }

    #[test]
    fn test_deterministic_for_fixed_inputs() {
        let store = store_with(0.8, vec![1.0, 0.0]);
        let classifier = TaskClassifier::default();
        let first = classifier.classify(Some(&[0.9, 0.1]), &store);
        let second = classifier.classify(Some(&[0.9, 0.1]), &store);
        assert_eq!(first.decision, second.decision);
        assert_eq!(first.reference_id, second.reference_id);
        assert_eq!(first.similarity, second.similarity);
    }

    #[test]
    fn test_custom_thresholds() {
        let store = store_with(0.8, vec![0.77, 0.638]);
        let strict = TaskClassifier::new(ClassifierThresholds {
            related: 0.95,
            ..Default::default()
        });
        let result = strict.classify(Some(&[1.0, 0.0]), &store);
        assert_eq!(result.decision, ReuseDecision::Different);
    }
}
