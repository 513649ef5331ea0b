//! Fitness-based tool selection.
//!
//! Candidates are the promoted head, same-namespace variants, and
//! semantically similar tools. Base scores (promoted 1.0, variant 0.9,
//! semantic 0.8 × similarity) multiply by live quality, then failure
//! demotion compounds 0.7 per failure similar to the scenario. The result
//! is deterministic for a fixed `(namespace, scenario, registry_state)`.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::{ToolDescriptor, ToolHealth, ToolSet};

/// Similarity above which a logged failure demotes a candidate.
const FAILURE_DEMOTION_THRESHOLD: f32 = 0.7;

/// Demotion factor per similar failure, compounding.
const FAILURE_DEMOTION_FACTOR: f64 = 0.7;

/// At most this many failure entries compound.
const FAILURE_DEMOTION_CAP: usize = 10;

/// Minimum semantic similarity for a cross-namespace candidate.
const SEMANTIC_FLOOR: f32 = 0.5;

/// A scenario the caller wants a tool for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioQuery {
    pub text: String,
    /// Embedding of `text`; absent when the embedding backend is down,
    /// which disables semantic candidates and failure demotion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

/// Selection result.
#[derive(Debug, Clone)]
pub struct SelectedTool {
    pub descriptor: ToolDescriptor,
    pub score: f64,
    /// True when no candidate cleared the `min_usable` floor.
    pub evolution_requested: bool,
}

/// Run the selection algorithm over a snapshot.
pub(super) fn select(
    set: &ToolSet,
    health: &HashMap<String, ToolHealth>,
    namespace: &str,
    scenario: Option<&ScenarioQuery>,
    min_usable: f64,
) -> Option<SelectedTool> {
    let head = set.head_of(namespace);

    // Without a scenario the promoted head answers directly.
    let Some(scenario) = scenario else {
        return head.map(|d| SelectedTool {
            descriptor: d.clone(),
            score: 1.0,
            evolution_requested: false,
        });
    };

    let mut scored: Vec<(&ToolDescriptor, f64)> = Vec::new();
    let head_id = head.map(|d| d.tool_id.as_str());

    for tool in set.all() {
        let base = if Some(tool.tool_id.as_str()) == head_id {
            1.0
        } else if tool.namespace == namespace {
            0.9
        } else {
            // Semantic candidate: requires an embedding on both sides and
            // a tag match when the scenario constrains tags.
            let Some(similarity) = semantic_similarity(tool, scenario) else {
                continue;
            };
            if similarity < SEMANTIC_FLOOR {
                continue;
            }
            if !scenario.tags.is_empty() && scenario.tags.is_disjoint(&tool.tags) {
                continue;
            }
            0.8 * similarity as f64
        };

        let tool_health = health.get(&tool.tool_id).cloned().unwrap_or_default();
        let mut score = base * tool_health.quality_score;
        score *= demotion_factor(&tool_health, scenario);
        scored.push((tool, score));
    }

    // Highest score wins; ties break deterministically by tool id.
    scored.sort_by(|(ta, sa), (tb, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ta.tool_id.cmp(&tb.tool_id))
    });

    let (best, score) = scored.first()?;
    Some(SelectedTool {
        descriptor: (*best).clone(),
        score: *score,
        evolution_requested: *score < min_usable,
    })
}

fn semantic_similarity(tool: &ToolDescriptor, scenario: &ScenarioQuery) -> Option<f32> {
    let tool_vec = tool.embedding.as_ref()?;
    let query_vec = scenario.embedding.as_ref()?;
    Some(cosine(tool_vec, query_vec))
}

/// Compound 0.7 for each logged failure similar to the scenario.
fn demotion_factor(health: &ToolHealth, scenario: &ScenarioQuery) -> f64 {
    let Some(query_vec) = scenario.embedding.as_ref() else {
        return 1.0;
    };
    let similar_failures = health
        .failure_log
        .iter()
        .filter(|f| cosine(&f.scenario_embedding, query_vec) >= FAILURE_DEMOTION_THRESHOLD)
        .take(FAILURE_DEMOTION_CAP)
        .count();
    FAILURE_DEMOTION_FACTOR.powi(similar_failures as i32)
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    (dot / (na * nb)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, Severity};
    use crate::tools::{tests::descriptor, ToolFailure, ToolRegistry};
    use chrono::Utc;

    fn scenario(embedding: Vec<f32>) -> ScenarioQuery {
        ScenarioQuery {
            text: "translate english to french".into(),
            embedding: Some(embedding),
            tags: BTreeSet::new(),
        }
    }

    #[test]
    fn test_promoted_head_outranks_variant() {
        let registry = ToolRegistry::new(
            crate::tools::ToolSet::from_descriptors(vec![
                descriptor("head", "translator", true),
                descriptor("variant", "translator", false),
            ]),
            0.40,
            None,
        );
        let selected = registry
            .get("translator", Some(&scenario(vec![1.0, 0.0])))
            .unwrap();
        assert_eq!(selected.descriptor.tool_id, "head");
        // 1.0 base × 0.8 default quality.
        assert!((selected.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_failure_demotion_flips_selection() {
        let registry = ToolRegistry::new(
            crate::tools::ToolSet::from_descriptors(vec![
                descriptor("head", "translator", true),
                descriptor("variant", "translator", false),
            ]),
            0.40,
            None,
        );
        // Two failures on the head, both similar to the scenario:
        // head 1.0×0.8×(0.7²)−ish vs variant 0.9×0.8. The failure also
        // demotes quality, compounding the drop.
        let query = vec![1.0, 0.0];
        registry.record_failure("head", query.clone(), ErrorKind::Runtime, Severity::Low);
        registry.record_failure("head", query.clone(), ErrorKind::Runtime, Severity::Low);

        let selected = registry.get("translator", Some(&scenario(query))).unwrap();
        assert_eq!(selected.descriptor.tool_id, "variant");
    }

    #[test]
    fn test_dissimilar_failures_do_not_demote() {
        let health = ToolHealth {
            quality_score: 0.8,
            failure_log: vec![ToolFailure {
                scenario_embedding: vec![0.0, 1.0],
                error_kind: ErrorKind::Runtime,
                severity: Severity::Low,
                at: Utc::now(),
            }]
            .into(),
            success_count: 0,
        };
        let factor = demotion_factor(&health, &scenario(vec![1.0, 0.0]));
        assert!((factor - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_demotion_compounds_and_caps() {
        let failures = (0..15)
            .map(|_| ToolFailure {
                scenario_embedding: vec![1.0, 0.0],
                error_kind: ErrorKind::Runtime,
                severity: Severity::Low,
                at: Utc::now(),
            })
            .collect();
        let health = ToolHealth {
            quality_score: 0.8,
            failure_log: failures,
            success_count: 0,
        };
        let factor = demotion_factor(&health, &scenario(vec![1.0, 0.0]));
        // Capped at 10 compounding entries.
        assert!((factor - FAILURE_DEMOTION_FACTOR.powi(10)).abs() < 1e-9);
    }

    #[test]
    fn test_semantic_candidate_from_other_namespace() {
        let mut other = descriptor("semantic", "summarizer", true);
        other.embedding = Some(vec![1.0, 0.0]);
        let registry = ToolRegistry::new(
            crate::tools::ToolSet::from_descriptors(vec![other]),
            0.40,
            None,
        );
        // No tool in the queried namespace; the semantic match is found.
        let selected = registry
            .get("translator", Some(&scenario(vec![1.0, 0.0])))
            .unwrap();
        assert_eq!(selected.descriptor.tool_id, "semantic");
        // 0.8 × 1.0 similarity × 0.8 quality.
        assert!((selected.score - 0.64).abs() < 1e-6);
    }

    #[test]
    fn test_no_embedding_disables_semantic_candidates() {
        let mut other = descriptor("semantic", "summarizer", true);
        other.embedding = Some(vec![1.0, 0.0]);
        let registry = ToolRegistry::new(
            crate::tools::ToolSet::from_descriptors(vec![other]),
            0.40,
            None,
        );
        let no_embedding = ScenarioQuery {
            text: "translate".into(),
            embedding: None,
            tags: BTreeSet::new(),
        };
        assert!(registry.get("translator", Some(&no_embedding)).is_none());
    }

    #[test]
    fn test_low_scores_flag_evolution() {
        let registry = ToolRegistry::new(
            crate::tools::ToolSet::from_descriptors(vec![descriptor(
                "head",
                "translator",
                true,
            )]),
            0.40,
            None,
        );
        // Crush the quality so even the head scores under min_usable.
        for _ in 0..7 {
            registry.record_failure("head", vec![], ErrorKind::Runtime, Severity::High);
        }
        let selected = registry
            .get("translator", Some(&scenario(vec![1.0, 0.0])))
            .unwrap();
        assert!(selected.evolution_requested);
    }

    #[test]
    fn test_selection_deterministic() {
        let registry = ToolRegistry::new(
            crate::tools::ToolSet::from_descriptors(vec![
                descriptor("a", "translator", false),
                descriptor("b", "translator", false),
            ]),
            0.40,
            None,
        );
        let first = registry
            .get("translator", Some(&scenario(vec![1.0, 0.0])))
            .unwrap();
        let second = registry
            .get("translator", Some(&scenario(vec![1.0, 0.0])))
            .unwrap();
        // Equal scores tie-break by tool id, stably.
        assert_eq!(first.descriptor.tool_id, "a");
        assert_eq!(second.descriptor.tool_id, "a");
    }
}
