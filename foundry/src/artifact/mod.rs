//! Artifact model — the canonical output of the engine.
//!
//! An artifact is an executable unit (function, workflow, plan, or fix)
//! plus its measured metadata. The id is a content hash over
//! `{kind, canonical_source, tool_refs, interface}`; any change produces a
//! new artifact. Quality is derived solely from measured execution
//! outcomes, never from model self-report.

pub mod quality;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Severity};

/// Cap on the per-artifact failure ring buffer. Older entries evict FIFO.
pub const FAILURE_LOG_CAP: usize = 32;

/// Kind of artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Executable function following the stdio JSON contract.
    Function,
    /// Structured multi-step workflow spec.
    Workflow,
    /// Stored plan (overseer output kept for reuse).
    Plan,
    /// Reusable pattern extracted from successful artifacts.
    Pattern,
    /// A confirmed error→patch fix.
    Fix,
    /// Evolved variant of a registered tool.
    ToolVariant,
    /// Candidate flagged for offline fine-tuning datasets.
    FineTuneCandidate,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function => write!(f, "function"),
            Self::Workflow => write!(f, "workflow"),
            Self::Plan => write!(f, "plan"),
            Self::Pattern => write!(f, "pattern"),
            Self::Fix => write!(f, "fix"),
            Self::ToolVariant => write!(f, "tool_variant"),
            Self::FineTuneCandidate => write!(f, "fine_tune_candidate"),
        }
    }
}

/// Semantic type of an interface field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SemType {
    String,
    Int,
    Float,
    Bool,
    Bytes,
    /// Lazy sequence of a single element type.
    Sequence { item: Box<SemType> },
    /// Mapping from key type to value type.
    Mapping { key: Box<SemType>, value: Box<SemType> },
    Set { item: Box<SemType> },
    /// Tagged variant; arms are ordered by name for canonical encoding.
    Variant { arms: BTreeMap<String, SemType> },
}

/// A named, typed interface field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceField {
    pub name: String,
    #[serde(rename = "ty")]
    pub ty: SemType,
    /// Free-form constraint (range, pattern), planner-supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
}

impl InterfaceField {
    pub fn new(name: &str, ty: SemType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            constraints: None,
        }
    }
}

/// Declared inputs and outputs of an artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInterface {
    pub inputs: Vec<InterfaceField>,
    pub outputs: Vec<InterfaceField>,
}

impl ArtifactInterface {
    /// Canonical JSON encoding used in the content hash.
    ///
    /// Struct field order is fixed and variant arms are BTreeMap-sorted,
    /// so the encoding is deterministic.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Last observed test outcome for an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub pass: bool,
    /// Fraction of planner test cases that passed, in [0,1].
    pub coverage: f64,
    pub failing_cases: Vec<String>,
}

impl TestResults {
    pub fn passing(coverage: f64) -> Self {
        Self {
            pass: true,
            coverage,
            failing_cases: Vec::new(),
        }
    }

    pub fn failing(coverage: f64, failing_cases: Vec<String>) -> Self {
        Self {
            pass: false,
            coverage,
            failing_cases,
        }
    }
}

/// One entry in the bounded failure ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    /// Embedding of the scenario that failed, for similarity demotion.
    pub scenario_embedding: Vec<f32>,
    pub error_kind: ErrorKind,
    pub severity: Severity,
    pub at: DateTime<Utc>,
}

/// Parent linkage for evolved artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lineage {
    /// Parent artifact id, when this artifact was derived from another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Short description of what changed relative to the parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_hint: Option<String>,
}

/// A stored artifact with full metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Content hash; never mutated.
    pub id: String,
    pub kind: ArtifactKind,
    /// Logical capability name; many variants share a namespace.
    pub namespace: String,
    /// Monotonic within the namespace.
    pub version: u32,
    /// Canonicalized executable source.
    pub source: String,
    pub interface: ArtifactInterface,
    /// Tool ids this artifact invokes.
    pub tool_refs: Vec<String>,
    pub tags: BTreeSet<String>,
    /// Fixed-dim vector from the embedding backend at ingest; immutable.
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub usage_count: u64,
    pub test_results: Option<TestResults>,
    /// Derived fitness in [0.01, 1.0].
    pub quality_score: f64,
    pub failure_log: VecDeque<FailureEntry>,
    pub lineage: Lineage,
    /// Set when a fitter variant was promoted over this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

impl Artifact {
    /// Record a failure, evicting the oldest entry past the cap.
    pub fn record_failure(&mut self, entry: FailureEntry) {
        if self.failure_log.len() >= FAILURE_LOG_CAP {
            self.failure_log.pop_front();
        }
        self.failure_log.push_back(entry);
    }

    /// Whether this artifact may hold a namespace head.
    ///
    /// An artifact with failing tests is storable but never promotable.
    pub fn promotable(&self) -> bool {
        self.superseded_by.is_none()
            && self.test_results.as_ref().map(|t| t.pass).unwrap_or(false)
    }
}

/// Input to `ArtifactStore::put`: everything the caller knows before the
/// store assigns id, version, and timestamps.
#[derive(Debug, Clone)]
pub struct ArtifactCandidate {
    pub kind: ArtifactKind,
    pub namespace: String,
    pub source: String,
    pub interface: ArtifactInterface,
    pub tool_refs: Vec<String>,
    pub tags: BTreeSet<String>,
    pub embedding: Vec<f32>,
    pub lineage: Lineage,
    pub test_results: Option<TestResults>,
    /// Initial measured quality (from the evaluator).
    pub quality_score: f64,
}

impl ArtifactCandidate {
    /// Materialize into an artifact at the given namespace version.
    pub fn into_artifact(self, version: u32) -> Artifact {
        let source = canonical_source(&self.source);
        let id = content_id(self.kind, &source, &self.tool_refs, &self.interface);
        let now = Utc::now();
        Artifact {
            id,
            kind: self.kind,
            namespace: self.namespace,
            version,
            source,
            interface: self.interface,
            tool_refs: self.tool_refs,
            tags: self.tags,
            embedding: self.embedding,
            created_at: now,
            last_used_at: now,
            usage_count: 0,
            test_results: self.test_results,
            quality_score: quality::clamp(self.quality_score),
            failure_log: VecDeque::new(),
            lineage: self.lineage,
            superseded_by: None,
        }
    }
}

/// Canonicalize source text: right-trim each line, exactly one trailing
/// newline. Idempotent.
pub fn canonical_source(source: &str) -> String {
    let mut out: String = source
        .lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    out.push('\n');
    out
}

/// Content address over `{kind, canonical_source, tool_refs, interface}`.
///
/// `tool_refs` are sorted so reference order never changes the id.
pub fn content_id(
    kind: ArtifactKind,
    canonical_source: &str,
    tool_refs: &[String],
    interface: &ArtifactInterface,
) -> String {
    let mut refs: Vec<&str> = tool_refs.iter().map(|s| s.as_str()).collect();
    refs.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.to_string().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(canonical_source.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(refs.join(",").as_bytes());
    hasher.update(b"\x1f");
    hasher.update(interface.canonical_json().as_bytes());
    format!("art-{}", hasher.finalize().to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_interface() -> ArtifactInterface {
        ArtifactInterface {
            inputs: vec![InterfaceField::new("a", SemType::Int)],
            outputs: vec![InterfaceField::new("result", SemType::Int)],
        }
    }

    fn candidate(source: &str) -> ArtifactCandidate {
        ArtifactCandidate {
            kind: ArtifactKind::Function,
            namespace: "add_integers".into(),
            source: source.into(),
            interface: simple_interface(),
            tool_refs: vec![],
            tags: BTreeSet::from(["math".to_string()]),
            embedding: vec![1.0, 0.0],
            lineage: Lineage::default(),
            test_results: Some(TestResults::passing(1.0)),
            quality_score: 0.8,
        }
    }

    #[test]
    fn test_canonical_source_idempotent() {
        let raw = "def f():  \n    return 1\t\n\n";
        let once = canonical_source(raw);
        let twice = canonical_source(&once);
        assert_eq!(once, twice);
        assert!(once.ends_with('\n'));
        assert!(!once.contains("  \n"));
    }

    #[test]
    fn test_content_id_stable_under_tool_ref_order() {
        let iface = simple_interface();
        let a = content_id(
            ArtifactKind::Function,
            "print(1)\n",
            &["t2".into(), "t1".into()],
            &iface,
        );
        let b = content_id(
            ArtifactKind::Function,
            "print(1)\n",
            &["t1".into(), "t2".into()],
            &iface,
        );
        assert_eq!(a, b);
        assert!(a.starts_with("art-"));
    }

    #[test]
    fn test_content_id_changes_with_kind_and_source() {
        let iface = simple_interface();
        let base = content_id(ArtifactKind::Function, "x\n", &[], &iface);
        assert_ne!(base, content_id(ArtifactKind::Workflow, "x\n", &[], &iface));
        assert_ne!(base, content_id(ArtifactKind::Function, "y\n", &[], &iface));
    }

    #[test]
    fn test_into_artifact_hashes_canonical_source() {
        let art = candidate("print(1)   \n").into_artifact(1);
        assert_eq!(art.source, "print(1)\n");
        assert_eq!(
            art.id,
            content_id(art.kind, &art.source, &art.tool_refs, &art.interface)
        );
        assert_eq!(art.version, 1);
        assert_eq!(art.usage_count, 0);
    }

    #[test]
    fn test_failure_log_capped_fifo() {
        let mut art = candidate("print(1)\n").into_artifact(1);
        for i in 0..(FAILURE_LOG_CAP + 5) {
            art.record_failure(FailureEntry {
                scenario_embedding: vec![i as f32],
                error_kind: ErrorKind::Runtime,
                severity: Severity::Low,
                at: Utc::now(),
            });
        }
        assert_eq!(art.failure_log.len(), FAILURE_LOG_CAP);
        // Oldest entries were evicted.
        assert_eq!(art.failure_log.front().unwrap().scenario_embedding, vec![5.0]);
    }

    #[test]
    fn test_promotable_requires_passing_tests() {
        let mut art = candidate("print(1)\n").into_artifact(1);
        assert!(art.promotable());

        art.test_results = Some(TestResults::failing(0.5, vec!["case 2".into()]));
        assert!(!art.promotable());

        art.test_results = None;
        assert!(!art.promotable());
    }

    #[test]
    fn test_retired_not_promotable() {
        let mut art = candidate("print(1)\n").into_artifact(1);
        art.superseded_by = Some("art-abc".into());
        assert!(!art.promotable());
    }

    #[test]
    fn test_sem_type_serde() {
        let ty = SemType::Mapping {
            key: Box::new(SemType::String),
            value: Box::new(SemType::Sequence {
                item: Box::new(SemType::Int),
            }),
        };
        let json = serde_json::to_string(&ty).unwrap();
        let parsed: SemType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ty);
    }

    #[test]
    fn test_artifact_serde_round_trip() {
        let art = candidate("print(1)\n").into_artifact(3);
        let json = serde_json::to_string(&art).unwrap();
        let parsed: Artifact = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, art.id);
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.tags, art.tags);
    }
}
