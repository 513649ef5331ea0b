//! Artifact store — durable, content-addressed memory of executable
//! artifacts with tag, vector, and namespace-head indexes.
//!
//! `put` is idempotent on the content id and updates every index before
//! returning, so a `find_similar` issued after a `put` always reflects it
//! (read-your-writes). Persistence failures degrade the store to
//! memory-only for the affected operation; callers observe `degraded()`.

pub mod heads;
pub mod persist;
pub mod tags;
pub mod vector;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use chrono::Utc;
use tracing::warn;

use crate::artifact::{
    quality, Artifact, ArtifactCandidate, ArtifactKind, FailureEntry, TestResults,
};
use crate::artifact::quality::QualityEvidence;
use heads::HeadMap;
use persist::{StorePersistence, VectorEntry, VectorSidecar};
use tags::TagIndex;
use vector::VectorIndex;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store format incompatible: found version {found}, expected {expected}")]
    Incompatible { found: u32, expected: u32 },

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("embedding dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("artifact {id} is not promotable: {reason}")]
    NotPromotable { id: String, reason: String },

    #[error("head swap conflict in namespace '{namespace}'")]
    HeadConflict { namespace: String },

    #[error("lock poisoned")]
    LockPoisoned,
}

impl From<StoreError> for crate::error::EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Incompatible { found, expected } => {
                crate::error::EngineError::StorageIncompatible { found, expected }
            }
            other => crate::error::EngineError::StorageUnavailable(other.to_string()),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub id: String,
    /// False when the content id already existed.
    pub created: bool,
    /// False when the artifact was served memory-only.
    pub persisted: bool,
}

/// Outcome of a promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionOutcome {
    /// Previous head, now retired with `superseded_by` set.
    pub previous: Option<String>,
}

/// Query for `find_similar`.
#[derive(Debug, Clone)]
pub struct SimilarityQuery {
    pub embedding: Vec<f32>,
    /// Restrict to these kinds; empty means any.
    pub kinds: Vec<ArtifactKind>,
    /// Require all of these tags; empty means any.
    pub tags: BTreeSet<String>,
    pub top_k: usize,
    /// Minimum raw similarity for inclusion.
    pub min_score: f32,
    /// Include artifacts already superseded by a fitter variant.
    pub include_retired: bool,
}

impl SimilarityQuery {
    pub fn new(embedding: Vec<f32>, top_k: usize) -> Self {
        Self {
            embedding,
            kinds: Vec::new(),
            tags: BTreeSet::new(),
            top_k,
            min_score: 0.0,
            include_retired: false,
        }
    }

    pub fn with_kinds(mut self, kinds: &[ArtifactKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }
}

struct StoreInner {
    artifacts: HashMap<String, Artifact>,
    tags: TagIndex,
    vectors: VectorIndex,
    heads: HeadMap,
    /// Highest assigned version per namespace.
    versions: HashMap<String, u32>,
}

/// The artifact store.
pub struct ArtifactStore {
    inner: RwLock<StoreInner>,
    persistence: Option<StorePersistence>,
    degraded: AtomicBool,
}

impl ArtifactStore {
    /// Open a persistent store, loading existing artifacts and indexes.
    pub fn open(path: impl Into<PathBuf>, embedding_dim: usize) -> StoreResult<Self> {
        let persistence = StorePersistence::open(path)?;
        persistence.check_vectors()?;

        let artifacts = persistence.load_artifacts()?;
        let head_pairs = persistence.load_heads()?;

        let mut inner = StoreInner {
            artifacts: HashMap::new(),
            tags: TagIndex::new(),
            vectors: VectorIndex::new(embedding_dim),
            heads: HeadMap::from_pairs(head_pairs),
            versions: HashMap::new(),
        };
        for artifact in artifacts {
            inner.tags.insert(&artifact.id, &artifact.tags);
            inner.vectors.insert(&artifact.id, &artifact.embedding)?;
            let v = inner.versions.entry(artifact.namespace.clone()).or_insert(0);
            *v = (*v).max(artifact.version);
            inner.artifacts.insert(artifact.id.clone(), artifact);
        }

        Ok(Self {
            inner: RwLock::new(inner),
            persistence: Some(persistence),
            degraded: AtomicBool::new(false),
        })
    }

    /// Memory-only store (used under storage degradation and in tests).
    pub fn in_memory(embedding_dim: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                artifacts: HashMap::new(),
                tags: TagIndex::new(),
                vectors: VectorIndex::new(embedding_dim),
                heads: HeadMap::new(),
                versions: HashMap::new(),
            }),
            persistence: None,
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether any persistence failure has been observed.
    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> Option<&Path> {
        self.persistence.as_ref().map(|p| p.root())
    }

    /// Insert a candidate, assigning id and namespace version.
    ///
    /// Idempotent on the content id. Every index is updated before this
    /// returns, so subsequent reads in the same request see the artifact.
    pub fn put(&self, candidate: ArtifactCandidate) -> StoreResult<PutOutcome> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;

        let namespace = candidate.namespace.clone();
        let next_version = inner.versions.get(&namespace).copied().unwrap_or(0) + 1;
        let artifact = candidate.into_artifact(next_version);
        let id = artifact.id.clone();

        if inner.artifacts.contains_key(&id) {
            return Ok(PutOutcome {
                id,
                created: false,
                persisted: true,
            });
        }

        inner.tags.insert(&id, &artifact.tags);
        inner.vectors.insert(&id, &artifact.embedding)?;
        inner.versions.insert(namespace, next_version);
        inner.artifacts.insert(id.clone(), artifact);

        let persisted = self.persist_artifact_and_indexes(&inner, &id);
        Ok(PutOutcome {
            id,
            created: true,
            persisted,
        })
    }

    pub fn get(&self, id: &str) -> Option<Artifact> {
        self.inner.read().ok()?.artifacts.get(id).cloned()
    }

    /// Artifacts carrying all of `tags`, most recently used first.
    pub fn find_by_tags(&self, tags: &BTreeSet<String>, limit: usize) -> Vec<Artifact> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let ids = inner.tags.ids_matching_all(tags);
        let mut hits: Vec<Artifact> = ids
            .iter()
            .filter_map(|id| inner.artifacts.get(id).cloned())
            .collect();
        hits.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        hits.truncate(limit);
        hits
    }

    /// Nearest artifacts by cosine similarity, ranked by
    /// `similarity × quality_score`; ties break by quality then recency.
    pub fn find_similar(&self, query: &SimilarityQuery) -> Vec<(Artifact, f32)> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let sims = inner.vectors.similarities(&query.embedding);
        let mut hits: Vec<(Artifact, f32)> = sims
            .into_iter()
            .filter(|(_, sim)| *sim >= query.min_score)
            .filter_map(|(id, sim)| inner.artifacts.get(&id).map(|a| (a.clone(), sim)))
            .filter(|(a, _)| query.include_retired || a.superseded_by.is_none())
            .filter(|(a, _)| query.kinds.is_empty() || query.kinds.contains(&a.kind))
            .filter(|(a, _)| query.tags.is_empty() || query.tags.is_subset(&a.tags))
            .collect();

        hits.sort_by(|(a, sa), (b, sb)| {
            let ra = *sa as f64 * a.quality_score;
            let rb = *sb as f64 * b.quality_score;
            rb.partial_cmp(&ra)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.quality_score
                        .partial_cmp(&a.quality_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.last_used_at.cmp(&a.last_used_at))
        });
        hits.truncate(query.top_k);
        hits
    }

    /// Increment usage and touch recency.
    pub fn update_usage(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        let artifact = inner
            .artifacts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        artifact.usage_count += 1;
        artifact.last_used_at = Utc::now();
        self.persist_artifact_and_indexes(&inner, id);
        Ok(())
    }

    /// Apply measured evidence to an artifact's quality score.
    ///
    /// Returns the new score. Passing evidence also refreshes
    /// `test_results`; failing evidence marks them failing.
    pub fn update_quality(&self, id: &str, evidence: &QualityEvidence) -> StoreResult<f64> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        let artifact = inner
            .artifacts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let stored_coverage = artifact
            .test_results
            .as_ref()
            .filter(|t| t.pass)
            .map(|t| t.coverage)
            .unwrap_or(0.0);
        let next = quality::apply_evidence(
            artifact.quality_score,
            stored_coverage,
            evidence,
            artifact.failure_log.len(),
        );
        artifact.quality_score = next;
        if evidence.test_pass {
            artifact.test_results = Some(TestResults::passing(evidence.coverage));
        } else if let Some(results) = artifact.test_results.as_mut() {
            results.pass = false;
        } else {
            artifact.test_results = Some(TestResults::failing(evidence.coverage, Vec::new()));
        }

        self.persist_artifact_and_indexes(&inner, id);
        Ok(next)
    }

    /// Append to the artifact's bounded failure log.
    pub fn record_failure(&self, id: &str, entry: FailureEntry) -> StoreResult<()> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        let artifact = inner
            .artifacts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        artifact.record_failure(entry);
        self.persist_artifact_and_indexes(&inner, id);
        Ok(())
    }

    /// Promote `id` as the head of `namespace`. The previous head is
    /// retired with `superseded_by` pointing at the new head.
    pub fn promote(&self, namespace: &str, id: &str) -> StoreResult<PromotionOutcome> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;

        let artifact = inner
            .artifacts
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if artifact.namespace != namespace {
            return Err(StoreError::NotPromotable {
                id: id.to_string(),
                reason: format!("belongs to namespace '{}'", artifact.namespace),
            });
        }
        if !artifact.promotable() {
            return Err(StoreError::NotPromotable {
                id: id.to_string(),
                reason: "tests not passing or already superseded".to_string(),
            });
        }

        let previous = inner.heads.get(namespace).map(|s| s.to_string());
        if previous.as_deref() == Some(id) {
            return Ok(PromotionOutcome { previous: None });
        }
        inner
            .heads
            .compare_and_set(namespace, previous.as_deref(), id)
            .map_err(|_| StoreError::HeadConflict {
                namespace: namespace.to_string(),
            })?;

        if let Some(prev_id) = &previous {
            if let Some(prev) = inner.artifacts.get_mut(prev_id) {
                prev.superseded_by = Some(id.to_string());
            }
        }

        self.persist_artifact_and_indexes(&inner, id);
        if let Some(prev_id) = &previous {
            self.persist_artifact_and_indexes(&inner, prev_id);
        }
        Ok(PromotionOutcome { previous })
    }

    /// Mark an artifact as superseded without touching the head map.
    pub fn retire(&self, id: &str, superseded_by: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        let artifact = inner
            .artifacts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        artifact.superseded_by = Some(superseded_by.to_string());
        self.persist_artifact_and_indexes(&inner, id);
        Ok(())
    }

    /// Promoted head of a namespace, when present.
    pub fn head(&self, namespace: &str) -> Option<Artifact> {
        let inner = self.inner.read().ok()?;
        let id = inner.heads.get(namespace)?;
        inner.artifacts.get(id).cloned()
    }

    /// All `(namespace, head id)` pairs, sorted.
    pub fn heads(&self) -> Vec<(String, String)> {
        self.inner
            .read()
            .map(|inner| inner.heads.export())
            .unwrap_or_default()
    }

    /// Every artifact in a namespace, newest version first.
    pub fn artifacts_in_namespace(&self, namespace: &str) -> Vec<Artifact> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let mut out: Vec<Artifact> = inner
            .artifacts
            .values()
            .filter(|a| a.namespace == namespace)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.version.cmp(&a.version));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.artifacts.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wipe the store, memory and disk.
    pub fn clear(&self) -> StoreResult<()> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        let dim = inner.vectors.dim();
        inner.artifacts.clear();
        inner.tags = TagIndex::new();
        inner.vectors = VectorIndex::new(dim);
        inner.heads = HeadMap::new();
        inner.versions.clear();
        if let Some(p) = &self.persistence {
            p.wipe()?;
        }
        Ok(())
    }

    /// Best-effort persistence of one artifact plus the index files.
    /// Failures degrade the store to memory-only and are logged, not
    /// surfaced — the request is still served.
    fn persist_artifact_and_indexes(&self, inner: &StoreInner, id: &str) -> bool {
        let Some(p) = &self.persistence else {
            return false;
        };
        let result = (|| -> StoreResult<()> {
            if let Some(artifact) = inner.artifacts.get(id) {
                p.save_artifact(artifact)?;
            }
            p.save_tags(&inner.tags.export())?;
            p.save_heads(&inner.heads.export())?;
            p.save_vectors(&VectorSidecar {
                dim: inner.vectors.dim(),
                entries: inner
                    .vectors
                    .entries()
                    .iter()
                    .map(|(id, v)| VectorEntry {
                        id: id.clone(),
                        embedding: v.clone(),
                    })
                    .collect(),
            })?;
            Ok(())
        })();
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(artifact = id, error = %e, "store persistence failed, serving memory-only");
                self.degraded.store(true, Ordering::Relaxed);
                false
            }
        }
    }
}
