//! On-disk layout for the artifact store.
//!
//! A single directory holds `artifacts/` (one JSON file per artifact,
//! content-hash-named), `index/tags.json`, `index/heads.json`,
//! `index/vectors.flat`, `fixes/`, and `records/execution.log`. Every
//! index file leads with a `version` field; a mismatch is rejected with
//! `StorageIncompatible` before any other field is read.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::artifact::{quality, Artifact};

/// Current store format version.
pub const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct VersionedIndex<T> {
    version: u32,
    data: T,
}

/// Serialized shape of the vector index sidecar.
#[derive(Serialize, Deserialize)]
pub struct VectorSidecar {
    pub dim: usize,
    pub entries: Vec<VectorEntry>,
}

#[derive(Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: String,
    pub embedding: Vec<f32>,
}

/// Filesystem backend for the store.
#[derive(Debug, Clone)]
pub struct StorePersistence {
    root: PathBuf,
}

impl StorePersistence {
    /// Open (creating the layout when missing) a store directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in ["artifacts", "index", "fixes", "records"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fixes_dir(&self) -> PathBuf {
        self.root.join("fixes")
    }

    pub fn records_path(&self) -> PathBuf {
        self.root.join("records").join("execution.log")
    }

    fn artifact_path(&self, id: &str) -> PathBuf {
        self.root.join("artifacts").join(format!("{id}.json"))
    }

    // ── artifacts ──────────────────────────────────────────────────────

    pub fn save_artifact(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(artifact)
            .map_err(|e| StoreError::Serde(e.to_string()))?;
        fs::write(self.artifact_path(&artifact.id), json)?;
        Ok(())
    }

    /// Load every artifact, normalizing legacy percent-scale quality.
    pub fn load_artifacts(&self) -> Result<Vec<Artifact>, StoreError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.root.join("artifacts"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            let mut artifact: Artifact =
                serde_json::from_str(&raw).map_err(|e| StoreError::Serde(e.to_string()))?;
            artifact.quality_score = quality::normalize_loaded(artifact.quality_score);
            out.push(artifact);
        }
        Ok(out)
    }

    // ── versioned index files ──────────────────────────────────────────

    fn write_index<T: Serialize>(&self, name: &str, data: &T) -> Result<(), StoreError> {
        let wrapped = VersionedIndex {
            version: STORE_FORMAT_VERSION,
            data,
        };
        let json =
            serde_json::to_string(&wrapped).map_err(|e| StoreError::Serde(e.to_string()))?;
        fs::write(self.root.join("index").join(name), json)?;
        Ok(())
    }

    fn read_index<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let path = self.root.join("index").join(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        // Check the version before deserializing the payload.
        let probe: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| StoreError::Serde(e.to_string()))?;
        let found = probe
            .get("version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if found != STORE_FORMAT_VERSION {
            return Err(StoreError::Incompatible {
                found,
                expected: STORE_FORMAT_VERSION,
            });
        }
        let wrapped: VersionedIndex<T> =
            serde_json::from_str(&raw).map_err(|e| StoreError::Serde(e.to_string()))?;
        Ok(Some(wrapped.data))
    }

    pub fn save_tags(&self, pairs: &[(String, Vec<String>)]) -> Result<(), StoreError> {
        self.write_index("tags.json", &pairs)
    }

    pub fn save_heads(&self, pairs: &[(String, String)]) -> Result<(), StoreError> {
        self.write_index("heads.json", &pairs)
    }

    pub fn load_heads(&self) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self.read_index("heads.json")?.unwrap_or_default())
    }

    pub fn save_vectors(&self, sidecar: &VectorSidecar) -> Result<(), StoreError> {
        self.write_index("vectors.flat", sidecar)
    }

    /// Validates the vector sidecar version when present. The in-memory
    /// index itself is rebuilt from artifact embeddings at load.
    pub fn check_vectors(&self) -> Result<(), StoreError> {
        let _: Option<VectorSidecar> = self.read_index("vectors.flat")?;
        Ok(())
    }

    /// Remove everything under the store root.
    pub fn wipe(&self) -> Result<(), StoreError> {
        for sub in ["artifacts", "index", "fixes", "records"] {
            let dir = self.root.join(sub);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    // ── generic JSON helpers (shared with the fix cache) ───────────────

    pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let json =
            serde_json::to_string_pretty(value).map_err(|e| StoreError::Serde(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_json_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            out.push(serde_json::from_str(&raw).map_err(|e| StoreError::Serde(e.to_string()))?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactCandidate, ArtifactInterface, ArtifactKind, Lineage};
    use std::collections::BTreeSet;

    fn sample_artifact() -> Artifact {
        ArtifactCandidate {
            kind: ArtifactKind::Function,
            namespace: "demo".into(),
            source: "print(1)\n".into(),
            interface: ArtifactInterface::default(),
            tool_refs: vec![],
            tags: BTreeSet::new(),
            embedding: vec![1.0, 0.0],
            lineage: Lineage::default(),
            test_results: None,
            quality_score: 0.5,
        }
        .into_artifact(1)
    }

    #[test]
    fn test_layout_created() {
        let dir = tempfile::tempdir().unwrap();
        let p = StorePersistence::open(dir.path()).unwrap();
        assert!(p.root().join("artifacts").is_dir());
        assert!(p.root().join("index").is_dir());
        assert!(p.fixes_dir().is_dir());
        assert!(p.records_path().parent().unwrap().is_dir());
    }

    #[test]
    fn test_artifact_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = StorePersistence::open(dir.path()).unwrap();
        let art = sample_artifact();
        p.save_artifact(&art).unwrap();

        let loaded = p.load_artifacts().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, art.id);
    }

    #[test]
    fn test_percent_quality_normalized_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let p = StorePersistence::open(dir.path()).unwrap();
        let mut art = sample_artifact();
        art.quality_score = 85.0;
        // Bypass the setter path: write raw JSON as a legacy store would.
        StorePersistence::save_json(
            &p.root().join("artifacts").join(format!("{}.json", art.id)),
            &art,
        )
        .unwrap();

        let loaded = p.load_artifacts().unwrap();
        assert!((loaded[0].quality_score - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_heads_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = StorePersistence::open(dir.path()).unwrap();
        let pairs = vec![("ns".to_string(), "art-1".to_string())];
        p.save_heads(&pairs).unwrap();
        assert_eq!(p.load_heads().unwrap(), pairs);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = StorePersistence::open(dir.path()).unwrap();
        std::fs::write(
            dir.path().join("index").join("heads.json"),
            r#"{"version": 99, "data": []}"#,
        )
        .unwrap();

        let err = p.load_heads().unwrap_err();
        assert!(matches!(err, StoreError::Incompatible { found: 99, .. }));
    }

    #[test]
    fn test_missing_version_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = StorePersistence::open(dir.path()).unwrap();
        std::fs::write(
            dir.path().join("index").join("heads.json"),
            r#"{"data": []}"#,
        )
        .unwrap();
        assert!(matches!(
            p.load_heads().unwrap_err(),
            StoreError::Incompatible { found: 0, .. }
        ));
    }

    #[test]
    fn test_wipe() {
        let dir = tempfile::tempdir().unwrap();
        let p = StorePersistence::open(dir.path()).unwrap();
        p.save_artifact(&sample_artifact()).unwrap();
        p.wipe().unwrap();
        assert!(p.load_artifacts().unwrap().is_empty());
        // Layout survives the wipe.
        assert!(p.root().join("artifacts").is_dir());
    }
}
