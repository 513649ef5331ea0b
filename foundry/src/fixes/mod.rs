//! Auto-fix cache — proven `error_signature → patch` patterns.
//!
//! Queried before any repair model is invoked. Fixes are applied
//! speculatively (the patched source re-enters validation and tests) and
//! enter the cache only after a first confirmed success. Ranking favors
//! proven usage over marginal similarity: `usage_count × 10 + similarity
//! + success_rate`, with optional age decay.

pub mod signature;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::persist::StorePersistence;
use crate::store::StoreError;
pub use signature::ErrorSignature;

/// Weight that makes a proven fix dominate a marginally-more-similar one.
const USAGE_WEIGHT: f64 = 10.0;

/// A source-to-source patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transform", rename_all = "snake_case")]
pub enum PatchTransform {
    /// Replace every occurrence of a literal.
    Replace { find: String, replace: String },
    /// Regex replacement over the whole source.
    RegexReplace { pattern: String, replacement: String },
    /// Drop every line containing the needle.
    DropLines { containing: String },
}

impl PatchTransform {
    /// Apply to `source`. Returns `None` when the transform does not
    /// touch the source (inapplicable fixes are skipped, not recorded
    /// as failures).
    pub fn apply(&self, source: &str) -> Option<String> {
        match self {
            Self::Replace { find, replace } => {
                if !source.contains(find.as_str()) {
                    return None;
                }
                Some(source.replace(find.as_str(), replace))
            }
            Self::RegexReplace {
                pattern,
                replacement,
            } => {
                let re = Regex::new(pattern).ok()?;
                if !re.is_match(source) {
                    return None;
                }
                Some(re.replace_all(source, replacement.as_str()).into_owned())
            }
            Self::DropLines { containing } => {
                if !source.contains(containing.as_str()) {
                    return None;
                }
                let kept: Vec<&str> = source
                    .lines()
                    .filter(|l| !l.contains(containing.as_str()))
                    .collect();
                let mut out = kept.join("\n");
                out.push('\n');
                Some(out)
            }
        }
    }
}

/// Applicability restriction for a fix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixScope {
    /// Glob-lite file pattern (`*` wildcard), e.g. `*.py`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

/// Context a lookup carries for scope filtering.
#[derive(Debug, Clone, Default)]
pub struct FixContext {
    pub file_name: String,
    pub tool_id: Option<String>,
    pub tags: BTreeSet<String>,
}

impl FixScope {
    pub fn matches(&self, ctx: &FixContext) -> bool {
        if let Some(pattern) = &self.file_pattern {
            if !glob_lite(pattern, &ctx.file_name) {
                return false;
            }
        }
        if let Some(tool) = &self.tool_id {
            if ctx.tool_id.as_deref() != Some(tool.as_str()) {
                return false;
            }
        }
        self.tags.is_subset(&ctx.tags)
    }
}

fn glob_lite(pattern: &str, name: &str) -> bool {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{escaped}$"))
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

/// A stored fix pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixPattern {
    pub id: String,
    pub error_signature: ErrorSignature,
    /// Hash of the broken source the fix was first derived from.
    pub broken_fingerprint: String,
    pub patch: PatchTransform,
    pub scope: FixScope,
    pub usage_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl FixPattern {
    /// Build a new pattern (not yet admitted to the cache).
    pub fn new(
        signature: ErrorSignature,
        broken_source: &str,
        patch: PatchTransform,
        scope: FixScope,
    ) -> Self {
        let now = Utc::now();
        let mut hasher = blake3::Hasher::new();
        hasher.update(signature.normalized_message.as_bytes());
        hasher.update(signature.error_site_hash.as_bytes());
        hasher.update(
            serde_json::to_string(&patch)
                .unwrap_or_default()
                .as_bytes(),
        );
        Self {
            id: format!("fix-{}", &hasher.finalize().to_hex()[..32]),
            error_signature: signature,
            broken_fingerprint: blake3::hash(broken_source.as_bytes()).to_hex()[..16].to_string(),
            patch,
            scope,
            usage_count: 0,
            success_count: 0,
            failure_count: 0,
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    fn score(&self, query: &ErrorSignature, age_decay: bool, now: DateTime<Utc>) -> f64 {
        let similarity = self.error_signature.similarity(query);
        let mut score = self.usage_count as f64 * USAGE_WEIGHT + similarity + self.success_rate();
        if age_decay {
            let age_days = (now - self.last_used_at).num_days().max(0) as f64;
            score *= 1.0 / (1.0 + age_days / 30.0);
        }
        score
    }
}

/// The cache. Multiple fixes per signature are permitted; the ranker
/// selects.
pub struct FixCache {
    fixes: RwLock<HashMap<String, FixPattern>>,
    dir: Option<PathBuf>,
    age_decay_enabled: bool,
}

impl FixCache {
    pub fn in_memory(age_decay_enabled: bool) -> Self {
        Self {
            fixes: RwLock::new(HashMap::new()),
            dir: None,
            age_decay_enabled,
        }
    }

    /// Load patterns from a `fixes/` directory.
    pub fn open(dir: impl Into<PathBuf>, age_decay_enabled: bool) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let patterns: Vec<FixPattern> = StorePersistence::load_json_dir(&dir)?;
        Ok(Self {
            fixes: RwLock::new(patterns.into_iter().map(|f| (f.id.clone(), f)).collect()),
            dir: Some(dir),
            age_decay_enabled,
        })
    }

    pub fn len(&self) -> usize {
        self.fixes.read().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<FixPattern> {
        self.fixes.read().ok()?.get(id).cloned()
    }

    /// Ranked candidate fixes for a signature within a context.
    pub fn lookup(
        &self,
        signature: &ErrorSignature,
        context: &FixContext,
        top_k: usize,
    ) -> Vec<FixPattern> {
        let Ok(fixes) = self.fixes.read() else {
            return Vec::new();
        };
        let now = Utc::now();
        let mut candidates: Vec<(&FixPattern, f64)> = fixes
            .values()
            .filter(|f| f.error_signature.error_kind == signature.error_kind)
            .filter(|f| f.scope.matches(context))
            .map(|f| (f, f.score(signature, self.age_decay_enabled, now)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        candidates.sort_by(|(_, a), (_, b)| {
            b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
            .into_iter()
            .take(top_k)
            .map(|(f, _)| f.clone())
            .collect()
    }

    /// Admit a pattern after its first confirmed success.
    pub fn admit(&self, mut fix: FixPattern) -> Option<String> {
        fix.usage_count = fix.usage_count.max(1);
        fix.success_count = fix.success_count.max(1);
        let id = fix.id.clone();
        if let Ok(mut fixes) = self.fixes.write() {
            let entry = fixes.entry(id.clone()).or_insert(fix);
            self.persist(entry);
            Some(id)
        } else {
            None
        }
    }

    /// Record a speculative application outcome.
    pub fn record(&self, id: &str, success: bool) {
        let Ok(mut fixes) = self.fixes.write() else {
            return;
        };
        if let Some(fix) = fixes.get_mut(id) {
            fix.usage_count += 1;
            if success {
                fix.success_count += 1;
            } else {
                fix.failure_count += 1;
            }
            fix.last_used_at = Utc::now();
            self.persist(fix);
        }
    }

    fn persist(&self, fix: &FixPattern) {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.json", fix.id));
            if let Err(e) = StorePersistence::save_json(&path, fix) {
                warn!(fix = %fix.id, error = %e, "failed to persist fix pattern");
            }
        }
    }
}
