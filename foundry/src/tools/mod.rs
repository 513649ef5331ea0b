//! Tool registry — namespaced tools with fitness-based selection.
//!
//! Descriptors are loaded once from a TOML file and held behind an atomic
//! snapshot pointer; they stay immutable until an explicit reload. Live
//! fitness (quality score, failure log) is a separate mutable ledger so
//! `record_failure`/`record_success` never touch the descriptor set.

pub mod selection;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifact::quality;
use crate::artifact::ArtifactInterface;
use crate::error::{EngineError, ErrorKind, Severity};
use crate::events::{EngineEvent, SharedEventBus};
pub use selection::{ScenarioQuery, SelectedTool};

/// Cap on the per-tool failure ring buffer.
pub const TOOL_FAILURE_LOG_CAP: usize = 32;

/// Quality floor below which evolution is requested.
pub const EVOLUTION_QUALITY_FLOOR: f64 = 0.50;

/// Kind of tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Llm,
    Executable,
    Workflow,
    Openapi,
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llm => write!(f, "llm"),
            Self::Executable => write!(f, "executable"),
            Self::Workflow => write!(f, "workflow"),
            Self::Openapi => write!(f, "openapi"),
        }
    }
}

/// Kind-specific invocation recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Invocation {
    /// Resolved through the model gateway by abstract role.
    Llm { role: String },
    /// Command template; `{input}` is replaced by the JSON argument file.
    Executable { command_template: String },
    /// Ordered tool ids composed sequentially.
    Workflow { steps: Vec<String> },
    /// HTTP endpoint invocation.
    Openapi { endpoint: String, method: String },
}

impl Invocation {
    /// Split an executable template into argv, substituting `{input}`.
    pub fn executable_argv(&self, input_path: &str) -> Option<Vec<String>> {
        let Invocation::Executable { command_template } = self else {
            return None;
        };
        let rendered = command_template.replace("{input}", input_path);
        shlex::split(&rendered)
    }
}

/// A registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub tool_id: String,
    pub kind: ToolKind,
    /// Abstract role this tool serves (e.g. `translator`).
    pub role: String,
    pub namespace: String,
    #[serde(default)]
    pub interface: ArtifactInterface,
    pub invocation: Invocation,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Whether this tool is the promoted head of its namespace.
    #[serde(default)]
    pub promoted: bool,
    /// Embedding of the tool description, for semantic candidate matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// One recorded tool failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFailure {
    pub scenario_embedding: Vec<f32>,
    pub error_kind: ErrorKind,
    pub severity: Severity,
    pub at: DateTime<Utc>,
}

/// Mutable fitness ledger for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHealth {
    pub quality_score: f64,
    pub failure_log: VecDeque<ToolFailure>,
    pub success_count: u64,
}

impl Default for ToolHealth {
    fn default() -> Self {
        Self {
            quality_score: 0.8,
            failure_log: VecDeque::new(),
            success_count: 0,
        }
    }
}

/// Immutable descriptor snapshot.
#[derive(Debug, Default)]
pub struct ToolSet {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolSet {
    pub fn from_descriptors(descriptors: Vec<ToolDescriptor>) -> Self {
        Self {
            tools: descriptors
                .into_iter()
                .map(|d| (d.tool_id.clone(), d))
                .collect(),
        }
    }

    pub fn get(&self, tool_id: &str) -> Option<&ToolDescriptor> {
        self.tools.get(tool_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }

    pub fn in_namespace<'a>(
        &'a self,
        namespace: &'a str,
    ) -> impl Iterator<Item = &'a ToolDescriptor> {
        self.tools.values().filter(move |t| t.namespace == namespace)
    }

    pub fn head_of(&self, namespace: &str) -> Option<&ToolDescriptor> {
        self.tools
            .values()
            .filter(|t| t.namespace == namespace && t.promoted)
            .min_by(|a, b| a.tool_id.cmp(&b.tool_id))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolsFile {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
}

/// The registry: atomic descriptor snapshot + mutable health ledger.
pub struct ToolRegistry {
    snapshot: RwLock<Arc<ToolSet>>,
    health: RwLock<HashMap<String, ToolHealth>>,
    events: Option<SharedEventBus>,
    /// Floor below which selection requests evolution.
    min_usable: f64,
}

impl ToolRegistry {
    pub fn new(set: ToolSet, min_usable: f64, events: Option<SharedEventBus>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(set)),
            health: RwLock::new(HashMap::new()),
            events,
            min_usable,
        }
    }

    pub fn empty() -> Self {
        Self::new(ToolSet::default(), 0.40, None)
    }

    /// Load descriptors from a TOML file. Unknown keys are rejected.
    pub fn load_file(
        path: &Path,
        min_usable: f64,
        events: Option<SharedEventBus>,
    ) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let file: ToolsFile = toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("invalid tools file: {e}")))?;
        info!(count = file.tools.len(), path = %path.display(), "loaded tool descriptors");
        Ok(Self::new(
            ToolSet::from_descriptors(file.tools),
            min_usable,
            events,
        ))
    }

    /// Swap in a new descriptor set. Readers see old or new, never a mix.
    pub fn reload(&self, set: ToolSet) {
        if let Ok(mut snapshot) = self.snapshot.write() {
            *snapshot = Arc::new(set);
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<ToolSet> {
        self.snapshot
            .read()
            .map(|s| Arc::clone(&s))
            .unwrap_or_default()
    }

    /// Health of a tool (default-initialized when unrecorded).
    pub fn health_of(&self, tool_id: &str) -> ToolHealth {
        self.health
            .read()
            .ok()
            .and_then(|h| h.get(tool_id).cloned())
            .unwrap_or_default()
    }

    /// Best tool for a namespace, optionally conditioned on a scenario.
    ///
    /// With no scenario the promoted head is returned directly.
    pub fn get(&self, namespace: &str, scenario: Option<&ScenarioQuery>) -> Option<SelectedTool> {
        let snapshot = self.snapshot();
        let selected = {
            let health = self.health.read().ok()?;
            selection::select(&snapshot, &health, namespace, scenario, self.min_usable)?
        };
        if selected.evolution_requested {
            self.request_evolution(
                namespace,
                &selected.descriptor.tool_id,
                &format!("no candidate above min_usable {:.2}", self.min_usable),
            );
        }
        Some(selected)
    }

    /// Record a failure against a tool; may trigger evolution.
    pub fn record_failure(
        &self,
        tool_id: &str,
        scenario_embedding: Vec<f32>,
        error_kind: ErrorKind,
        severity: Severity,
    ) {
        let quality_after = {
            let Ok(mut health) = self.health.write() else {
                return;
            };
            let entry = health.entry(tool_id.to_string()).or_default();
            if entry.failure_log.len() >= TOOL_FAILURE_LOG_CAP {
                entry.failure_log.pop_front();
            }
            entry.failure_log.push_back(ToolFailure {
                scenario_embedding,
                error_kind,
                severity,
                at: Utc::now(),
            });
            let delta = match severity {
                Severity::Low => 0.01,
                Severity::Medium => 0.05,
                Severity::High => 0.10,
            };
            entry.quality_score = quality::clamp(entry.quality_score - delta);
            entry.quality_score
        };

        if quality_after < EVOLUTION_QUALITY_FLOOR {
            let namespace = self
                .snapshot()
                .get(tool_id)
                .map(|t| t.namespace.clone())
                .unwrap_or_default();
            self.request_evolution(
                &namespace,
                tool_id,
                &format!("quality {quality_after:.2} below {EVOLUTION_QUALITY_FLOOR:.2}"),
            );
        }
    }

    /// Record a success, recovering a bounded amount of fitness.
    pub fn record_success(&self, tool_id: &str) {
        if let Ok(mut health) = self.health.write() {
            let entry = health.entry(tool_id.to_string()).or_default();
            entry.success_count += 1;
            entry.quality_score = quality::clamp(entry.quality_score + 0.01);
        }
    }

    fn request_evolution(&self, namespace: &str, tool_id: &str, reason: &str) {
        info!(namespace, tool_id, reason, "evolution requested");
        if let Some(bus) = &self.events {
            bus.publish(EngineEvent::EvolutionRequested {
                namespace: namespace.to_string(),
                tool_id: tool_id.to_string(),
                reason: reason.to_string(),
                at: Utc::now(),
            });
        }
    }
}
