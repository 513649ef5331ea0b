//! Engine configuration — one declarative TOML file.
//!
//! Every option is typed here; `deny_unknown_fields` rejects anything the
//! engine does not recognize. All sections default sensibly, so an empty
//! file is a valid configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::EngineError;
use crate::classifier::ClassifierThresholds;
use crate::runner::ResourceLimits;
use crate::validator::checks::{
    ForbiddenCallValidator, IoContractValidator, SelfImportValidator, SourceSizeValidator,
    SyntaxBalanceValidator,
};
use crate::validator::{Validator, ValidatorOutcome, ValidatorPipeline};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    pub llm: LlmConfig,
    /// Tier groups with escalation chains, e.g.
    /// `model_tiers.repair.tier_1 = { model = "...", ... }`.
    pub model_tiers: BTreeMap<String, BTreeMap<String, TierSpec>>,
    pub execution: ExecutionConfig,
    pub classifier: ClassifierConfig,
    pub static_analysis: StaticAnalysisConfig,
    pub autofix: AutofixConfig,
    pub generation: GenerationConfig,
    pub store: StoreConfig,
    pub background: BackgroundConfig,
}

impl EngineConfig {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let config: EngineConfig =
            toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), EngineError> {
        self.store
            .ann_kind
            .parse::<crate::store::vector::AnnKind>()
            .map_err(EngineError::Config)?;
        if self.generation.parallel.max_variants == 0 {
            return Err(EngineError::Config(
                "generation.parallel.max_variants must be at least 1".into(),
            ));
        }
        let weights =
            self.generation.parallel.quality_weight + self.generation.parallel.speed_weight;
        if weights <= 0.0 {
            return Err(EngineError::Config(
                "generation.parallel weights must sum to a positive value".into(),
            ));
        }
        Ok(())
    }

    /// Sandbox limits from the execution section.
    pub fn default_limits(&self) -> ResourceLimits {
        ResourceLimits {
            wall_ms: self.execution.default_timeout_ms,
            cpu_seconds: None,
            mem_mb: Some(self.execution.memory_limit_mb),
            output_bytes: self.execution.output_bytes_max,
        }
    }

    /// Classifier thresholds from the classifier section.
    pub fn classifier_thresholds(&self) -> ClassifierThresholds {
        ClassifierThresholds {
            same: self.classifier.thresholds.same,
            related: self.classifier.thresholds.related,
            ..Default::default()
        }
    }

    /// Build the validator pipeline from the static-analysis section.
    pub fn validator_pipeline(&self) -> ValidatorPipeline {
        let toggles = &self.static_analysis.validators;
        let mut validators: Vec<Box<dyn Validator>> = Vec::new();
        for name in ["self_import", "syntax_balance", "io_contract", "forbidden_call", "source_size"]
        {
            let toggle = toggles.iter().find(|t| t.name == name);
            if toggle.map(|t| t.enabled).unwrap_or(true) {
                let inner = builtin_by_name(name);
                validators.push(match toggle {
                    Some(t) => Box::new(ConfiguredValidator {
                        inner,
                        priority: t.priority,
                        autofix: t.autofix,
                    }),
                    None => inner,
                });
            }
        }
        ValidatorPipeline::new(validators, self.autofix.max_attempts)
    }
}

fn builtin_by_name(name: &str) -> Box<dyn Validator> {
    match name {
        "self_import" => Box::new(SelfImportValidator),
        "syntax_balance" => Box::new(SyntaxBalanceValidator),
        "io_contract" => Box::new(IoContractValidator),
        "forbidden_call" => Box::new(ForbiddenCallValidator),
        _ => Box::new(SourceSizeValidator::default()),
    }
}

/// Wraps a builtin with per-config priority/autofix overrides.
struct ConfiguredValidator {
    inner: Box<dyn Validator>,
    priority: Option<u32>,
    autofix: Option<bool>,
}

impl Validator for ConfiguredValidator {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn priority(&self) -> u32 {
        self.priority.unwrap_or_else(|| self.inner.priority())
    }
    fn category(&self) -> &str {
        self.inner.category()
    }
    fn supports_autofix(&self) -> bool {
        self.autofix.unwrap_or_else(|| self.inner.supports_autofix())
    }
    fn timeout_ms(&self) -> u64 {
        self.inner.timeout_ms()
    }
    fn check(&self, source: &str) -> ValidatorOutcome {
        self.inner.check(source)
    }
}

// ── llm ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LlmConfig {
    /// Default backend for unqualified role lookups.
    pub backend: String,
    pub model_roles: ModelRoles,
    pub backends: BTreeMap<String, BackendConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".into(),
            model_roles: ModelRoles::default(),
            backends: BTreeMap::new(),
        }
    }
}

/// Abstract role → concrete model id.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModelRoles {
    pub fast: String,
    pub base: String,
    pub powerful: String,
    pub god: String,
    pub embedding: String,
}

impl Default for ModelRoles {
    fn default() -> Self {
        Self {
            fast: "qwen2.5-coder:1.5b".into(),
            base: "qwen2.5-coder:7b".into(),
            powerful: "qwen2.5-coder:32b".into(),
            god: "deepseek-r1:70b".into(),
            embedding: "nomic-embed-text".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackendConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Name of the environment variable carrying the API key; keys are
    /// never written into configuration.
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
    pub max_concurrent: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:11434/v1".into(),
            api_key_env: None,
            timeout_ms: 60_000,
            max_concurrent: 4,
        }
    }
}

/// One tier inside a tier group.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierSpec {
    pub model: String,
    pub context_window: u32,
    /// Per-call timeout in milliseconds.
    pub timeout: u64,
    #[serde(default)]
    pub escalates_to: Option<String>,
}

// ── execution ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutionConfig {
    pub default_timeout_ms: u64,
    pub memory_limit_mb: u64,
    pub output_bytes_max: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 600_000,
            memory_limit_mb: 512,
            output_bytes_max: 1_048_576,
        }
    }
}

// ── classifier ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClassifierConfig {
    pub thresholds: ThresholdConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ThresholdConfig {
    pub same: f32,
    pub related: f32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            same: 0.92,
            related: 0.75,
        }
    }
}

// ── static analysis ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StaticAnalysisConfig {
    pub validators: Vec<ValidatorToggle>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorToggle {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub autofix: Option<bool>,
}

fn default_true() -> bool {
    true
}

// ── autofix ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AutofixConfig {
    pub max_attempts: u32,
    pub age_decay_enabled: bool,
}

impl Default for AutofixConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            age_decay_enabled: false,
        }
    }
}

// ── generation ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GenerationConfig {
    pub parallel: ParallelConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ParallelConfig {
    pub max_variants: usize,
    pub quality_weight: f64,
    pub speed_weight: f64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_variants: 5,
            quality_weight: 0.7,
            speed_weight: 0.3,
        }
    }
}

// ── store ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    pub embedding_dim: usize,
    pub ann_kind: String,
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 384,
            ann_kind: "flat".into(),
            path: PathBuf::from("./crucible-store"),
        }
    }
}

// ── background ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackgroundConfig {
    /// Optimizer cadence, seconds.
    pub interval: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self { interval: 300 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_valid() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config.llm.backend, "ollama");
        assert_eq!(config.generation.parallel.max_variants, 5);
        assert_eq!(config.classifier.thresholds.same, 0.92);
        assert_eq!(config.background.interval, 300);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = EngineConfig::parse("unknown_section = 1\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let nested = EngineConfig::parse("[llm]\nsurprise = true\n").unwrap_err();
        assert!(matches!(nested, EngineError::Config(_)));
    }

    #[test]
    fn test_full_config_parses() {
        let raw = r#"
[llm]
backend = "openai"

[llm.model_roles]
fast = "gpt-4o-mini"
base = "gpt-4o"
powerful = "gpt-4o"
god = "o1"
embedding = "text-embedding-3-small"

[llm.backends.openai]
base_url = "https://api.openai.com/v1"
api_key_env = "OPENAI_API_KEY"
timeout_ms = 30000
max_concurrent = 8

[model_tiers.repair.tier_1]
model = "gpt-4o-mini"
context_window = 128000
timeout = 30000
escalates_to = "tier_2"

[model_tiers.repair.tier_2]
model = "gpt-4o"
context_window = 128000
timeout = 60000

[execution]
default_timeout_ms = 120000
memory_limit_mb = 256
output_bytes_max = 65536

[classifier.thresholds]
same = 0.95
related = 0.80

[[static_analysis.validators]]
name = "self_import"
priority = 120

[[static_analysis.validators]]
name = "forbidden_call"
enabled = false

[autofix]
max_attempts = 5
age_decay_enabled = true

[generation.parallel]
max_variants = 3
quality_weight = 0.6
speed_weight = 0.4

[store]
embedding_dim = 768
ann_kind = "flat"
path = "/tmp/crucible-store"

[background]
interval = 60
"#;
        let config = EngineConfig::parse(raw).unwrap();
        assert_eq!(config.llm.backend, "openai");
        assert_eq!(
            config.llm.backends["openai"].api_key_env.as_deref(),
            Some("OPENAI_API_KEY")
        );
        assert_eq!(
            config.model_tiers["repair"]["tier_1"].escalates_to.as_deref(),
            Some("tier_2")
        );
        assert_eq!(config.default_limits().wall_ms, 120_000);
        assert_eq!(config.classifier_thresholds().same, 0.95);
        assert_eq!(config.autofix.max_attempts, 5);
        assert_eq!(config.store.embedding_dim, 768);
    }

    #[test]
    fn test_unknown_ann_kind_rejected() {
        let err = EngineConfig::parse("[store]\nann_kind = \"hnsw9000\"\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_zero_variants_rejected() {
        let err =
            EngineConfig::parse("[generation.parallel]\nmax_variants = 0\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_validator_pipeline_respects_toggles() {
        let raw = r#"
[[static_analysis.validators]]
name = "forbidden_call"
enabled = false

[[static_analysis.validators]]
name = "self_import"
priority = 10
"#;
        let config = EngineConfig::parse(raw).unwrap();
        let pipeline = config.validator_pipeline();
        let names = pipeline.validator_names();
        assert!(!names.contains(&"forbidden_call"));
        // Priority 10 pushes self_import to the back.
        assert_eq!(*names.last().unwrap(), "self_import");
    }

    #[test]
    fn test_default_pipeline_has_all_builtins() {
        let config = EngineConfig::parse("").unwrap();
        let names = config.validator_pipeline().validator_names().join(",");
        assert_eq!(
            names,
            "self_import,syntax_balance,io_contract,forbidden_call,source_size"
        );
    }
}
